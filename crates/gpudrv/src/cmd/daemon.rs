use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gpudrv_compute::{ComputeBackend, VecAddBackend};
use gpudrv_device::{DeviceClient, DeviceError};
use gpudrv_frame::FrameError;
use gpudrv_queue::QueueError;
use tracing::{info, warn};

use crate::cmd::{install_ctrlc_handler, DaemonArgs};
use crate::exit::{compute_error, device_error, CliResult, SUCCESS};
use crate::output::{print_daemon_summary, OutputFormat};

pub fn run(args: DaemonArgs, format: OutputFormat) -> CliResult<i32> {
    let mut client =
        DeviceClient::connect(&args.path).map_err(|err| device_error("connect failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    let closer = client
        .closer()
        .map_err(|err| device_error("connect failed", err))?;
    {
        let running = Arc::clone(&running);
        install_ctrlc_handler(move || {
            running.store(false, Ordering::SeqCst);
            closer.close();
        })?;
    }

    let mut backend = VecAddBackend::new();
    backend
        .init()
        .map_err(|err| compute_error("backend init failed", err))?;

    let outcome = serve_jobs(&mut client, &mut backend, &args, &running);
    backend.cleanup();
    let (processed, rejected) = outcome?;

    print_daemon_summary(&args.path, backend.name(), processed, rejected, format);
    Ok(SUCCESS)
}

fn serve_jobs(
    client: &mut DeviceClient,
    backend: &mut dyn ComputeBackend,
    args: &DaemonArgs,
    running: &AtomicBool,
) -> CliResult<(usize, usize)> {
    let mut processed = 0usize;
    let mut rejected = 0usize;

    while running.load(Ordering::SeqCst) {
        if args.count.is_some_and(|count| processed >= count) {
            break;
        }

        let job = match client.take_job(args.max_frame) {
            Ok(job) => job,
            Err(_) if !running.load(Ordering::SeqCst) => break,
            Err(err) if stops_daemon(&err) => {
                info!(error = %err, "device closed, stopping");
                break;
            }
            Err(err) => return Err(device_error("take job failed", err)),
        };

        let output = match backend.run_job(&job.payload) {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, size = job.len(), "job rejected");
                rejected += 1;
                continue;
            }
        };

        if let Err(err) = client.publish(&output) {
            if !running.load(Ordering::SeqCst) || stops_daemon(&err) {
                warn!(error = %err, "result lost, device closed");
                break;
            }
            return Err(device_error("publish failed", err));
        }
        processed += 1;
        info!(
            n = processed,
            kernel_ms = backend.last_profile().kernel_ms,
            "processed"
        );
    }

    Ok((processed, rejected))
}

fn stops_daemon(err: &DeviceError) -> bool {
    matches!(
        err,
        DeviceError::Queue(QueueError::Cancelled | QueueError::Closed)
            | DeviceError::Frame(FrameError::ConnectionClosed)
    )
}
