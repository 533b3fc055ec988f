use gpudrv_compute::{decode_f32s, encode_vecadd_job};
use gpudrv_device::DeviceClient;
use gpudrv_frame::MAX_FRAME_SIZE;
use tracing::debug;

use crate::cmd::{parse_duration, SubmitArgs};
use crate::exit::{compute_error, device_error, io_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};
use crate::output::{print_submit, OutputFormat, SubmitReport, VecAddSummary};

pub fn run(args: SubmitArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = payload_from_args(&args)?;
    let wait_timeout = if args.wait {
        Some(parse_duration(&args.wait_timeout)?)
    } else {
        None
    };

    let mut client =
        DeviceClient::connect(&args.path).map_err(|err| device_error("connect failed", err))?;
    let written = client
        .submit(&payload)
        .map_err(|err| device_error("submit failed", err))?;
    debug!(written, "job submitted");

    let result = match wait_timeout {
        Some(timeout) => Some(
            client
                .take_result(MAX_FRAME_SIZE, Some(timeout))
                .map_err(|err| device_error("wait for result failed", err))?,
        ),
        None => None,
    };

    let vecadd = match (args.vecadd, &result) {
        (Some(n), Some(frame)) => Some(summarise_vecadd(n, &frame.payload)?),
        _ => None,
    };

    print_submit(
        &SubmitReport {
            path: &args.path,
            written,
            result: result.as_ref().map(|frame| frame.payload.as_ref()),
            vecadd,
        },
        format,
    );
    Ok(SUCCESS)
}

fn payload_from_args(args: &SubmitArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return std::fs::read(path)
            .map_err(|err| io_error(&format!("read {}", path.display()), err));
    }
    if let Some(n) = args.vecadd {
        if n == 0 {
            return Err(CliError::new(USAGE, "--vecadd needs at least one element"));
        }
        return Ok(vecadd_job(n));
    }
    Err(CliError::new(
        USAGE,
        "one of --data, --file or --vecadd is required",
    ))
}

/// `a[i] = i`, `b[i] = 2i`, so `c[i] = 3i`.
fn vecadd_job(n: usize) -> Vec<u8> {
    let a: Vec<f32> = (0..n).map(|i| i as f32).collect();
    let b: Vec<f32> = a.iter().map(|v| v * 2.0).collect();
    encode_vecadd_job(&a, &b)
}

fn summarise_vecadd(n: usize, payload: &[u8]) -> CliResult<VecAddSummary> {
    let c = decode_f32s(payload).map_err(|err| compute_error("decode result failed", err))?;
    if c.len() != n {
        return Err(CliError::new(
            DATA_INVALID,
            format!("result has {} elements, expected {n}", c.len()),
        ));
    }
    let first = c[0];
    Ok(VecAddSummary {
        n,
        first,
        second: c.get(1).copied().unwrap_or(first),
        last: c[n - 1],
    })
}
