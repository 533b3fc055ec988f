use gpudrv_device::{DeviceServer, ServerConfig};
use gpudrv_queue::ManagerConfig;
use tracing::info;

use crate::cmd::{install_ctrlc_handler, parse_duration, parse_octal, ServeArgs};
use crate::exit::{device_error, CliResult, SUCCESS};

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let receive_timeout = args
        .receive_timeout
        .as_deref()
        .map(parse_duration)
        .transpose()?;

    let mut config = ServerConfig {
        socket_mode: parse_octal(&args.mode)?,
        manager: ManagerConfig { receive_timeout },
        initial_mode: args.initial_mode,
        ..ServerConfig::default()
    };
    config.channel.short_read = args.short_read;

    let server = DeviceServer::bind_with_config(&args.path, config)
        .map_err(|err| device_error("bind failed", err))?;

    let stop = server.shutdown_handle();
    install_ctrlc_handler(move || stop.shutdown())?;

    info!(
        path = %args.path.display(),
        short_read = %args.short_read,
        mode = %args.initial_mode,
        "serving"
    );
    server
        .serve()
        .map_err(|err| device_error("serve failed", err))?;
    info!("server stopped");

    Ok(SUCCESS)
}
