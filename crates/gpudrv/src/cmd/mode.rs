use gpudrv_device::DeviceClient;

use crate::cmd::ModeArgs;
use crate::exit::{device_error, CliResult, SUCCESS};
use crate::output::{print_mode, OutputFormat};

pub fn run(args: ModeArgs, format: OutputFormat) -> CliResult<i32> {
    let mut client =
        DeviceClient::connect(&args.path).map_err(|err| device_error("connect failed", err))?;

    let (mode, changed) = match args.set {
        Some(mode) => {
            client
                .set_mode(mode)
                .map_err(|err| device_error("set mode failed", err))?;
            (mode, true)
        }
        None => {
            let mode = client
                .get_mode()
                .map_err(|err| device_error("get mode failed", err))?;
            (mode, false)
        }
    };

    print_mode(&args.path, mode, changed, format);
    Ok(SUCCESS)
}
