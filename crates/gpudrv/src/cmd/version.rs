use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("gpudrv {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: gpudrv");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target: {}", option_env!("GPUDRV_BUILD_TARGET").unwrap_or("unknown"));
    println!("profile: {}", option_env!("GPUDRV_BUILD_PROFILE").unwrap_or("unknown"));
    println!("target_os: {}", std::env::consts::OS);
    println!("max_payload: {}", gpudrv_frame::MAX_PAYLOAD);
    println!("features: compute={}, cli=true", cfg!(feature = "compute"));

    Ok(SUCCESS)
}
