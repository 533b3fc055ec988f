use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use gpudrv_device::{Mode, ShortReadPolicy};
use gpudrv_frame::MAX_FRAME_SIZE;

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod daemon;
pub mod mode;
pub mod serve;
pub mod submit;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host the broker channel on a Unix domain socket.
    Serve(ServeArgs),
    /// Run the compute consumer: take jobs, run them, publish results.
    Daemon(DaemonArgs),
    /// Submit one job and optionally wait for its result.
    Submit(SubmitArgs),
    /// Show or change the device mode.
    Mode(ModeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Daemon(args) => daemon::run(args, format),
        Command::Submit(args) => submit::run(args, format),
        Command::Mode(args) => mode::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    #[arg(env = "GPUDRV_SOCKET")]
    pub path: PathBuf,
    /// Permission bits for the socket file, in octal.
    #[arg(long, default_value = "600")]
    pub mode: String,
    /// What a read into a too-small buffer does with the entry.
    #[arg(long, default_value_t = ShortReadPolicy::Retain)]
    pub short_read: ShortReadPolicy,
    /// Bound on how long a read waits for a submission (e.g. 5s, 500ms).
    #[arg(long)]
    pub receive_timeout: Option<String>,
    /// Mode the device starts in.
    #[arg(long, default_value_t = Mode::Gpu)]
    pub initial_mode: Mode,
}

#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Socket path to connect to.
    #[arg(env = "GPUDRV_SOCKET")]
    pub path: PathBuf,
    /// Exit after processing N jobs.
    #[arg(long)]
    pub count: Option<usize>,
    /// Largest job frame accepted, header included.
    #[arg(long, default_value_t = MAX_FRAME_SIZE)]
    pub max_frame: usize,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Socket path to connect to.
    #[arg(env = "GPUDRV_SOCKET")]
    pub path: PathBuf,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["file", "vecadd"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["data", "vecadd"])]
    pub file: Option<PathBuf>,
    /// Build a vector-add job of N elements per operand.
    #[arg(long, value_name = "N", conflicts_with_all = ["data", "file"])]
    pub vecadd: Option<usize>,
    /// Wait for one result and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the result when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct ModeArgs {
    /// Socket path to connect to.
    #[arg(env = "GPUDRV_SOCKET")]
    pub path: PathBuf,
    /// New mode (cpu, gpu, hybrid or its number).
    #[arg(long)]
    pub set: Option<Mode>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

pub(crate) fn parse_octal(input: &str) -> CliResult<u32> {
    let digits = input.trim().trim_start_matches("0o");
    let mode = u32::from_str_radix(digits, 8)
        .map_err(|_| CliError::new(USAGE, format!("invalid octal mode: {input}")))?;
    if mode > 0o777 {
        return Err(CliError::new(USAGE, format!("mode out of range: {input}")));
    }
    Ok(mode)
}

pub(crate) fn install_ctrlc_handler(handler: impl FnMut() + Send + 'static) -> CliResult<()> {
    ctrlc::set_handler(handler).map_err(|err| {
        CliError::new(INTERNAL, format!("signal handler setup failed: {err}"))
    })
}
