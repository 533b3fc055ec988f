use std::io::{IsTerminal, Write};
use std::path::Path;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use gpudrv_device::Mode;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ModeOutput<'a> {
    socket: String,
    mode: &'a str,
    value: u8,
    changed: bool,
}

pub fn print_mode(path: &Path, mode: Mode, changed: bool, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ModeOutput {
            socket: path.display().to_string(),
            mode: mode.as_str(),
            value: mode.as_u8(),
            changed,
        }),
        OutputFormat::Table => print_table(
            vec!["SOCKET", "MODE", "VALUE"],
            vec![
                path.display().to_string(),
                mode.as_str().to_string(),
                mode.as_u8().to_string(),
            ],
        ),
        OutputFormat::Pretty => println!("mode={} ({})", mode, mode.as_u8()),
        OutputFormat::Raw => println!("{mode}"),
    }
}

#[derive(Serialize)]
struct SubmitOutput<'a> {
    socket: String,
    written: usize,
    result_size: Option<usize>,
    result: Option<String>,
    vecadd: Option<&'a VecAddSummary>,
}

/// First, second and last element of a vector-add result.
#[derive(Debug, Clone, Serialize)]
pub struct VecAddSummary {
    pub n: usize,
    pub first: f32,
    pub second: f32,
    pub last: f32,
}

/// What `submit` sent and, with `--wait`, what came back.
pub struct SubmitReport<'a> {
    pub path: &'a Path,
    pub written: usize,
    pub result: Option<&'a [u8]>,
    pub vecadd: Option<VecAddSummary>,
}

pub fn print_submit(report: &SubmitReport<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&SubmitOutput {
            socket: report.path.display().to_string(),
            written: report.written,
            result_size: report.result.map(<[u8]>::len),
            result: report
                .result
                .filter(|_| report.vecadd.is_none())
                .map(payload_preview),
            vecadd: report.vecadd.as_ref(),
        }),
        OutputFormat::Table => {
            let result = match (&report.vecadd, report.result) {
                (Some(v), _) => vecadd_line(v),
                (None, Some(payload)) => payload_preview(payload),
                (None, None) => "-".to_string(),
            };
            print_table(
                vec!["SOCKET", "WRITTEN", "RESULT"],
                vec![
                    report.path.display().to_string(),
                    report.written.to_string(),
                    result,
                ],
            );
        }
        OutputFormat::Pretty => match (&report.vecadd, report.result) {
            (Some(v), _) => println!("written={} {}", report.written, vecadd_line(v)),
            (None, Some(payload)) => println!(
                "written={} result_size={} result={}",
                report.written,
                payload.len(),
                payload_preview(payload)
            ),
            (None, None) => println!("written={}", report.written),
        },
        OutputFormat::Raw => match (&report.vecadd, report.result) {
            (Some(v), _) => println!("{} {} {}", v.first, v.second, v.last),
            (None, Some(payload)) => print_raw(payload),
            (None, None) => {}
        },
    }
}

#[derive(Serialize)]
struct DaemonOutput<'a> {
    socket: String,
    backend: &'a str,
    processed: usize,
    rejected: usize,
}

pub fn print_daemon_summary(
    path: &Path,
    backend: &str,
    processed: usize,
    rejected: usize,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => print_json(&DaemonOutput {
            socket: path.display().to_string(),
            backend,
            processed,
            rejected,
        }),
        OutputFormat::Table => print_table(
            vec!["SOCKET", "BACKEND", "PROCESSED", "REJECTED"],
            vec![
                path.display().to_string(),
                backend.to_string(),
                processed.to_string(),
                rejected.to_string(),
            ],
        ),
        OutputFormat::Pretty => {
            println!("backend={backend} processed={processed} rejected={rejected}")
        }
        OutputFormat::Raw => println!("{processed}"),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn print_table(header: Vec<&str>, row: Vec<String>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header)
        .add_row(row);
    println!("{table}");
}

fn vecadd_line(v: &VecAddSummary) -> String {
    format!("c[0]={} c[1]={} c[{}]={}", v.first, v.second, v.n.saturating_sub(1), v.last)
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_payloads_are_summarised() {
        assert_eq!(payload_preview(b"ok"), "ok");
        assert_eq!(payload_preview(&[0xff, 0xfe, 0x00]), "<binary 3 bytes>");
    }

    #[test]
    fn vecadd_line_names_last_index() {
        let summary = VecAddSummary {
            n: 8,
            first: 0.0,
            second: 3.0,
            last: 21.0,
        };
        assert_eq!(vecadd_line(&summary), "c[0]=0 c[1]=3 c[7]=21");
    }
}
