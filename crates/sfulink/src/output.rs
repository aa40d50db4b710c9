use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use serde_json::Value;
use sfulink_worker::{BackendKind, Worker};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
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
struct WorkerRow {
    id: u64,
    pid: u32,
    backend: &'static str,
    state: &'static str,
}

impl WorkerRow {
    fn from_worker(worker: &Worker) -> Self {
        Self {
            id: worker.id(),
            pid: worker.pid(),
            backend: match worker.backend_kind() {
                BackendKind::Process => "process",
                BackendKind::Native => "native",
            },
            state: worker.state().as_str(),
        }
    }
}

fn json_line(value: &impl Serialize) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

pub fn print_workers(workers: &[Worker], format: OutputFormat) {
    let rows: Vec<WorkerRow> = workers.iter().map(WorkerRow::from_worker).collect();
    match format {
        OutputFormat::Json => println!("{}", json_line(&rows)),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ID", "PID", "BACKEND", "STATE"]);
            for row in &rows {
                table.add_row(vec![
                    row.id.to_string(),
                    row.pid.to_string(),
                    row.backend.to_string(),
                    row.state.to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for row in &rows {
                println!(
                    "worker id={} pid={} backend={} state={}",
                    row.id, row.pid, row.backend, row.state
                );
            }
        }
    }
}

pub fn print_dump(worker: &Worker, dump: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                json_line(&serde_json::json!({ "pid": worker.pid(), "dump": dump }))
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("worker {} dump:", worker.pid());
            println!(
                "{}",
                serde_json::to_string_pretty(dump).unwrap_or_else(|_| dump.to_string())
            );
        }
    }
}

#[derive(Serialize)]
struct ArgsOutput<'a> {
    program: &'a str,
    args: &'a [String],
    mediasoup_version: &'a str,
}

pub fn print_args(program: &str, args: &[String], version: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ArgsOutput {
                program,
                args,
                mediasoup_version: version,
            };
            println!("{}", json_line(&out));
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["#", "ARGUMENT"]);
            table.add_row(vec!["0".to_string(), program.to_string()]);
            for (idx, arg) in args.iter().enumerate() {
                table.add_row(vec![(idx + 1).to_string(), arg.clone()]);
            }
            println!("{table}");
            println!("MEDIASOUP_VERSION={version}");
        }
        OutputFormat::Pretty => {
            println!("MEDIASOUP_VERSION={version} {program} {}", args.join(" "));
        }
    }
}
