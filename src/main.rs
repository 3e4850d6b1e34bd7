//! Despachar CLI - inspect and run device-program execution plans
//!
//! # Commands
//!
//! - `plan` - Assemble a program description and print the dispatch listing
//! - `run` - Assemble and execute once on the in-process backend
//!
//! Program descriptions are JSON arrays of operations:
//!
//! ```json
//! [
//!   { "kind": "custom-call", "payload": "kernel-a" },
//!   { "kind": "built-in", "capturable": false }
//! ]
//! ```

use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use despachar::{
    assemble, CommandBufferConfig, InProcessBackend, MemorySink, OpKind, Operation, Program,
    Runtime,
};

/// Despachar - device-program execution runtime
#[derive(Parser)]
#[command(name = "despachar")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble a program and print its dispatch listing
    Plan {
        /// Path to a JSON program description (stdin if omitted)
        #[arg(value_name = "FILE")]
        input: Option<PathBuf>,

        /// Minimum capturable run length to batch into a command buffer
        #[arg(long, default_value_t = despachar::plan::DEFAULT_MIN_BATCH_SIZE)]
        min_batch_size: usize,
    },
    /// Assemble a program and execute it once on the in-process backend
    Run {
        /// Path to a JSON program description (stdin if omitted)
        #[arg(value_name = "FILE")]
        input: Option<PathBuf>,

        /// Minimum capturable run length to batch into a command buffer
        #[arg(long, default_value_t = despachar::plan::DEFAULT_MIN_BATCH_SIZE)]
        min_batch_size: usize,

        /// Print kernel lifecycle events as JSON lines
        #[arg(long)]
        events: bool,
    },
}

/// One operation in a JSON program description.
#[derive(Debug, Deserialize)]
struct OpDesc {
    kind: OpKind,
    #[serde(default = "default_capturable")]
    capturable: bool,
    #[serde(default)]
    payload: String,
}

fn default_capturable() -> bool {
    true
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Plan {
            input,
            min_batch_size,
        } => {
            let program = load_program(input.as_deref())?;
            let plan = assemble(
                program,
                &CommandBufferConfig::with_min_batch_size(min_batch_size),
            );
            print!("{plan}");
            Ok(())
        }
        Commands::Run {
            input,
            min_batch_size,
            events,
        } => {
            let program = load_program(input.as_deref())?;
            let sink = Arc::new(MemorySink::new());
            let runtime = Runtime::new(
                program,
                &CommandBufferConfig::with_min_batch_size(min_batch_size),
                InProcessBackend::new(),
                sink.clone(),
            );

            let mut trace = Vec::new();
            let report = runtime.execute(&mut trace)?;
            println!(
                "executed {} operations in {} dispatch units ({} command buffers)",
                report.operations, report.units, report.command_buffers
            );
            println!("dispatch order: {trace:?}");

            runtime.destroy()?;
            if events {
                for event in sink.events() {
                    println!("{}", serde_json::to_string(&event)?);
                }
            }
            Ok(())
        }
    }
}

fn load_program(input: Option<&std::path::Path>) -> Result<Program, Box<dyn std::error::Error>> {
    let text = match input {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let descs: Vec<OpDesc> = serde_json::from_str(&text)?;
    let ops = descs
        .into_iter()
        .map(|desc| {
            let op = match desc.kind {
                OpKind::CustomCall => Operation::custom_call(desc.payload.into_bytes()),
                OpKind::BuiltIn => Operation::built_in(),
            };
            op.capturable(desc.capturable)
        })
        .collect();

    Ok(Program::new(ops)?)
}
