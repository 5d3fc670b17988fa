use anyhow::{Context, Result};
use clap::Parser;
use panopticon::cli::{Cli, Command};
use panopticon::post::{self, FlattenInput};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Pretty-print `document` to `output`, or stdout
fn write_json(document: &Value, output: Option<&Path>) -> Result<()> {
    let text = serde_json::to_string_pretty(document)?;
    match output {
        Some(path) => fs::write(path, text + "\n")
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{}", text),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    match args.command {
        Command::Flatten { file, text, output } => {
            let input = FlattenInput {
                file,
                text,
                json: None,
            };
            let flattened = post::flatten(input)?;
            write_json(&flattened, output.as_deref())
        }
        Command::Repair { file, output } => {
            let document = post::read_trace(&file)?;
            write_json(&document, output.as_deref())
        }
    }
}
