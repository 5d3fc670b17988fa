//! CLI argument parsing for Panopticon

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "panopticon")]
#[command(version)]
#[command(about = "Post-process continuation-aware execution traces (Chrome Trace Event Format)", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Give every duration a fixed width so the trace shows control flow only
    Flatten {
        /// Trace file, complete or streamed
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,

        /// Trace given inline instead of as a file
        #[arg(long, value_name = "TEXT")]
        text: Option<String>,

        /// Write the result here instead of stdout
        #[arg(short, long, value_name = "OUT")]
        output: Option<PathBuf>,
    },

    /// Close a streamed trace so that any JSON reader accepts it
    Repair {
        /// Streamed trace file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Write the result here instead of stdout
        #[arg(short, long, value_name = "OUT")]
        output: Option<PathBuf>,
    },
}
