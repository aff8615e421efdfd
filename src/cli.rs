use std::path::PathBuf;

use clap::Parser;

use crate::config::{DEFAULT_DEPTH, default_process_num};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A tool for getting information out of any kind of binary blob."
)]
pub struct CliOptions {
    /// Input files to process
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Extract the files to this directory. Will be created if it doesn't exist.
    #[arg(short = 'e', long = "extract-dir", default_value = ".")]
    pub extract_root: PathBuf,

    /// Recursion depth. How deep should we extract containers.
    #[arg(short = 'd', long, default_value_t = DEFAULT_DEPTH as u64,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub depth: u64,

    /// Entropy calculation depth. 1 means input files only, 0 turns it off.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub entropy_depth: u64,

    /// Number of worker processes to process files parallelly.
    #[arg(short = 'p', long, default_value_t = default_process_num() as u64,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub process_num: u64,

    /// Keep extracted chunks
    #[arg(short = 'k', long)]
    pub keep_extracted_chunks: bool,

    /// Write the aggregated reports as JSON to this path
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Verbose logging; -vv for trace, -vvv also draws entropy plots
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

pub fn parse() -> CliOptions {
    CliOptions::parse()
}
