//! Extraction run configuration.

use std::path::PathBuf;

use crate::handler::Handlers;

pub const DEFAULT_DEPTH: usize = 10;

pub fn default_process_num() -> usize {
    num_cpus::get()
}

/// Immutable settings for one extraction run. The handler collection
/// travels here; there is no global registry.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub extract_root: PathBuf,
    /// Recursion limit; tasks at or beyond this depth are dropped (>= 1).
    pub max_depth: usize,
    /// Entropy is calculated for unknown chunks of tasks below this depth;
    /// 0 turns it off.
    pub entropy_depth: usize,
    pub entropy_plot: bool,
    pub process_num: usize,
    pub keep_extracted_chunks: bool,
    pub handlers: Handlers,
}
