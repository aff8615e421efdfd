use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::{info, warn};

use deepcarve::{cli, config::ExtractionConfig, handlers, logging, processing};

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("deepcarve failed: {err:#}");
            2
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32> {
    let opts = cli::parse();
    logging::init_logging(opts.verbose);

    let mut files = Vec::with_capacity(opts.files.len());
    for path in &opts.files {
        let resolved: PathBuf = path
            .canonicalize()
            .with_context(|| format!("cannot access input {}", path.display()))?;
        files.push(resolved);
    }

    std::fs::create_dir_all(&opts.extract_root).with_context(|| {
        format!(
            "cannot create extraction directory {}",
            opts.extract_root.display()
        )
    })?;
    let extract_root = opts.extract_root.canonicalize()?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || {
            warn!("shutdown requested; letting in-flight tasks finish");
            cancel.store(true, Ordering::Relaxed);
        })
        .context("cannot install signal handler")?;
    }

    let config = ExtractionConfig {
        extract_root,
        max_depth: opts.depth as usize,
        entropy_depth: opts.entropy_depth as usize,
        entropy_plot: opts.verbose >= 3,
        process_num: opts.process_num as usize,
        keep_extracted_chunks: opts.keep_extracted_chunks,
        handlers: handlers::builtin_handlers(),
    };

    info!(
        "starting extract_root={} depth={} process_num={}",
        config.extract_root.display(),
        config.max_depth,
        config.process_num
    );

    let reports = processing::process_paths(&config, &files, cancel);

    if let Some(report_path) = &opts.report {
        let json = serde_json::to_string_pretty(&reports)?;
        std::fs::write(report_path, json)
            .with_context(|| format!("cannot write report to {}", report_path.display()))?;
        info!("report written path={}", report_path.display());
    }

    info!("deepcarve run finished report_count={}", reports.len());
    Ok(reports.exit_code())
}
