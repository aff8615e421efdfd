//! Per-file orchestration: search, reconcile, carve, extract, recurse.
//!
//! `process_file` drives the pool for one input; `Processor` is the task
//! boundary (no error crosses it, every task yields a well-formed result);
//! `FileTask` is the state machine for one regular file.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};

use crate::chunk::{InvalidInputFormat, UnknownChunk};
use crate::config::ExtractionConfig;
use crate::entropy::calculate_entropy;
use crate::extractor::{
    CarveError, carve_unknown_chunks, carve_valid_chunk, fix_extracted_directory,
    get_extract_paths, make_extract_dir,
};
use crate::finder::{ResolvedChunk, search_chunks_by_priority};
use crate::handler::{ExtractError, Extractor};
use crate::pool::{Task, TaskHandler, TaskResult, make_pool};
use crate::report::{Report, Reports};

/// Process one input path to completion and return all collected reports.
///
/// Children discovered during extraction are fed back into the pool until
/// the queue drains. The cancel flag stops dispatch of new tasks; in-flight
/// tasks finish and their partial results are kept.
pub fn process_file(config: &ExtractionConfig, path: &Path, cancel: Arc<AtomicBool>) -> Reports {
    let root = if path.is_dir() {
        path.to_path_buf()
    } else {
        path.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| path.to_path_buf())
    };
    let root_task = Task {
        root,
        path: path.to_path_buf(),
        depth: 0,
    };

    let processor = Arc::new(Processor::new(config.clone(), Arc::clone(&cancel)));
    let handler: TaskHandler = {
        let processor = Arc::clone(&processor);
        Arc::new(move |task| processor.process_task(task))
    };

    let pool = make_pool(config.process_num, handler, cancel);
    pool.submit(root_task);

    let mut all_reports = Reports::new();
    pool.process_until_done(|pool, result| {
        let (_task, reports, new_tasks) = result.into_parts();
        for new_task in new_tasks {
            pool.submit(new_task);
        }
        all_reports.extend(reports);
    });
    all_reports
}

pub struct Processor {
    config: ExtractionConfig,
    cancel: Arc<AtomicBool>,
}

impl Processor {
    pub fn new(config: ExtractionConfig, cancel: Arc<AtomicBool>) -> Self {
        Self { config, cancel }
    }

    /// Task boundary: errors never escape, they become `UnknownError`
    /// reports on an otherwise complete result.
    pub fn process_task(&self, task: Task) -> TaskResult {
        let mut result = TaskResult::new(task.clone());
        if let Err(err) = self.process_task_inner(&task, &mut result) {
            error!(
                "unknown error happened path={} err={err:#}",
                task.path.display()
            );
            result.add_report(Report::unknown_error(&task.path, &format!("{err:#}")));
        }
        result
    }

    fn process_task_inner(&self, task: &Task, result: &mut TaskResult) -> anyhow::Result<()> {
        if task.depth >= self.config.max_depth {
            debug!(
                "reached maximum depth, stop further processing path={}",
                task.path.display()
            );
            return Ok(());
        }

        if !valid_path(&task.path) {
            warn!(
                "path contains invalid characters, it won't be processed path={}",
                task.path.display()
            );
            result.add_report(Report::invalid_path(&task.path));
            return Ok(());
        }

        let statres = std::fs::symlink_metadata(&task.path)?;
        let file_type = statres.file_type();

        if file_type.is_dir() {
            debug!("found directory path={}", task.path.display());
            for entry in std::fs::read_dir(&task.path)? {
                result.add_new_task(Task {
                    root: task.root.clone(),
                    path: entry?.path(),
                    depth: task.depth,
                });
            }
            return Ok(());
        }
        if file_type.is_symlink() {
            debug!("ignoring symlink path={}", task.path.display());
            return Ok(());
        }
        if !file_type.is_file() {
            debug!("ignoring special file path={}", task.path.display());
            return Ok(());
        }
        if statres.len() == 0 {
            debug!("ignoring empty file path={}", task.path.display());
            return Ok(());
        }

        FileTask {
            config: &self.config,
            cancel: &self.cancel,
            task,
            size: statres.len(),
        }
        .process(result)
    }
}

struct FileTask<'a> {
    config: &'a ExtractionConfig,
    cancel: &'a AtomicBool,
    task: &'a Task,
    size: u64,
}

impl FileTask<'_> {
    fn process(&self, result: &mut TaskResult) -> anyhow::Result<()> {
        debug!(
            "processing file path={} size={}",
            self.task.path.display(),
            self.size
        );

        let mut file = File::open(&self.task.path)?;
        let all_chunks = search_chunks_by_priority(
            &self.task.path,
            &mut file,
            self.size,
            &self.config.handlers,
            result,
        )?;
        let outer_chunks = resolve_partial_overlaps(remove_inner_chunks(all_chunks));
        let unknown_chunks = calculate_unknown_chunks(&outer_chunks, self.size)?;

        if outer_chunks.is_empty() && unknown_chunks.is_empty() {
            // Whole files are not treated as unknown chunks, but they still
            // get an entropy profile when nothing was recognized in them.
            self.calculate_entropies(std::slice::from_ref(&self.task.path));
            return Ok(());
        }

        let extract_dir = match make_extract_dir(
            &self.task.root,
            &self.task.path,
            &self.config.extract_root,
        ) {
            Ok(dir) => dir,
            Err(CarveError::DirExists(dir)) => {
                error!(
                    "extraction directory exists and is not empty dir={}",
                    dir.display()
                );
                result.add_report(Report::extract_dir_exists(&dir));
                return Ok(());
            }
            Err(CarveError::Io(err)) => return Err(err.into()),
        };

        let carved_unknown_paths =
            carve_unknown_chunks(&extract_dir, &mut file, &unknown_chunks, 0, self.cancel)?;
        self.calculate_entropies(&carved_unknown_paths);

        for chunk in &outer_chunks {
            if self.cancel.load(Ordering::Relaxed) {
                debug!("cancellation requested; leaving remaining chunks");
                result.mark_incomplete();
                break;
            }
            if let Err(err) = self.extract_chunk(&extract_dir, &mut file, chunk, result) {
                error!(
                    "unknown error happened while extracting chunk chunk={} err={err:#}",
                    chunk.chunk()
                );
                result.add_report(Report::unknown_error(&self.task.path, &format!("{err:#}")));
            }
        }
        Ok(())
    }

    fn calculate_entropies<P: AsRef<Path>>(&self, paths: &[P]) {
        if self.task.depth >= self.config.entropy_depth {
            return;
        }
        for path in paths {
            if let Err(err) =
                calculate_entropy(path.as_ref(), self.config.entropy_plot, self.cancel)
            {
                warn!(
                    "entropy calculation failed path={} err={err}",
                    path.as_ref().display()
                );
            }
        }
    }

    fn extract_chunk(
        &self,
        extract_dir: &Path,
        file: &mut File,
        chunk: &ResolvedChunk,
        result: &mut TaskResult,
    ) -> anyhow::Result<()> {
        let carved_path = carve_valid_chunk(extract_dir, file, chunk, self.cancel)?;
        let (inpath, outdir) = get_extract_paths(extract_dir, &carved_path);

        if chunk.valid.is_encrypted {
            warn!(
                "encrypted chunk is not extracted path={} chunk={}",
                inpath.display(),
                chunk.chunk()
            );
            result.add_report(Report::encrypted_chunk(
                &self.task.path,
                chunk.chunk().range_hex(),
            ));
        } else if let Some(extractor) = chunk.handler.extractor() {
            match run_extractor(extractor, &inpath, &outdir) {
                Ok(()) => {
                    if !self.config.keep_extracted_chunks {
                        debug!("removing extracted chunk path={}", inpath.display());
                        if let Err(err) = std::fs::remove_file(&inpath) {
                            warn!("cannot remove carved chunk {}: {err}", inpath.display());
                        }
                    }
                }
                Err(extract_error) => {
                    for report in extract_error.reports {
                        result.add_report(report);
                    }
                }
            }
        } else {
            debug!(
                "skipping extraction, no extractor handler={}",
                chunk.handler.name()
            );
        }

        // Partial output stays consistent even when extraction failed.
        fix_extracted_directory(&outdir, result);

        if outdir.exists() {
            result.add_new_task(Task {
                root: self.config.extract_root.clone(),
                path: outdir,
                depth: self.task.depth + 1,
            });
        }
        Ok(())
    }
}

/// Every blob is extracted once: the output directory must not exist yet.
fn run_extractor(
    extractor: &dyn Extractor,
    inpath: &Path,
    outdir: &Path,
) -> Result<(), ExtractError> {
    std::fs::create_dir(outdir).map_err(|err| {
        ExtractError::with_report(Report::unknown_error(
            outdir,
            &format!("cannot create extraction output directory: {err}"),
        ))
    })?;
    extractor.extract(inpath, outdir)
}

/// Paths with non-UTF-8 components or control characters break downstream
/// tooling and are skipped.
pub fn valid_path(path: &Path) -> bool {
    match path.to_str() {
        Some(text) => !text.chars().any(char::is_control),
        None => false,
    }
}

/// Drop every chunk fully contained in a bigger one. O(n^2), chunk counts
/// per file are small.
pub fn remove_inner_chunks(chunks: Vec<ResolvedChunk>) -> Vec<ResolvedChunk> {
    if chunks.is_empty() {
        return chunks;
    }
    let total = chunks.len();
    let mut by_size = chunks;
    // Stable sort keeps discovery (priority) order among equal sizes.
    by_size.sort_by(|a, b| b.chunk().size().cmp(&a.chunk().size()));

    let mut outer_chunks: Vec<ResolvedChunk> = Vec::new();
    for chunk in by_size {
        if !outer_chunks
            .iter()
            .any(|outer| outer.chunk().contains(chunk.chunk()))
        {
            outer_chunks.push(chunk);
        }
    }
    debug!(
        "removed inner chunks outer_chunk_count={} removed_inner_chunk_count={}",
        outer_chunks.len(),
        total - outer_chunks.len()
    );
    outer_chunks
}

/// Two outer chunks overlapping without containment means handler
/// contention; the higher-priority chunk wins and the loss is logged.
pub fn resolve_partial_overlaps(mut chunks: Vec<ResolvedChunk>) -> Vec<ResolvedChunk> {
    chunks.sort_by_key(|c| c.chunk().start_offset());

    let mut kept: Vec<ResolvedChunk> = Vec::new();
    'next_chunk: for chunk in chunks {
        while let Some(prev) = kept.last() {
            if chunk.chunk().start_offset() >= prev.chunk().end_offset() {
                break;
            }
            if chunk.priority < prev.priority {
                error!(
                    "overlapping chunks, dropping lower priority chunk={} kept={}",
                    prev.chunk(),
                    chunk.chunk()
                );
                kept.pop();
            } else {
                error!(
                    "overlapping chunks, dropping lower priority chunk={} kept={}",
                    chunk.chunk(),
                    prev.chunk()
                );
                continue 'next_chunk;
            }
        }
        kept.push(chunk);
    }
    kept
}

/// Gaps between the outer chunks, tiling `[0, file_size)` together with
/// them.
pub fn calculate_unknown_chunks(
    chunks: &[ResolvedChunk],
    file_size: u64,
) -> Result<Vec<UnknownChunk>, InvalidInputFormat> {
    if chunks.is_empty() || file_size == 0 {
        return Ok(Vec::new());
    }

    let mut sorted_by_offset: Vec<_> = chunks.iter().map(|c| *c.chunk()).collect();
    sorted_by_offset.sort_by_key(|c| c.start_offset());

    let mut unknown_chunks = Vec::new();

    let first = &sorted_by_offset[0];
    if first.start_offset() > 0 {
        unknown_chunks.push(UnknownChunk::new(0, first.start_offset())?);
    }

    for pair in sorted_by_offset.windows(2) {
        if pair[1].start_offset() > pair[0].end_offset() {
            unknown_chunks.push(UnknownChunk::new(
                pair[0].end_offset(),
                pair[1].start_offset(),
            )?);
        }
    }

    let last = &sorted_by_offset[sorted_by_offset.len() - 1];
    if last.end_offset() < file_size {
        unknown_chunks.push(UnknownChunk::new(last.end_offset(), file_size)?);
    }

    Ok(unknown_chunks)
}

/// Convenience for `main`: the count log line lives here so library users
/// get it too.
pub fn process_paths(
    config: &ExtractionConfig,
    paths: &[std::path::PathBuf],
    cancel: Arc<AtomicBool>,
) -> Reports {
    info!("start processing files count={}", paths.len());
    let mut all_reports = Reports::new();
    for path in paths {
        all_reports.extend(process_file(config, path, Arc::clone(&cancel)));
    }
    all_reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ValidChunk;
    use crate::handler::{Handler, HandlerError, HexString};

    struct NullHandler;

    impl Handler for NullHandler {
        fn name(&self) -> &'static str {
            "null"
        }

        fn patterns(&self) -> &[HexString] {
            &[]
        }

        fn calculate_chunk(
            &self,
            _file: &mut File,
            _start_offset: u64,
        ) -> Result<Option<ValidChunk>, HandlerError> {
            Ok(None)
        }
    }

    fn resolved(start: u64, end: u64, priority: usize) -> ResolvedChunk {
        ResolvedChunk {
            valid: ValidChunk::new(start, end).unwrap(),
            handler: Arc::new(NullHandler),
            priority,
        }
    }

    fn ranges(chunks: &[ResolvedChunk]) -> Vec<(u64, u64)> {
        chunks
            .iter()
            .map(|c| (c.chunk().start_offset(), c.chunk().end_offset()))
            .collect()
    }

    #[test]
    fn contained_chunk_is_removed() {
        let outer = remove_inner_chunks(vec![resolved(100, 500, 0), resolved(150, 400, 1)]);
        assert_eq!(ranges(&outer), vec![(100, 500)]);
    }

    #[test]
    fn disjoint_chunks_all_survive() {
        let outer = remove_inner_chunks(vec![
            resolved(3000, 4096, 1),
            resolved(0, 2000, 0),
            resolved(2000, 2500, 0),
        ]);
        assert_eq!(outer.len(), 3);
    }

    #[test]
    fn equal_bounds_chunks_both_survive_inner_removal() {
        let outer = remove_inner_chunks(vec![resolved(100, 500, 0), resolved(100, 500, 1)]);
        assert_eq!(outer.len(), 2);
    }

    #[test]
    fn partial_overlap_keeps_higher_priority() {
        let kept = resolve_partial_overlaps(vec![resolved(0, 300, 1), resolved(200, 600, 0)]);
        assert_eq!(ranges(&kept), vec![(200, 600)]);

        let kept = resolve_partial_overlaps(vec![resolved(0, 300, 0), resolved(200, 600, 1)]);
        assert_eq!(ranges(&kept), vec![(0, 300)]);
    }

    #[test]
    fn unknown_chunks_tile_the_gaps() {
        let chunks = vec![resolved(2000, 3000, 0), resolved(0, 1000, 0)];
        let unknown = calculate_unknown_chunks(&chunks, 4096).unwrap();
        let gaps: Vec<_> = unknown
            .iter()
            .map(|u| (u.chunk.start_offset(), u.chunk.end_offset()))
            .collect();
        assert_eq!(gaps, vec![(1000, 2000), (3000, 4096)]);
    }

    #[test]
    fn no_gap_at_flush_edges() {
        let chunks = vec![resolved(0, 2048, 0), resolved(2048, 4096, 0)];
        let unknown = calculate_unknown_chunks(&chunks, 4096).unwrap();
        assert!(unknown.is_empty());
    }

    #[test]
    fn leading_gap_only_when_first_chunk_starts_late() {
        let chunks = vec![resolved(512, 4096, 0)];
        let unknown = calculate_unknown_chunks(&chunks, 4096).unwrap();
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].chunk.start_offset(), 0);
        assert_eq!(unknown[0].chunk.end_offset(), 512);
    }

    #[test]
    fn unknown_chunks_empty_for_no_chunks_or_empty_file() {
        assert!(calculate_unknown_chunks(&[], 4096).unwrap().is_empty());
        assert!(
            calculate_unknown_chunks(&[resolved(0, 10, 0)], 0)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn reconciliation_is_order_invariant() {
        let build = |order: &[usize]| -> Vec<(u64, u64)> {
            let pool = [
                resolved(0, 2000, 0),
                resolved(150, 400, 1),
                resolved(3000, 4096, 1),
            ];
            let chunks: Vec<_> = order.iter().map(|&i| pool[i].clone()).collect();
            calculate_unknown_chunks(&remove_inner_chunks(chunks), 4096)
                .unwrap()
                .iter()
                .map(|u| (u.chunk.start_offset(), u.chunk.end_offset()))
                .collect()
        };

        let expected = build(&[0, 1, 2]);
        assert_eq!(expected, build(&[2, 1, 0]));
        assert_eq!(expected, build(&[1, 2, 0]));
        assert_eq!(expected, vec![(2000, 3000)]);
    }

    #[test]
    fn outer_and_unknown_chunks_tile_exactly() {
        let chunks = vec![resolved(100, 800, 0), resolved(1000, 1500, 0)];
        let outer = remove_inner_chunks(chunks);
        let unknown = calculate_unknown_chunks(&outer, 2000).unwrap();

        let mut all: Vec<(u64, u64)> = outer
            .iter()
            .map(|c| (c.chunk().start_offset(), c.chunk().end_offset()))
            .chain(
                unknown
                    .iter()
                    .map(|u| (u.chunk.start_offset(), u.chunk.end_offset())),
            )
            .collect();
        all.sort_unstable();

        let mut cursor = 0;
        for (start, end) in all {
            assert_eq!(start, cursor, "no overlap, no gap");
            cursor = end;
        }
        assert_eq!(cursor, 2000);
    }

    #[test]
    fn path_validity() {
        assert!(valid_path(Path::new("/tmp/firmware.bin")));
        assert!(valid_path(Path::new("relative/with spaces")));
        assert!(!valid_path(Path::new("bad\u{7}name")));
        assert!(!valid_path(Path::new("bad\nname")));
    }
}
