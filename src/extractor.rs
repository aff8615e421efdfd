//! Carving chunks out of blobs and running extractors on the results.
//!
//! Carved files live under a per-input `<relpath>_extract` directory and are
//! named by their byte range, e.g. `0x0-0x7d0.gzip` or `0x7d0-0xbb8.unknown`.
//! Extraction output for a carved chunk goes to a `<carved>_extract` sibling.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, warn};

use crate::chunk::UnknownChunk;
use crate::finder::ResolvedChunk;
use crate::handler::{ExtractError, Extractor};
use crate::pool::TaskResult;
use crate::report::Report;

pub const CARVE_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CarveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("extraction directory already exists and is not empty: {}", .0.display())]
    DirExists(PathBuf),
}

/// `extract_root / relpath(path, root) + "_extract"`.
///
/// Fails when the target already exists with content: every blob is
/// extracted exactly once.
pub fn make_extract_dir(
    root: &Path,
    path: &Path,
    extract_root: &Path,
) -> Result<PathBuf, CarveError> {
    let relpath = path.strip_prefix(root).unwrap_or(path);
    let mut name = relpath.to_string_lossy().into_owned();
    name.push_str("_extract");
    let extract_dir = extract_root.join(name);

    if extract_dir.exists() && std::fs::read_dir(&extract_dir)?.next().is_some() {
        return Err(CarveError::DirExists(extract_dir));
    }
    std::fs::create_dir_all(&extract_dir)?;
    debug!("extraction directory created dir={}", extract_dir.display());
    Ok(extract_dir)
}

/// `(carved_path, extract_dir / carved_path.name + "_extract")`.
pub fn get_extract_paths(extract_dir: &Path, carved_path: &Path) -> (PathBuf, PathBuf) {
    let name = carved_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let outdir = extract_dir.join(format!("{name}_extract"));
    (carved_path.to_path_buf(), outdir)
}

/// Copy the chunk bytes to `0x<start>-0x<end>.<handler>` under `extract_dir`.
pub fn carve_valid_chunk(
    extract_dir: &Path,
    file: &mut File,
    chunk: &ResolvedChunk,
    cancel: &AtomicBool,
) -> Result<PathBuf, CarveError> {
    let filename = format!("{}.{}", chunk.chunk().range_hex(), chunk.handler.name());
    let carved_path = extract_dir.join(filename);
    carve(
        &carved_path,
        file,
        chunk.chunk().start_offset(),
        chunk.chunk().end_offset(),
        cancel,
    )?;
    Ok(carved_path)
}

/// Carve every gap region to a `.unknown` file. Chunks smaller than
/// `min_size` are skipped; pass 0 to always carve.
pub fn carve_unknown_chunks(
    extract_dir: &Path,
    file: &mut File,
    chunks: &[UnknownChunk],
    min_size: u64,
    cancel: &AtomicBool,
) -> Result<Vec<PathBuf>, CarveError> {
    let mut carved_paths = Vec::new();
    for unknown in chunks {
        if unknown.chunk.size() < min_size {
            continue;
        }
        let filename = format!("{}.unknown", unknown.chunk.range_hex());
        let carved_path = extract_dir.join(filename);
        carve(
            &carved_path,
            file,
            unknown.chunk.start_offset(),
            unknown.chunk.end_offset(),
            cancel,
        )?;
        carved_paths.push(carved_path);
    }
    Ok(carved_paths)
}

/// Bounded-buffer streamed copy of `[start, end)`; never holds the whole
/// chunk in memory. The cancel flag is polled between buffers.
fn carve(
    carved_path: &Path,
    file: &mut File,
    start: u64,
    end: u64,
    cancel: &AtomicBool,
) -> Result<(), CarveError> {
    let mut writer = BufWriter::new(File::create(carved_path)?);
    let mut buf = vec![0u8; CARVE_BUFFER_SIZE.min((end - start) as usize).max(1)];
    let mut remaining = end - start;

    file.seek(SeekFrom::Start(start))?;
    while remaining > 0 {
        if cancel.load(Ordering::Relaxed) {
            debug!("cancellation requested during carve");
            break;
        }
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    writer.flush()?;
    Ok(())
}

/// Post-extraction clean-up: remove symlinks that point outside `outdir`
/// and re-open permissions so the tree stays traversable. Runs after both
/// successful and failed extraction so partial output is consistent.
pub fn fix_extracted_directory(outdir: &Path, result: &mut TaskResult) {
    if !outdir.exists() {
        return;
    }
    fix_directory_recursive(outdir, outdir, result);
}

fn fix_directory_recursive(outdir: &Path, dir: &Path, result: &mut TaskResult) {
    fix_permissions(dir, true);
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("cannot list extracted directory {}: {err}", dir.display());
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_symlink() {
            match std::fs::read_link(&path) {
                Ok(target) if is_unsafe_link(outdir, &path, &target) => {
                    warn!(
                        "removing unsafe symlink path={} target={}",
                        path.display(),
                        target.display()
                    );
                    result.add_report(Report::unsafe_symlink(&path, &target));
                    if let Err(err) = std::fs::remove_file(&path) {
                        warn!("cannot remove symlink {}: {err}", path.display());
                    }
                }
                Ok(_) => {}
                Err(err) => warn!("cannot read symlink {}: {err}", path.display()),
            }
        } else if file_type.is_dir() {
            fix_directory_recursive(outdir, &path, result);
        } else {
            fix_permissions(&path, false);
        }
    }
}

/// A link is unsafe when absolute or when it resolves above `outdir`.
fn is_unsafe_link(outdir: &Path, link_path: &Path, target: &Path) -> bool {
    if target.is_absolute() {
        return true;
    }
    let base = link_path.parent().unwrap_or(outdir);
    !normalize(&base.join(target)).starts_with(outdir)
}

/// Lexical normalization; the link target may not exist, so the filesystem
/// cannot be asked.
fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut parts = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir => {}
            other => parts.push(other),
        }
    }
    parts
}

#[cfg(unix)]
fn fix_permissions(path: &Path, is_dir: bool) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return;
    };
    let mode = metadata.permissions().mode();
    let wanted = if is_dir { mode | 0o700 } else { mode | 0o600 };
    if wanted != mode {
        if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(wanted)) {
            warn!("cannot fix permissions on {}: {err}", path.display());
        }
    }
}

#[cfg(not(unix))]
fn fix_permissions(_path: &Path, _is_dir: bool) {}

/// Runs an external command with `{inpath}`/`{outdir}` substituted into its
/// argument template.
pub struct CommandExtractor {
    command: &'static str,
    args: Vec<&'static str>,
}

impl CommandExtractor {
    pub fn new(command: &'static str, args: &[&'static str]) -> Self {
        Self {
            command,
            args: args.to_vec(),
        }
    }
}

impl Extractor for CommandExtractor {
    fn get_dependencies(&self) -> Vec<&'static str> {
        vec![self.command]
    }

    fn extract(&self, inpath: &Path, outdir: &Path) -> Result<(), ExtractError> {
        // Placeholders may be embedded in an argument (e.g. 7z's -o<dir>).
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{inpath}", &inpath.to_string_lossy())
                    .replace("{outdir}", &outdir.to_string_lossy())
            })
            .collect();

        debug!("running extractor command={} inpath={}", self.command, inpath.display());
        let output = Command::new(self.command).args(&args).output().map_err(|err| {
            ExtractError::with_report(Report::extract_command_failed(
                self.command,
                format!("failed to run: {err}"),
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "extract command failed command={} status={}",
                self.command, output.status
            );
            return Err(ExtractError::with_report(Report::extract_command_failed(
                self.command,
                format!("{}: {}", output.status, stderr.trim()),
            )));
        }
        Ok(())
    }
}
