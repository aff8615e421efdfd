//! Pattern search over a blob and dispatch to handler validators.
//!
//! Raw matches for every priority tier are collected in one streaming pass
//! over the file (fixed windows with enough overlap that no pattern is lost
//! at a boundary). Validation then runs tier by tier: higher tiers go first
//! and their accepted chunks mask candidate offsets for the tiers below.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use memchr::memmem;
use tracing::{debug, warn};

use crate::chunk::{Chunk, ValidChunk};
use crate::handler::{CompiledPattern, Handler, HandlerError, Handlers, PatternError};
use crate::pool::TaskResult;
use crate::report::Report;

const SCAN_WINDOW_SIZE: usize = 8 * 1024 * 1024;

/// A valid chunk resolved to its owning handler.
#[derive(Clone)]
pub struct ResolvedChunk {
    pub valid: ValidChunk,
    pub handler: Arc<dyn Handler>,
    /// Tier index the handler was registered under; lower is higher priority.
    pub priority: usize,
}

impl ResolvedChunk {
    pub fn chunk(&self) -> &Chunk {
        &self.valid.chunk
    }
}

impl std::fmt::Debug for ResolvedChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedChunk")
            .field("chunk", &self.valid.chunk.range_hex())
            .field("handler", &self.handler.name())
            .field("is_encrypted", &self.valid.is_encrypted)
            .finish()
    }
}

struct PatternEntry {
    tier: usize,
    handler_pos: usize,
    pattern: CompiledPattern,
}

/// Scan `file` with every handler pattern and validate the candidates.
///
/// Output order is tier-major; callers sort as needed.
pub fn search_chunks_by_priority(
    path: &Path,
    file: &mut File,
    size: u64,
    handlers: &Handlers,
    result: &mut TaskResult,
) -> Result<Vec<ResolvedChunk>, HandlerError> {
    let entries = compile_patterns(handlers).map_err(|err| {
        HandlerError::Io(std::io::Error::other(format!(
            "handler pattern failed to compile: {err}"
        )))
    })?;
    if entries.is_empty() || size == 0 {
        return Ok(Vec::new());
    }

    let tier_count = handlers.by_priority().len();
    let raw_matches = scan_file(file, size, &entries, tier_count)?;

    let mut resolved: Vec<ResolvedChunk> = Vec::new();
    for (tier, tier_handlers) in handlers.by_priority().iter().enumerate() {
        let mut matches = raw_matches[tier].clone();
        // Within a tier the first-registered handler wins an offset tie.
        matches.sort_unstable();
        matches.dedup_by_key(|(offset, _)| *offset);

        let masked_until = resolved.len();
        for (offset, handler_pos) in matches {
            if resolved[..masked_until]
                .iter()
                .any(|accepted| accepted.chunk().contains_offset(offset))
            {
                continue;
            }

            let handler = &tier_handlers[handler_pos];
            let candidate = offset as i64 + handler.match_offset();
            if candidate < 0 || candidate as u64 >= size {
                debug!(
                    "match offset adjustment out of bounds handler={} offset=0x{:x}",
                    handler.name(),
                    offset
                );
                continue;
            }

            match handler.calculate_chunk(file, candidate as u64) {
                Ok(Some(valid)) => {
                    if valid.chunk.end_offset() > size {
                        warn!(
                            "chunk exceeds file bounds handler={} chunk={} size=0x{:x}",
                            handler.name(),
                            valid.chunk,
                            size
                        );
                        result.add_report(Report::chunk_out_of_bounds(
                            path,
                            valid.chunk.range_hex(),
                            size,
                        ));
                        continue;
                    }
                    debug!(
                        "found valid chunk handler={} chunk={}",
                        handler.name(),
                        valid.chunk
                    );
                    resolved.push(ResolvedChunk {
                        valid,
                        handler: Arc::clone(handler),
                        priority: tier,
                    });
                }
                Ok(None) => {}
                Err(HandlerError::InvalidInputFormat(err)) => {
                    debug!(
                        "chunk validation failed handler={} offset=0x{:x} err={}",
                        handler.name(),
                        candidate,
                        err
                    );
                }
                Err(HandlerError::Io(err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    debug!(
                        "header truncated handler={} offset=0x{:x}",
                        handler.name(),
                        candidate
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    Ok(resolved)
}

fn compile_patterns(handlers: &Handlers) -> Result<Vec<PatternEntry>, PatternError> {
    let mut entries = Vec::new();
    for (tier, tier_handlers) in handlers.by_priority().iter().enumerate() {
        for (handler_pos, handler) in tier_handlers.iter().enumerate() {
            for hex in handler.patterns() {
                entries.push(PatternEntry {
                    tier,
                    handler_pos,
                    pattern: hex.compile()?,
                });
            }
        }
    }
    Ok(entries)
}

/// One pass over the file. Returns `(absolute_offset, handler_pos)` pairs
/// bucketed per tier.
fn scan_file(
    file: &mut File,
    size: u64,
    entries: &[PatternEntry],
    tier_count: usize,
) -> Result<Vec<Vec<(u64, usize)>>, HandlerError> {
    let max_len = entries.iter().map(|e| e.pattern.len()).max().unwrap_or(1);
    let overlap = max_len.saturating_sub(1);
    let stride = SCAN_WINDOW_SIZE;

    let mut matches = vec![Vec::new(); tier_count];
    let mut window = vec![0u8; stride + overlap];
    let mut pos = 0u64;

    while pos < size {
        file.seek(SeekFrom::Start(pos))?;
        let len = read_up_to(file, &mut window)?;
        if len == 0 {
            break;
        }
        let data = &window[..len];
        // Matches starting in the overlap tail belong to the next window.
        let valid_len = if pos + len as u64 >= size { len } else { stride };

        for entry in entries {
            match &entry.pattern {
                CompiledPattern::Literal(needle) => {
                    for idx in memmem::find_iter(data, needle) {
                        if idx < valid_len {
                            matches[entry.tier].push((pos + idx as u64, entry.handler_pos));
                        }
                    }
                }
                CompiledPattern::Wildcard { regex, .. } => {
                    for found in regex.find_iter(data) {
                        if found.start() < valid_len {
                            matches[entry.tier]
                                .push((pos + found.start() as u64, entry.handler_pos));
                        }
                    }
                }
            }
        }

        pos += stride as u64;
    }

    Ok(matches)
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        let n = file.read(&mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(read)
}
