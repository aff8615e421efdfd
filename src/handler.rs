//! Handler contract: how a file format is recognized, sized and extracted.
//!
//! A handler declares byte patterns for the finder, validates candidate
//! offsets into [`ValidChunk`]s and optionally carries an extractor for the
//! carved result. Handlers are grouped into priority tiers; the collection
//! is immutable and travels inside the extraction config instead of any
//! global registry.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::chunk::{InvalidInputFormat, ValidChunk};
use crate::report::Report;

/// YARA-style hex pattern: whitespace-separated byte tokens, `??` matching
/// any byte, e.g. `"50 4b 03 04"` or `"1f 8b 08 ?? ?? ?? ?? ?? ?? 03"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HexString(pub &'static str);

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid hex pattern token {0:?}")]
    InvalidToken(String),
    #[error("empty hex pattern")]
    Empty,
    #[error("pattern regex failed to build: {0}")]
    Regex(#[from] regex::Error),
}

/// Compiled form of a [`HexString`]. Literal patterns are scanned with
/// `memchr::memmem`; wildcard patterns fall back to a byte regex.
#[derive(Debug, Clone)]
pub enum CompiledPattern {
    Literal(Vec<u8>),
    Wildcard { regex: regex::bytes::Regex, len: usize },
}

impl CompiledPattern {
    pub fn len(&self) -> usize {
        match self {
            CompiledPattern::Literal(bytes) => bytes.len(),
            CompiledPattern::Wildcard { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HexString {
    pub fn compile(&self) -> Result<CompiledPattern, PatternError> {
        let mut tokens = Vec::new();
        for token in self.0.split_whitespace() {
            if token == "??" {
                tokens.push(None);
            } else if token.len() == 2 && token.chars().all(|c| c.is_ascii_hexdigit()) {
                let byte = hex::decode(token)
                    .map_err(|_| PatternError::InvalidToken(token.to_string()))?[0];
                tokens.push(Some(byte));
            } else {
                return Err(PatternError::InvalidToken(token.to_string()));
            }
        }
        if tokens.is_empty() {
            return Err(PatternError::Empty);
        }

        if tokens.iter().all(Option::is_some) {
            return Ok(CompiledPattern::Literal(
                tokens.into_iter().flatten().collect(),
            ));
        }

        let mut expr = String::from("(?s-u)");
        for token in &tokens {
            match token {
                Some(byte) => expr.push_str(&format!("\\x{byte:02x}")),
                None => expr.push('.'),
            }
        }
        Ok(CompiledPattern::Wildcard {
            regex: regex::bytes::Regex::new(&expr)?,
            len: tokens.len(),
        })
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    InvalidInputFormat(#[from] InvalidInputFormat),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extraction failed; any reports describing why ride along with the error.
#[derive(Debug, Error, Default)]
#[error("extraction failed")]
pub struct ExtractError {
    pub reports: Vec<Report>,
}

impl ExtractError {
    pub fn with_report(report: Report) -> Self {
        Self {
            reports: vec![report],
        }
    }
}

/// Converts a carved artifact into its contained files, usually by running
/// an external command.
pub trait Extractor: Send + Sync {
    /// External command names this extractor needs on PATH.
    fn get_dependencies(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn extract(&self, inpath: &Path, outdir: &Path) -> Result<(), ExtractError>;
}

/// One file format: recognition patterns, chunk validation and optional
/// extraction.
pub trait Handler: Send + Sync {
    /// Unique identifier, used in carved file names.
    fn name(&self) -> &'static str;

    fn patterns(&self) -> &[HexString];

    /// Signed adjustment added to raw match offsets to locate the artifact's
    /// true start (e.g. the tar magic sits in the middle of the header).
    fn match_offset(&self) -> i64 {
        0
    }

    fn extractor(&self) -> Option<&dyn Extractor> {
        None
    }

    /// Parse the format header at `start_offset` and compute the chunk
    /// bounds. `Ok(None)` discards the candidate silently;
    /// `InvalidInputFormat` discards it with a debug log.
    fn calculate_chunk(
        &self,
        file: &mut File,
        start_offset: u64,
    ) -> Result<Option<ValidChunk>, HandlerError>;
}

/// Immutable ordered collection of handler priority tiers.
#[derive(Clone, Default)]
pub struct Handlers {
    by_priority: Vec<Vec<Arc<dyn Handler>>>,
}

impl Handlers {
    pub fn new(by_priority: Vec<Vec<Arc<dyn Handler>>>) -> Self {
        Self { by_priority }
    }

    /// New collection with `tier` at highest priority; `self` is unchanged.
    pub fn with_prepended(&self, tier: Vec<Arc<dyn Handler>>) -> Self {
        if tier.is_empty() {
            return self.clone();
        }
        let mut by_priority = Vec::with_capacity(self.by_priority.len() + 1);
        by_priority.push(tier);
        by_priority.extend(self.by_priority.iter().cloned());
        Self { by_priority }
    }

    pub fn by_priority(&self) -> &[Vec<Arc<dyn Handler>>] {
        &self.by_priority
    }

    /// All handlers in (tier, intra-tier) order.
    pub fn flat(&self) -> impl Iterator<Item = &Arc<dyn Handler>> {
        self.by_priority.iter().flatten()
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tiers: Vec<Vec<&str>> = self
            .by_priority
            .iter()
            .map(|tier| tier.iter().map(|h| h.name()).collect())
            .collect();
        f.debug_struct("Handlers").field("tiers", &tiers).finish()
    }
}
