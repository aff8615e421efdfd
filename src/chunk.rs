//! Byte-range model for discovered artifacts.
//!
//! A chunk is a half-open `[start, end)` range within a blob. Validated
//! chunks come out of a handler's `calculate_chunk`; unknown chunks are the
//! gaps left between them.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid input format: {0}")]
pub struct InvalidInputFormat(pub String);

/// Half-open byte range `[start_offset, end_offset)` within a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    start_offset: u64,
    end_offset: u64,
}

impl Chunk {
    pub fn new(start_offset: u64, end_offset: u64) -> Result<Self, InvalidInputFormat> {
        if start_offset >= end_offset {
            return Err(InvalidInputFormat(format!(
                "chunk start 0x{start_offset:x} is not below end 0x{end_offset:x}"
            )));
        }
        Ok(Self {
            start_offset,
            end_offset,
        })
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Index of the first byte after the chunk.
    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    pub fn size(&self) -> u64 {
        self.end_offset - self.start_offset
    }

    /// `0x<start>-0x<end>`, lowercase, unpadded. Used in carved file names.
    pub fn range_hex(&self) -> String {
        format!("0x{:x}-0x{:x}", self.start_offset, self.end_offset)
    }

    /// Strict on the start so that equal-bounds chunks do not contain each
    /// other.
    pub fn contains(&self, other: &Chunk) -> bool {
        self.start_offset < other.start_offset && self.end_offset >= other.end_offset
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        self.start_offset <= offset && offset < self.end_offset
    }
}

impl std::fmt::Display for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.range_hex())
    }
}

/// A chunk a handler has validated as a specific artifact type.
///
/// Bounds plus the encryption verdict only; the finder pairs it with its
/// owning handler when it accepts the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidChunk {
    pub chunk: Chunk,
    pub is_encrypted: bool,
}

impl ValidChunk {
    pub fn new(start_offset: u64, end_offset: u64) -> Result<Self, InvalidInputFormat> {
        Ok(Self {
            chunk: Chunk::new(start_offset, end_offset)?,
            is_encrypted: false,
        })
    }

    pub fn with_encryption(mut self, is_encrypted: bool) -> Self {
        self.is_encrypted = is_encrypted;
        self
    }
}

/// Gap between valid chunks. Not extracted, only carved and analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownChunk {
    pub chunk: Chunk,
}

impl UnknownChunk {
    pub fn new(start_offset: u64, end_offset: u64) -> Result<Self, InvalidInputFormat> {
        Ok(Self {
            chunk: Chunk::new(start_offset, end_offset)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_inverted_ranges() {
        assert!(Chunk::new(0, 0).is_err());
        assert!(Chunk::new(10, 10).is_err());
        assert!(Chunk::new(10, 5).is_err());
        assert!(Chunk::new(0, 1).is_ok());
    }

    #[test]
    fn size_and_range_hex() {
        let chunk = Chunk::new(0x10, 0x1000).unwrap();
        assert_eq!(chunk.size(), 0xff0);
        assert_eq!(chunk.range_hex(), "0x10-0x1000");
    }

    #[test]
    fn containment_is_strict_on_start() {
        let outer = Chunk::new(100, 500).unwrap();
        let inner = Chunk::new(150, 400).unwrap();
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));

        // Equal bounds: neither contains the other.
        let twin = Chunk::new(100, 500).unwrap();
        assert!(!outer.contains(&twin));
        assert!(!twin.contains(&outer));

        // Same start, shorter tail is not contained either.
        let same_start = Chunk::new(100, 300).unwrap();
        assert!(!outer.contains(&same_start));
    }

    #[test]
    fn contains_offset_is_half_open() {
        let chunk = Chunk::new(10, 20).unwrap();
        assert!(!chunk.contains_offset(9));
        assert!(chunk.contains_offset(10));
        assert!(chunk.contains_offset(19));
        assert!(!chunk.contains_offset(20));
    }

    #[test]
    fn valid_chunk_defaults_to_plaintext() {
        let valid = ValidChunk::new(0, 8).unwrap();
        assert!(!valid.is_encrypted);
        assert!(valid.with_encryption(true).is_encrypted);
    }
}
