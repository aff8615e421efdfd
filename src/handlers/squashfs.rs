//! SquashFS v4 image handler.

use std::fs::File;

use crate::chunk::{InvalidInputFormat, ValidChunk};
use crate::extractor::CommandExtractor;
use crate::handler::{Extractor, Handler, HandlerError, HexString};
use crate::handlers::{le_u16, le_u64, read_exact_at};

// "hsqs", little-endian magic
const SQUASHFS_PATTERNS: [HexString; 1] = [HexString("68 73 71 73")];

const SUPERBLOCK_LEN: usize = 96;
const VERSION_MAJOR_OFFSET: usize = 28;
const BYTES_USED_OFFSET: usize = 40;

pub struct SquashFsHandler {
    extractor: CommandExtractor,
}

impl SquashFsHandler {
    pub fn new() -> Self {
        Self {
            extractor: CommandExtractor::new("unsquashfs", &["-f", "-d", "{outdir}", "{inpath}"]),
        }
    }
}

impl Default for SquashFsHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for SquashFsHandler {
    fn name(&self) -> &'static str {
        "squashfs"
    }

    fn patterns(&self) -> &[HexString] {
        &SQUASHFS_PATTERNS
    }

    fn extractor(&self) -> Option<&dyn Extractor> {
        Some(&self.extractor)
    }

    fn calculate_chunk(
        &self,
        file: &mut File,
        start_offset: u64,
    ) -> Result<Option<ValidChunk>, HandlerError> {
        let mut superblock = [0u8; SUPERBLOCK_LEN];
        read_exact_at(file, start_offset, &mut superblock)?;

        let version_major = le_u16(&superblock, VERSION_MAJOR_OFFSET);
        if version_major != 4 {
            return Err(InvalidInputFormat(format!(
                "unsupported squashfs major version {version_major}"
            ))
            .into());
        }

        let bytes_used = le_u64(&superblock, BYTES_USED_OFFSET);
        if bytes_used < SUPERBLOCK_LEN as u64 {
            return Err(InvalidInputFormat("squashfs bytes_used below superblock".into()).into());
        }

        Ok(Some(ValidChunk::new(
            start_offset,
            start_offset + bytes_used,
        )?))
    }
}
