//! XZ stream handler.
//!
//! Header and footer both carry a CRC32 over their payload fields, so a
//! candidate stream end is only accepted when its footer checksum verifies
//! and the footer repeats the header's stream flags at a 4-byte aligned
//! stream length. A stray `YZ` in the compressed data fails the checksum
//! and the scan continues.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use memchr::memmem;

use crate::chunk::{InvalidInputFormat, ValidChunk};
use crate::extractor::CommandExtractor;
use crate::handler::{Extractor, Handler, HandlerError, HexString};
use crate::handlers::{le_u32, read_exact_at};

const XZ_PATTERNS: [HexString; 1] = [HexString("fd 37 7a 58 5a 00")];

const STREAM_HEADER_LEN: u64 = 12;
const STREAM_FOOTER_LEN: u64 = 12;
const FOOTER_MAGIC: &[u8; 2] = b"YZ";
const SCAN_BUFFER_SIZE: usize = 64 * 1024;

pub struct XzHandler {
    extractor: CommandExtractor,
}

impl XzHandler {
    pub fn new() -> Self {
        Self {
            extractor: CommandExtractor::new("7z", &["x", "-y", "-o{outdir}", "{inpath}"]),
        }
    }
}

impl Default for XzHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for XzHandler {
    fn name(&self) -> &'static str {
        "xz"
    }

    fn patterns(&self) -> &[HexString] {
        &XZ_PATTERNS
    }

    fn extractor(&self) -> Option<&dyn Extractor> {
        Some(&self.extractor)
    }

    fn calculate_chunk(
        &self,
        file: &mut File,
        start_offset: u64,
    ) -> Result<Option<ValidChunk>, HandlerError> {
        let mut header = [0u8; STREAM_HEADER_LEN as usize];
        read_exact_at(file, start_offset, &mut header)?;
        let stream_flags = [header[6], header[7]];
        if stream_flags[0] != 0 || stream_flags[1] & 0xf0 != 0 {
            return Err(InvalidInputFormat("xz stream flags reserved bits set".into()).into());
        }
        if crc32(&stream_flags) != le_u32(&header, 8) {
            return Err(InvalidInputFormat("xz stream header crc mismatch".into()).into());
        }

        let end_offset = find_stream_end(file, start_offset, stream_flags)?;
        Ok(Some(ValidChunk::new(start_offset, end_offset)?))
    }
}

/// Scan forward for a `YZ` footer magic whose 12-byte footer checksums
/// correctly, repeats the header's stream flags and closes a 4-byte
/// aligned stream.
fn find_stream_end(
    file: &mut File,
    start_offset: u64,
    stream_flags: [u8; 2],
) -> Result<u64, HandlerError> {
    let mut buf = vec![0u8; SCAN_BUFFER_SIZE];
    let mut pos = start_offset + STREAM_HEADER_LEN;

    loop {
        file.seek(SeekFrom::Start(pos))?;
        let n = read_up_to(file, &mut buf)?;
        if n < FOOTER_MAGIC.len() {
            return Err(InvalidInputFormat("xz stream footer not found".into()).into());
        }

        for idx in memmem::find_iter(&buf[..n], FOOTER_MAGIC) {
            let end = pos + idx as u64 + FOOTER_MAGIC.len() as u64;
            if end < start_offset + STREAM_HEADER_LEN + STREAM_FOOTER_LEN {
                continue;
            }
            if (end - start_offset) % 4 != 0 {
                continue;
            }
            let mut footer = [0u8; STREAM_FOOTER_LEN as usize];
            read_exact_at(file, end - STREAM_FOOTER_LEN, &mut footer)?;
            if [footer[8], footer[9]] != stream_flags {
                continue;
            }
            // CRC32 over backward size + stream flags.
            if crc32(&footer[4..10]) != le_u32(&footer, 0) {
                continue;
            }
            return Ok(end);
        }

        if (n as u64) < buf.len() as u64 {
            return Err(InvalidInputFormat("xz stream footer not found".into()).into());
        }
        pos += n as u64 - (FOOTER_MAGIC.len() as u64 - 1);
    }
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

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in bytes {
        crc ^= b as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320u32 & mask);
        }
    }
    !crc
}
