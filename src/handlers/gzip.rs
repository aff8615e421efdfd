//! GZIP member handler.
//!
//! The header has no length field, so the member is sized by running the
//! DEFLATE stream through a decompressor and counting consumed input; the
//! 8-byte CRC32/ISIZE trailer follows the last deflate byte.

use std::fs::File;
use std::io::Read;

use flate2::{Decompress, FlushDecompress, Status};

use crate::chunk::{InvalidInputFormat, ValidChunk};
use crate::extractor::CommandExtractor;
use crate::handler::{Extractor, Handler, HandlerError, HexString};
use crate::handlers::{le_u16, read_exact_at};

const GZIP_PATTERNS: [HexString; 1] = [HexString("1f 8b 08")];

const FLAG_HEADER_CRC: u8 = 0x02;
const FLAG_EXTRA: u8 = 0x04;
const FLAG_NAME: u8 = 0x08;
const FLAG_COMMENT: u8 = 0x10;

const DEFLATE_METHOD: u8 = 8;
const TRAILER_LEN: u64 = 8;
const IO_BUFFER_SIZE: usize = 64 * 1024;
const MAX_CSTRING_LEN: u64 = 1024 * 1024;

pub struct GzipHandler {
    extractor: CommandExtractor,
}

impl GzipHandler {
    pub fn new() -> Self {
        Self {
            extractor: CommandExtractor::new("7z", &["x", "-y", "-o{outdir}", "{inpath}"]),
        }
    }
}

impl Default for GzipHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for GzipHandler {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn patterns(&self) -> &[HexString] {
        &GZIP_PATTERNS
    }

    fn extractor(&self) -> Option<&dyn Extractor> {
        Some(&self.extractor)
    }

    fn calculate_chunk(
        &self,
        file: &mut File,
        start_offset: u64,
    ) -> Result<Option<ValidChunk>, HandlerError> {
        let header_len = parse_header(file, start_offset)?;
        let data_start = start_offset + header_len;
        let (consumed, produced) = measure_deflate_stream(file, data_start)?;

        let mut trailer = [0u8; TRAILER_LEN as usize];
        read_exact_at(file, data_start + consumed, &mut trailer)?;
        let isize_field =
            u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]) as u64;
        if isize_field != produced % (1u64 << 32) {
            return Err(
                InvalidInputFormat("gzip trailer length does not match stream".into()).into(),
            );
        }

        let end_offset = data_start + consumed + TRAILER_LEN;
        Ok(Some(ValidChunk::new(start_offset, end_offset)?))
    }
}

/// Length of the member header including the optional FEXTRA/FNAME/FCOMMENT/
/// FHCRC fields.
fn parse_header(file: &mut File, offset: u64) -> Result<u64, HandlerError> {
    let mut fixed = [0u8; 10];
    read_exact_at(file, offset, &mut fixed)?;
    if fixed[0] != 0x1f || fixed[1] != 0x8b {
        return Err(InvalidInputFormat("gzip magic mismatch".into()).into());
    }
    if fixed[2] != DEFLATE_METHOD {
        return Err(InvalidInputFormat("gzip compression method unsupported".into()).into());
    }
    let flags = fixed[3];
    let mut cursor = offset + 10;

    if flags & FLAG_EXTRA != 0 {
        let mut extra_len = [0u8; 2];
        read_exact_at(file, cursor, &mut extra_len)?;
        cursor += 2 + le_u16(&extra_len, 0) as u64;
    }
    if flags & FLAG_NAME != 0 {
        cursor = skip_cstring(file, cursor)?;
    }
    if flags & FLAG_COMMENT != 0 {
        cursor = skip_cstring(file, cursor)?;
    }
    if flags & FLAG_HEADER_CRC != 0 {
        cursor += 2;
    }

    Ok(cursor - offset)
}

fn skip_cstring(file: &mut File, mut offset: u64) -> Result<u64, HandlerError> {
    let limit = offset + MAX_CSTRING_LEN;
    let mut byte = [0u8; 1];
    while offset < limit {
        read_exact_at(file, offset, &mut byte)?;
        offset += 1;
        if byte[0] == 0 {
            return Ok(offset);
        }
    }
    Err(InvalidInputFormat("gzip header string too long".into()).into())
}

/// Run the raw DEFLATE stream to its end marker, returning
/// `(input consumed, output produced)`.
fn measure_deflate_stream(file: &mut File, data_start: u64) -> Result<(u64, u64), HandlerError> {
    use std::io::{Seek, SeekFrom};

    let mut decompress = Decompress::new(false);
    let mut inbuf = vec![0u8; IO_BUFFER_SIZE];
    let mut outbuf = vec![0u8; IO_BUFFER_SIZE];

    file.seek(SeekFrom::Start(data_start))?;
    loop {
        let n = file.read(&mut inbuf)?;
        if n == 0 {
            return Err(InvalidInputFormat("deflate stream truncated".into()).into());
        }

        let mut pos = 0usize;
        while pos < n {
            let before = decompress.total_in();
            let status = decompress
                .decompress(&inbuf[pos..n], &mut outbuf, FlushDecompress::None)
                .map_err(|_| InvalidInputFormat("corrupt deflate stream".into()))?;
            pos += (decompress.total_in() - before) as usize;

            match status {
                Status::StreamEnd => {
                    return Ok((decompress.total_in(), decompress.total_out()));
                }
                Status::Ok => {}
                // Output space is always fresh, so a stall with input left
                // means the stream cannot continue.
                Status::BufError => {
                    return Err(InvalidInputFormat("deflate stream stalled".into()).into());
                }
            }
        }
    }
}
