//! ZIP archive handler.
//!
//! The end offset comes from the first end-of-central-directory record
//! whose central directory size and offset land exactly on the record
//! itself; a stray EOCD byte sequence in file data fails that check and
//! the scan continues. Encryption is flagged from the general purpose bits
//! of the local file header, so encrypted archives are detected but
//! skipped by the extraction driver.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use memchr::memmem;

use crate::chunk::{InvalidInputFormat, ValidChunk};
use crate::extractor::CommandExtractor;
use crate::handler::{Extractor, Handler, HandlerError, HexString};
use crate::handlers::{le_u16, le_u32, read_exact_at};

// Local file header magic "PK\x03\x04"
const ZIP_PATTERNS: [HexString; 1] = [HexString("50 4b 03 04")];

const EOCD_MAGIC: &[u8; 4] = &[0x50, 0x4b, 0x05, 0x06];
const EOCD_MIN_LEN: u64 = 22;
const EOCD_CD_SIZE_OFFSET: usize = 12;
const EOCD_CD_OFFSET_OFFSET: usize = 16;
const EOCD_COMMENT_LEN_OFFSET: usize = 20;
const LOCAL_HEADER_LEN: usize = 30;
const FLAG_ENCRYPTED: u16 = 0x0001;
const SCAN_BUFFER_SIZE: usize = 64 * 1024;

pub struct ZipHandler {
    extractor: CommandExtractor,
}

impl ZipHandler {
    pub fn new() -> Self {
        Self {
            extractor: CommandExtractor::new("unzip", &["-o", "{inpath}", "-d", "{outdir}"]),
        }
    }
}

impl Default for ZipHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for ZipHandler {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn patterns(&self) -> &[HexString] {
        &ZIP_PATTERNS
    }

    fn extractor(&self) -> Option<&dyn Extractor> {
        Some(&self.extractor)
    }

    fn calculate_chunk(
        &self,
        file: &mut File,
        start_offset: u64,
    ) -> Result<Option<ValidChunk>, HandlerError> {
        let mut header = [0u8; LOCAL_HEADER_LEN];
        read_exact_at(file, start_offset, &mut header)?;
        let flags = le_u16(&header, 6);
        let is_encrypted = flags & FLAG_ENCRYPTED != 0;

        let (eocd_offset, eocd) = find_eocd(file, start_offset)?;
        let end_offset = eocd_offset + EOCD_MIN_LEN + eocd.comment_len;

        Ok(Some(
            ValidChunk::new(start_offset, end_offset)?.with_encryption(is_encrypted),
        ))
    }
}

struct ZipEocd {
    cd_size: u64,
    cd_offset: u64,
    comment_len: u64,
}

/// First end-of-central-directory record at or after `start_offset` whose
/// central directory lands exactly on the record. Candidates failing that
/// check are decoy byte sequences; the scan continues past them.
fn find_eocd(file: &mut File, start_offset: u64) -> Result<(u64, ZipEocd), HandlerError> {
    let mut buf = vec![0u8; SCAN_BUFFER_SIZE];
    let mut pos = start_offset;

    loop {
        file.seek(SeekFrom::Start(pos))?;
        let n = read_up_to(file, &mut buf)?;
        if n < EOCD_MAGIC.len() {
            return Err(InvalidInputFormat("zip end of central directory not found".into()).into());
        }

        for idx in memmem::find_iter(&buf[..n], EOCD_MAGIC) {
            let eocd_offset = pos + idx as u64;
            let Some(eocd) = read_eocd(file, eocd_offset)? else {
                continue;
            };
            if start_offset + eocd.cd_offset + eocd.cd_size == eocd_offset {
                return Ok((eocd_offset, eocd));
            }
        }

        if n < buf.len() {
            return Err(InvalidInputFormat("zip end of central directory not found".into()).into());
        }
        pos += n as u64 - (EOCD_MAGIC.len() as u64 - 1);
    }
}

/// `None` when the record is cut off by the end of the file.
fn read_eocd(file: &mut File, eocd_offset: u64) -> Result<Option<ZipEocd>, HandlerError> {
    let mut eocd = [0u8; EOCD_MIN_LEN as usize];
    match read_exact_at(file, eocd_offset, &mut eocd) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    Ok(Some(ZipEocd {
        cd_size: le_u32(&eocd, EOCD_CD_SIZE_OFFSET) as u64,
        cd_offset: le_u32(&eocd, EOCD_CD_OFFSET_OFFSET) as u64,
        comment_len: le_u16(&eocd, EOCD_COMMENT_LEN_OFFSET) as u64,
    }))
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
