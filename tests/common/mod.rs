//! Shared fixtures: a tiny length-prefixed container format with a pure
//! Rust extractor, so the full pipeline can be exercised without external
//! extractor commands.
#![allow(dead_code)]

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use deepcarve::chunk::{InvalidInputFormat, ValidChunk};
use deepcarve::config::ExtractionConfig;
use deepcarve::handler::{ExtractError, Extractor, Handler, HandlerError, Handlers, HexString};
use deepcarve::report::Report;

pub const BLOB_HEADER_LEN: usize = 8;

// "BLOB"
const BLOB_PATTERNS: [HexString; 1] = [HexString("42 4c 4f 42")];
// "SEAL"
const SEALED_PATTERNS: [HexString; 1] = [HexString("53 45 41 4c")];

/// `BLOB` magic, little-endian payload length, payload.
pub fn blob_bytes(payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(BLOB_HEADER_LEN + payload.len());
    data.extend_from_slice(b"BLOB");
    data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    data.extend_from_slice(payload);
    data
}

/// Same container, but its chunks are reported as encrypted.
pub fn sealed_bytes(payload: &[u8]) -> Vec<u8> {
    let mut data = blob_bytes(payload);
    data[..4].copy_from_slice(b"SEAL");
    data
}

fn read_header(file: &mut File, start_offset: u64) -> Result<(u64, [u8; 4]), HandlerError> {
    let mut header = [0u8; BLOB_HEADER_LEN];
    file.seek(SeekFrom::Start(start_offset))?;
    file.read_exact(&mut header)?;
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;
    Ok((len, [header[0], header[1], header[2], header[3]]))
}

/// Unpacks a container by writing its payload to `payload.bin`.
struct BlobExtractor;

impl Extractor for BlobExtractor {
    fn extract(&self, inpath: &Path, outdir: &Path) -> Result<(), ExtractError> {
        let run = || -> std::io::Result<()> {
            let data = std::fs::read(inpath)?;
            std::fs::write(outdir.join("payload.bin"), &data[BLOB_HEADER_LEN..])?;
            Ok(())
        };
        run().map_err(|err| {
            ExtractError::with_report(Report::extract_command_failed(
                "blob-extract",
                err.to_string(),
            ))
        })
    }
}

pub struct BlobHandler {
    extractor: BlobExtractor,
}

impl BlobHandler {
    pub fn new() -> Self {
        Self {
            extractor: BlobExtractor,
        }
    }
}

impl Handler for BlobHandler {
    fn name(&self) -> &'static str {
        "blob"
    }

    fn patterns(&self) -> &[HexString] {
        &BLOB_PATTERNS
    }

    fn extractor(&self) -> Option<&dyn Extractor> {
        Some(&self.extractor)
    }

    fn calculate_chunk(
        &self,
        file: &mut File,
        start_offset: u64,
    ) -> Result<Option<ValidChunk>, HandlerError> {
        let (len, magic) = read_header(file, start_offset)?;
        if &magic != b"BLOB" {
            return Err(InvalidInputFormat("blob magic mismatch".into()).into());
        }
        Ok(Some(ValidChunk::new(
            start_offset,
            start_offset + BLOB_HEADER_LEN as u64 + len,
        )?))
    }
}

pub struct SealedHandler;

impl Handler for SealedHandler {
    fn name(&self) -> &'static str {
        "sealed"
    }

    fn patterns(&self) -> &[HexString] {
        &SEALED_PATTERNS
    }

    fn extractor(&self) -> Option<&dyn Extractor> {
        // Never reached: the driver skips encrypted chunks first.
        None
    }

    fn calculate_chunk(
        &self,
        file: &mut File,
        start_offset: u64,
    ) -> Result<Option<ValidChunk>, HandlerError> {
        let (len, magic) = read_header(file, start_offset)?;
        if &magic != b"SEAL" {
            return Err(InvalidInputFormat("sealed magic mismatch".into()).into());
        }
        Ok(Some(
            ValidChunk::new(start_offset, start_offset + BLOB_HEADER_LEN as u64 + len)?
                .with_encryption(true),
        ))
    }
}

pub fn test_handlers() -> Handlers {
    Handlers::new(vec![vec![
        Arc::new(BlobHandler::new()) as Arc<dyn Handler>,
        Arc::new(SealedHandler),
    ]])
}

pub fn test_config(extract_root: &Path, process_num: usize) -> ExtractionConfig {
    ExtractionConfig {
        extract_root: extract_root.to_path_buf(),
        max_depth: 10,
        entropy_depth: 1,
        entropy_plot: false,
        process_num,
        keep_extracted_chunks: false,
        handlers: test_handlers(),
    }
}

/// Deterministic pseudo-random bytes with no recognizable magic.
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed;
    let mut data = Vec::with_capacity(len);
    for _ in 0..len {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        data.push((state >> 33) as u8);
    }
    data
}

pub fn list_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub fn write_input(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}
