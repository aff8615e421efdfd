//! Built-in file format handlers.
//!
//! Each format lives in its own module: magic patterns, typed header field
//! reads at declared offsets and the end-of-chunk calculation. Firmware and
//! filesystem formats sit in the highest priority tier, archives next,
//! stream compression last, so a filesystem image claims its span before
//! the compressed streams inside it are considered.

pub mod chk;
pub mod gzip;
pub mod squashfs;
pub mod tar;
pub mod xz;
pub mod zip;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::handler::{Handler, Handlers};

pub fn builtin_handlers() -> Handlers {
    Handlers::new(vec![
        vec![
            Arc::new(chk::NetgearChkHandler) as Arc<dyn Handler>,
            Arc::new(squashfs::SquashFsHandler::new()),
        ],
        vec![
            Arc::new(tar::TarHandler::new()) as Arc<dyn Handler>,
            Arc::new(zip::ZipHandler::new()),
        ],
        vec![
            Arc::new(gzip::GzipHandler::new()) as Arc<dyn Handler>,
            Arc::new(xz::XzHandler::new()),
        ],
    ])
}

pub(crate) fn read_exact_at(file: &mut File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

pub(crate) fn le_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn le_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub(crate) fn le_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
        buf[offset + 4],
        buf[offset + 5],
        buf[offset + 6],
        buf[offset + 7],
    ])
}

pub(crate) fn be_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}
