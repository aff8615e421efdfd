//! Netgear CHK firmware image handler.
//!
//! Big-endian header carrying its own length plus the kernel and rootfs
//! partition sizes. There is no generic extractor for the payload, so the
//! chunk is carved and recursed into as-is.

use std::fs::File;

use tracing::debug;

use crate::chunk::{InvalidInputFormat, ValidChunk};
use crate::handler::{Handler, HandlerError, HexString};
use crate::handlers::{be_u32, read_exact_at};

// "*#$^"
const CHK_PATTERNS: [HexString; 1] = [HexString("2a 23 24 5e")];

const HEADER_LEN: usize = 40;
const HEADER_LEN_OFFSET: usize = 4;
const KERNEL_LEN_OFFSET: usize = 24;
const ROOTFS_LEN_OFFSET: usize = 28;

pub struct NetgearChkHandler;

impl Handler for NetgearChkHandler {
    fn name(&self) -> &'static str {
        "chk"
    }

    fn patterns(&self) -> &[HexString] {
        &CHK_PATTERNS
    }

    fn calculate_chunk(
        &self,
        file: &mut File,
        start_offset: u64,
    ) -> Result<Option<ValidChunk>, HandlerError> {
        let mut header = [0u8; HEADER_LEN];
        read_exact_at(file, start_offset, &mut header)?;

        let header_len = be_u32(&header, HEADER_LEN_OFFSET) as u64;
        if header_len < HEADER_LEN as u64 {
            return Err(InvalidInputFormat("chk header length too small".into()).into());
        }
        let kernel_len = be_u32(&header, KERNEL_LEN_OFFSET) as u64;
        let rootfs_len = be_u32(&header, ROOTFS_LEN_OFFSET) as u64;
        debug!(
            "chk header header_len={header_len} kernel_len={kernel_len} rootfs_len={rootfs_len}"
        );

        Ok(Some(ValidChunk::new(
            start_offset,
            start_offset + header_len + kernel_len + rootfs_len,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chk_header(header_len: u32, kernel_len: u32, rootfs_len: u32) -> Vec<u8> {
        let mut data = vec![0u8; header_len.max(HEADER_LEN as u32) as usize];
        data[0..4].copy_from_slice(&[0x2a, 0x23, 0x24, 0x5e]);
        data[4..8].copy_from_slice(&header_len.to_be_bytes());
        data[24..28].copy_from_slice(&kernel_len.to_be_bytes());
        data[28..32].copy_from_slice(&rootfs_len.to_be_bytes());
        data
    }

    fn write_temp(data: &[u8]) -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, data).unwrap();
        (dir, File::open(&path).unwrap())
    }

    #[test]
    fn sums_header_kernel_and_rootfs() {
        // 58-byte header with a board id tail, 1 KiB kernel, 2 KiB rootfs
        let mut data = chk_header(58, 1024, 2048);
        data.resize(58 + 1024 + 2048 + 100, 0x55);
        let (_dir, mut file) = write_temp(&data);

        let chunk = NetgearChkHandler
            .calculate_chunk(&mut file, 0)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.chunk.end_offset(), 58 + 1024 + 2048);
    }

    #[test]
    fn rejects_short_header_length_field() {
        let data = chk_header(40, 0, 0);
        let mut bad = data.clone();
        bad[4..8].copy_from_slice(&8u32.to_be_bytes());
        let (_dir, mut file) = write_temp(&bad);

        assert!(matches!(
            NetgearChkHandler.calculate_chunk(&mut file, 0),
            Err(HandlerError::InvalidInputFormat(_))
        ));
    }

    #[test]
    fn has_no_extractor() {
        assert!(NetgearChkHandler.extractor().is_none());
    }
}
