//! Guest image decoding
//!
//! Kernel and firmware images may come gzip- or zstd-compressed; the format
//! is picked from the magic bytes and anything else is loaded as is.

use std::borrow::Cow;
use std::io::Read;

use crate::error::MachineError;

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Raw,
    Gzip,
    Zstd,
}

impl ImageFormat {
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(&GZIP_MAGIC) {
            ImageFormat::Gzip
        } else if data.starts_with(&ZSTD_MAGIC) {
            ImageFormat::Zstd
        } else {
            ImageFormat::Raw
        }
    }
}

/// Decompress gzip-compressed data
pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, MachineError> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut result = Vec::new();
    decoder
        .read_to_end(&mut result)
        .map_err(|e| MachineError::Image(format!("gzip decompression error: {}", e)))?;
    Ok(result)
}

/// Decompress zstd-compressed data
pub fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>, MachineError> {
    zstd::stream::decode_all(data).map_err(|e| MachineError::Image(format!("zstd decompression error: {}", e)))
}

/// The bytes to place in guest memory for `data`.
pub fn decode(data: &[u8]) -> Result<Cow<'_, [u8]>, MachineError> {
    match ImageFormat::detect(data) {
        ImageFormat::Raw => Ok(Cow::Borrowed(data)),
        ImageFormat::Gzip => decompress_gzip(data).map(Cow::Owned),
        ImageFormat::Zstd => decompress_zstd(data).map(Cow::Owned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PAYLOAD: &[u8] = b"\x13\x00\x00\x00\x6f\x00\x00\x00 guest image";

    #[test]
    fn test_raw_passes_through() {
        assert_eq!(ImageFormat::detect(PAYLOAD), ImageFormat::Raw);
        assert!(matches!(decode(PAYLOAD).unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn test_gzip() {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(PAYLOAD).unwrap();
        let packed = enc.finish().unwrap();
        assert_eq!(ImageFormat::detect(&packed), ImageFormat::Gzip);
        assert_eq!(&*decode(&packed).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_zstd() {
        let packed = zstd::stream::encode_all(PAYLOAD, 3).unwrap();
        assert_eq!(ImageFormat::detect(&packed), ImageFormat::Zstd);
        assert_eq!(&*decode(&packed).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_corrupt_gzip() {
        let bad = [0x1F, 0x8B, 0x08, 0x00, 0xFF];
        assert!(matches!(decode(&bad), Err(MachineError::Image(_))));
    }
}
