//! Gzip (de)compression of stored measure rows.

use bytes::Bytes;
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use std::io::Read;

use crate::error::CubeError;

/// Compresses a row measure.
pub fn compress(data: &[u8]) -> Result<Bytes, CubeError> {
    let mut result = Vec::with_capacity(data.len() / 2 + 32);
    let mut encoder = GzEncoder::new(data, Compression::fast());
    encoder.read_to_end(&mut result)?;
    Ok(result.into())
}

/// Decompresses a row measure and returns the uncompressed data.
///
/// # Arguments
///
/// * `data`: Gzip-compressed bytes
pub fn decompress(data: &[u8]) -> Result<Bytes, CubeError> {
    let mut decoder = GzDecoder::new(data);
    // Start from an 8-byte aligned buffer so that typed views rarely need another copy.
    let mut buf = maligned::align_first::<u8, maligned::A8>(data.len() * 4);
    decoder.read_to_end(&mut buf)?;
    // Release any unnecessary capacity.
    buf.shrink_to(0);
    Ok(buf.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_decompress() {
        let input = b"hello world hello world hello world";
        let compressed = compress(input).unwrap();
        assert_ne!(input.as_ref(), compressed.as_ref());
        let result = decompress(&compressed).unwrap();
        assert_eq!(result, input.as_ref());
    }

    #[test]
    fn test_decompress_invalid_gzip() {
        let invalid = b"invalid format";
        let err = decompress(invalid).unwrap_err();
        match err {
            CubeError::Compression(io_err) => {
                assert_eq!(io_err.kind(), std::io::ErrorKind::InvalidInput);
                assert_eq!(io_err.to_string(), "invalid gzip header");
            }
            err => panic!("unexpected error {}", err),
        }
    }
}
