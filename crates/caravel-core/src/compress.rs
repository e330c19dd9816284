//! Gzip codec for bucket payloads.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use caravel_types::{CaravelError, Result};

/// Gzip-compress a bucket payload at the default level.
pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| CaravelError::Internal(format!("gzip compression: {e}")))
}

/// Inflate a gzip bucket payload.
///
/// `expected_size` is the exact inflated length announced by the bucket;
/// a stream that inflates to anything else is a protocol violation. The
/// bound also caps memory against decompression bombs.
pub fn gzip_decompress(data: &[u8], expected_size: u64) -> Result<Vec<u8>> {
    let mut inflated = Vec::with_capacity(expected_size as usize);
    let mut decoder = GzDecoder::new(data).take(expected_size + 1);
    decoder
        .read_to_end(&mut inflated)
        .map_err(|e| CaravelError::NetworkProtocol(format!("malformed gzip payload: {e}")))?;

    if inflated.len() as u64 != expected_size {
        return Err(CaravelError::NetworkProtocol(format!(
            "gzip payload inflates to {} bytes, expected {expected_size}",
            inflated.len()
        )));
    }

    Ok(inflated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let data = b"some compressible payload, some compressible payload".to_vec();
        let packed = gzip_compress(&data).unwrap();
        let unpacked = gzip_decompress(&packed, data.len() as u64).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn empty_round_trip() {
        let packed = gzip_compress(b"").unwrap();
        assert_eq!(gzip_decompress(&packed, 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn length_mismatch_is_a_protocol_error() {
        let packed = gzip_compress(b"1234567890").unwrap();
        assert!(matches!(
            gzip_decompress(&packed, 4),
            Err(CaravelError::NetworkProtocol(_))
        ));
        assert!(matches!(
            gzip_decompress(&packed, 11),
            Err(CaravelError::NetworkProtocol(_))
        ));
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        assert!(matches!(
            gzip_decompress(b"not gzip at all", 15),
            Err(CaravelError::NetworkProtocol(_))
        ));
    }
}
