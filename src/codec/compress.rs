//! Gzip framing applied to the full payload when `Accept-Encoding` /
//! `Content-Encoding` advertise `gzip`.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("gzip encode failed: {0}")]
    Encode(#[source] std::io::Error),
    #[error("gzip decode failed: {0}")]
    Decode(#[source] std::io::Error),
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>, CompressError> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).map_err(CompressError::Encode)?;
    enc.finish().map_err(CompressError::Encode)
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>, CompressError> {
    let mut dec = GzDecoder::new(data);
    let mut out = Vec::new();
    dec.read_to_end(&mut out).map_err(CompressError::Decode)?;
    Ok(out)
}

/// Content types the server will compress a response body for.
pub const COMPRESSIBLE_CONTENT_TYPES: &[&str] = &["application/json", "text/html"];

pub fn is_compressible_content_type(content_type: &str) -> bool {
    let base = content_type.split(';').next().unwrap_or("").trim();
    COMPRESSIBLE_CONTENT_TYPES.contains(&base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_under_1_mib() {
        let data = vec![7u8; 900_000];
        let packed = gzip(&data).unwrap();
        let unpacked = gunzip(&packed).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn content_type_gate_ignores_charset_suffix() {
        assert!(is_compressible_content_type("application/json; charset=utf-8"));
        assert!(is_compressible_content_type("text/html"));
        assert!(!is_compressible_content_type("application/xml"));
    }
}
