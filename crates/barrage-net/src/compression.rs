//! Zlib handling for compressed frame bodies.
//!
//! The server sets [`crate::framing::FLAG_COMPRESSED`] on frames whose body is
//! a zlib stream. A body that fails to inflate is reported and dropped by the
//! receive loop; it never tears down the connection.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

/// Errors that can occur while compressing or inflating a body.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The body was empty; a zlib stream has at least a header.
    #[error("empty compressed body")]
    EmptyPayload,
    /// Zlib inflation failed.
    #[error("zlib decompression failed: {0}")]
    DecompressFailed(#[source] std::io::Error),
    /// Zlib deflation failed.
    #[error("zlib compression failed: {0}")]
    CompressFailed(#[source] std::io::Error),
}

/// Inflate a zlib-compressed body.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if data.is_empty() {
        return Err(CompressionError::EmptyPayload);
    }

    let mut out = Vec::with_capacity(data.len() * 4);
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(CompressionError::DecompressFailed)?;
    Ok(out)
}

/// Deflate a body with the default compression level.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(CompressionError::CompressFailed)?;
    encoder.finish().map_err(CompressionError::CompressFailed)
}
