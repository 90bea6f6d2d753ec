//! Length-prefixed framing for the barrage TCP stream.
//!
//! Every message on the wire is a 12-byte header followed by a body:
//!
//! ```text
//! +------------------+------------------+-------------+-------+----------+--------+
//! | length (4 bytes) | length (4 bytes) | kind (2)    | flags | reserved |  body  |
//! | u32 little-endian| duplicate        | u16 LE      | u8    | u8       |        |
//! +------------------+------------------+-------------+-------+----------+--------+
//! ```
//!
//! The first length field counts every byte after itself, so the body is
//! `length - 8` bytes long. The duplicate must match; a header that disagrees
//! with itself is rejected rather than guessed at.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::stt::{self, FieldMap};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 12;

/// Header bytes counted by the length field besides the body.
pub const HEADER_TAIL_LEN: u32 = 8;

/// Message-kind code for frames sent by the client.
pub const CLIENT_MESSAGE_KIND: u16 = 689;

/// Message-kind code for frames sent by the server.
pub const SERVER_MESSAGE_KIND: u16 = 690;

/// Flag bit: the body is zlib-compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed body size in bytes. Default: 1 MB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The length field is too small to cover the fixed header tail.
    #[error("declared length {total} is shorter than the {HEADER_TAIL_LEN}-byte header tail")]
    Truncated {
        /// The declared total length.
        total: u32,
    },

    /// The two length fields of the header disagree.
    #[error("header length {declared} does not match duplicate {duplicate}")]
    LengthMismatch {
        /// The first length field.
        declared: u32,
        /// The duplicated length field.
        duplicate: u32,
    },

    /// The body size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The declared body size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// The body is not a well-formed field map.
    #[error("malformed body: {0}")]
    MalformedBody(String),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced when encoding an outgoing frame.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// A key or value contains `@`, `/` or NUL, which the body encoding reserves.
    #[error("field `{field}` contains a reserved delimiter")]
    ReservedDelimiter {
        /// The offending field code.
        field: String,
    },

    /// The encoded body does not fit the 32-bit length field.
    #[error("encoded body of {size} bytes does not fit the length field")]
    TooLarge {
        /// The encoded body size.
        size: usize,
    },
}

/// Decoded fixed header of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Bytes following the first length field.
    pub total_length: u32,
    /// Bytes of body following the header.
    pub body_length: u32,
    /// Message-kind code.
    pub msg_kind: u16,
    /// Flag byte (see [`FLAG_COMPRESSED`]).
    pub flags: u8,
}

impl FrameHeader {
    /// Build the header for a body of `body_length` bytes.
    pub fn new(body_length: u32, msg_kind: u16, flags: u8) -> Result<Self, EncodeError> {
        let total_length = body_length
            .checked_add(HEADER_TAIL_LEN)
            .ok_or(EncodeError::TooLarge {
                size: body_length as usize,
            })?;
        Ok(Self {
            total_length,
            body_length,
            msg_kind,
            flags,
        })
    }

    /// Whether the body must be decompressed before decoding.
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// Serialize to the 12 wire bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.total_length.to_le_bytes());
        out[4..8].copy_from_slice(&self.total_length.to_le_bytes());
        out[8..10].copy_from_slice(&self.msg_kind.to_le_bytes());
        out[10] = self.flags;
        out
    }
}

/// One frame: header plus raw (possibly compressed) body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The decoded header.
    pub header: FrameHeader,
    /// Body bytes, exactly `header.body_length` long.
    pub body: Vec<u8>,
}

impl Frame {
    /// Wrap `body` in a header of the given kind and flags.
    pub fn new(msg_kind: u16, flags: u8, body: Vec<u8>) -> Result<Self, EncodeError> {
        let body_length =
            u32::try_from(body.len()).map_err(|_| EncodeError::TooLarge { size: body.len() })?;
        Ok(Self {
            header: FrameHeader::new(body_length, msg_kind, flags)?,
            body,
        })
    }

    /// Serialize header and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

/// Decode the fixed 12-byte header.
pub fn decode_header(bytes: &[u8; HEADER_LEN]) -> Result<FrameHeader, FrameError> {
    let total_length = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let duplicate = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    if total_length < HEADER_TAIL_LEN {
        return Err(FrameError::Truncated {
            total: total_length,
        });
    }
    if duplicate != total_length {
        return Err(FrameError::LengthMismatch {
            declared: total_length,
            duplicate,
        });
    }

    Ok(FrameHeader {
        total_length,
        body_length: total_length - HEADER_TAIL_LEN,
        msg_kind: u16::from_le_bytes([bytes[8], bytes[9]]),
        flags: bytes[10],
    })
}

/// Encode a client frame carrying `fields`.
pub fn encode(fields: &FieldMap) -> Result<Vec<u8>, EncodeError> {
    let body = stt::encode_body(fields)?;
    Ok(Frame::new(CLIENT_MESSAGE_KIND, 0, body)?.to_bytes())
}

/// Read a single frame from the stream.
///
/// Blocks until the full frame is available. A header whose length fields
/// disagree yields [`FrameError::LengthMismatch`], and a body over
/// `max_payload_size` yields [`FrameError::PayloadTooLarge`]. Both are
/// returned after the declared body has been skipped, so the stream stays
/// aligned on the next frame.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Frame, FrameError> {
    let mut header_buf = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let header = match decode_header(&header_buf) {
        Ok(header) => header,
        Err(FrameError::LengthMismatch {
            declared,
            duplicate,
        }) => {
            let skip = declared.saturating_sub(HEADER_TAIL_LEN);
            if skip <= config.max_payload_size {
                discard(reader, skip).await?;
            }
            return Err(FrameError::LengthMismatch {
                declared,
                duplicate,
            });
        }
        Err(e) => return Err(e),
    };

    if header.body_length > config.max_payload_size {
        discard(reader, header.body_length).await?;
        return Err(FrameError::PayloadTooLarge {
            size: header.body_length,
            max: config.max_payload_size,
        });
    }

    let mut body = vec![0u8; header.body_length as usize];
    if header.body_length > 0 {
        reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::ConnectionClosed
            } else {
                FrameError::Io(e)
            }
        })?;
    }

    Ok(Frame { header, body })
}

async fn discard<R: AsyncRead + Unpin>(reader: &mut R, len: u32) -> Result<(), FrameError> {
    let mut limited = (&mut *reader).take(u64::from(len));
    let copied = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
    if copied < u64::from(len) {
        return Err(FrameError::ConnectionClosed);
    }
    Ok(())
}

/// Write pre-encoded frame bytes and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<(), std::io::Error> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn default_config() -> FrameConfig {
        FrameConfig::default()
    }

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_header_law_holds_for_encoded_frame() {
        let bytes = encode(&fields(&[("type", "mrkl")])).unwrap();
        let header: [u8; HEADER_LEN] = bytes[..HEADER_LEN].try_into().unwrap();
        let header = decode_header(&header).unwrap();

        assert_eq!(header.body_length as usize, bytes.len() - HEADER_LEN);
        assert_eq!(header.total_length, header.body_length + HEADER_TAIL_LEN);
        assert_eq!(header.msg_kind, CLIENT_MESSAGE_KIND);
        assert!(!header.is_compressed());
    }

    #[test]
    fn test_header_rejects_length_overflow() {
        assert!(matches!(
            FrameHeader::new(u32::MAX - 7, SERVER_MESSAGE_KIND, 0),
            Err(EncodeError::TooLarge { .. })
        ));
        let header = FrameHeader::new(u32::MAX - 8, SERVER_MESSAGE_KIND, 0).unwrap();
        assert_eq!(header.total_length, u32::MAX);
    }

    #[test]
    fn test_length_prefix_is_little_endian() {
        let bytes = encode(&fields(&[("type", "mrkl")])).unwrap();
        // "type@=mrkl/" plus NUL is 12 bytes, +8 header tail
        assert_eq!(&bytes[0..4], &20u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &20u32.to_le_bytes());
        assert_eq!(&bytes[8..10], &689u16.to_le_bytes());
    }

    #[test]
    fn test_truncated_header_rejected() {
        let mut raw = [0u8; HEADER_LEN];
        raw[0..4].copy_from_slice(&4u32.to_le_bytes());
        raw[4..8].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(
            decode_header(&raw),
            Err(FrameError::Truncated { total: 4 })
        ));
    }

    #[test]
    fn test_mismatched_duplicate_length_rejected() {
        let mut raw = FrameHeader::new(10, SERVER_MESSAGE_KIND, 0).unwrap().to_bytes();
        raw[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            decode_header(&raw),
            Err(FrameError::LengthMismatch {
                declared: 18,
                duplicate: 99
            })
        ));
    }

    #[test]
    fn test_reserved_delimiter_rejected_on_encode() {
        let result = encode(&fields(&[("txt", "a/b")]));
        assert!(matches!(
            result,
            Err(EncodeError::ReservedDelimiter { field }) if field == "txt"
        ));
    }

    #[tokio::test]
    async fn test_single_frame_roundtrip() {
        let (mut client, mut server) = duplex(8192);
        let config = default_config();
        let sent = fields(&[("type", "chatmsg"), ("txt", "hello")]);

        write_frame(&mut client, &encode(&sent).unwrap())
            .await
            .unwrap();
        let frame = read_frame(&mut server, &config).await.unwrap();
        assert_eq!(stt::decode_body(&frame.body).unwrap(), sent);
    }

    #[tokio::test]
    async fn test_back_to_back_frames_dont_merge() {
        let (mut client, mut server) = duplex(8192);
        let config = default_config();

        for txt in ["aaa", "bbb"] {
            let bytes = encode(&fields(&[("txt", txt)])).unwrap();
            write_frame(&mut client, &bytes).await.unwrap();
        }

        let first = read_frame(&mut server, &config).await.unwrap();
        let second = read_frame(&mut server, &config).await.unwrap();
        assert_eq!(stt::decode_body(&first.body).unwrap().get("txt"), Some("aaa"));
        assert_eq!(stt::decode_body(&second.body).unwrap().get("txt"), Some("bbb"));
    }

    #[tokio::test]
    async fn test_partial_read_resumes_correctly() {
        let (mut client, mut server) = duplex(8);
        let config = default_config();
        let sent = fields(&[("txt", "this message is larger than the buffer")]);
        let bytes = encode(&sent).unwrap();

        let write_task = tokio::spawn(async move {
            write_frame(&mut client, &bytes).await.unwrap();
        });

        let frame = read_frame(&mut server, &config).await.unwrap();
        write_task.await.unwrap();
        assert_eq!(stt::decode_body(&frame.body).unwrap(), sent);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig {
            max_payload_size: 16,
        };

        let big = Frame::new(SERVER_MESSAGE_KIND, 0, vec![b'x'; 1024]).unwrap();
        client.write_all(&big.to_bytes()).await.unwrap();
        let good = encode(&fields(&[("type", "chatmsg")])).unwrap();
        client.write_all(&good).await.unwrap();
        client.flush().await.unwrap();

        let result = read_frame(&mut server, &config).await;
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge { size: 1024, max: 16 })
        ));
        let frame = read_frame(&mut server, &config).await.unwrap();
        assert_eq!(stt::decode_body(&frame.body).unwrap().kind(), Some("chatmsg"));
    }

    #[tokio::test]
    async fn test_oversized_body_cut_short_reports_closed() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig {
            max_payload_size: 16,
        };

        let header = FrameHeader::new(1024, SERVER_MESSAGE_KIND, 0).unwrap();
        client.write_all(&header.to_bytes()).await.unwrap();
        drop(client);

        let result = read_frame(&mut server, &config).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_mismatched_frame_is_skipped() {
        let (mut client, mut server) = duplex(8192);
        let config = default_config();

        let mut bad = Frame::new(SERVER_MESSAGE_KIND, 0, b"junk@=1/\0".to_vec())
            .unwrap()
            .to_bytes();
        bad[4..8].copy_from_slice(&0u32.to_le_bytes());
        client.write_all(&bad).await.unwrap();
        let good = encode(&fields(&[("type", "chatmsg")])).unwrap();
        client.write_all(&good).await.unwrap();

        assert!(matches!(
            read_frame(&mut server, &config).await,
            Err(FrameError::LengthMismatch { .. })
        ));
        let frame = read_frame(&mut server, &config).await.unwrap();
        assert_eq!(stt::decode_body(&frame.body).unwrap().kind(), Some("chatmsg"));
    }

    #[tokio::test]
    async fn test_connection_closed_during_header_read() {
        let (client, mut server) = duplex(8192);
        drop(client);

        let result = read_frame(&mut server, &default_config()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_connection_closed_during_body_read() {
        let (mut client, mut server) = duplex(8192);
        client
            .write_all(&FrameHeader::new(32, SERVER_MESSAGE_KIND, 0).unwrap().to_bytes())
            .await
            .unwrap();
        client.write_all(b"short").await.unwrap();
        drop(client);

        let result = read_frame(&mut server, &default_config()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }
}
