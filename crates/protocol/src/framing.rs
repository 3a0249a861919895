//! Segment framing for sealed envelopes.
//!
//! # Format
//!
//! A sealed envelope consists of:
//! - 4 bytes: magic bytes "FLTE"
//! - 1 byte: format version
//! - zero or more segments, each:
//!   - 4 bytes: segment length (big-endian)
//!   - N bytes: segment data
//!
//! The framing carries no meaning of its own; [`crate::seal`] decides what
//! each segment contains.

use crate::error::{ProtocolError, Result};

/// Magic bytes identifying a sealed envelope.
pub const FRAME_MAGIC: [u8; 4] = *b"FLTE";

/// Current sealed envelope format version.
pub const FRAME_VERSION: u8 = 1;

/// Maximum size of a sealed envelope (16 MB).
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// Header size: 4 (magic) + 1 (version).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Per-segment length prefix size.
const SEGMENT_PREFIX_SIZE: usize = 4;

/// An ordered list of opaque segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SealedFrame {
    /// The segments, in order.
    pub segments: Vec<Vec<u8>>,
}

impl SealedFrame {
    /// Create a frame from the given segments.
    pub fn new(segments: Vec<Vec<u8>>) -> Self {
        Self { segments }
    }

    /// Total encoded size of this frame.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE
            + self
                .segments
                .iter()
                .map(|s| SEGMENT_PREFIX_SIZE + s.len())
                .sum::<usize>()
    }

    /// Encode the frame into bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let total_size = self.encoded_len();
        if total_size > MAX_ENVELOPE_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total_size,
                max: MAX_ENVELOPE_SIZE,
            });
        }

        let mut output = Vec::with_capacity(total_size);
        output.extend_from_slice(&FRAME_MAGIC);
        output.push(FRAME_VERSION);

        for segment in &self.segments {
            output.extend_from_slice(&(segment.len() as u32).to_be_bytes());
            output.extend_from_slice(segment);
        }

        Ok(output)
    }

    /// Decode a frame from bytes.
    ///
    /// The whole input must be consumed by the segments; trailing bytes are
    /// an error.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_ENVELOPE_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                max: MAX_ENVELOPE_SIZE,
            });
        }

        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame header: need {} bytes, have {}",
                FRAME_HEADER_SIZE,
                data.len()
            )));
        }

        let magic = &data[0..4];
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::InvalidFrameMagic {
                expected: u32::from_be_bytes(FRAME_MAGIC),
                got: u32::from_be_bytes([magic[0], magic[1], magic[2], magic[3]]),
            });
        }

        let version = data[4];
        if version != FRAME_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let mut segments = Vec::new();
        let mut rest = &data[FRAME_HEADER_SIZE..];
        while !rest.is_empty() {
            if rest.len() < SEGMENT_PREFIX_SIZE {
                return Err(ProtocolError::Deserialization(
                    "truncated segment length".to_string(),
                ));
            }
            let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            rest = &rest[SEGMENT_PREFIX_SIZE..];

            if rest.len() < len {
                return Err(ProtocolError::Deserialization(format!(
                    "insufficient data for segment: need {} bytes, have {}",
                    len,
                    rest.len()
                )));
            }
            segments.push(rest[..len].to_vec());
            rest = &rest[len..];
        }

        Ok(Self { segments })
    }
}
