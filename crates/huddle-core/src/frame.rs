//! Binary framing for the transfer data channel.
//!
//! All multi-byte fields are big-endian.
//!
//! ```text
//! ┌──────────────┬──────────────┬───────────────┬─────────────────────┐
//! │ type (u32)   │ idLen (u32)  │ id (idLen B)  │ payload             │
//! └──────────────┴──────────────┴───────────────┴─────────────────────┘
//!
//! chunk    payload: [chunkIndex u32][totalChunks u32][bytes...]
//! complete payload: [totalChunks u32]
//! error    payload: UTF-8 message
//! ```
//!
//! The transfer channel is unordered, so `complete` repeats the chunk count:
//! a receiver can recognise a marker that overtook the thread's last chunks.

use crate::error::FrameError;

/// Length of the fixed `type` + `idLen` prefix
pub const FRAME_PREFIX_SIZE: usize = 8;

/// Frame type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FrameType {
    /// Slice of file data
    Chunk = 0,
    /// Thread finished sending
    Complete = 1,
    /// Thread failed on the sender
    Error = 2,
}

impl TryFrom<u32> for FrameType {
    type Error = FrameError;

    fn try_from(value: u32) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Self::Chunk),
            1 => Ok(Self::Complete),
            2 => Ok(Self::Error),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Decoded transfer frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFrame {
    /// File data for one thread
    Chunk {
        /// Thread request id
        id: String,
        /// Position of this chunk within the thread
        index: u32,
        /// Number of chunks the thread sends
        total: u32,
        /// Chunk bytes
        data: Vec<u8>,
    },
    /// Thread finished sending `total` chunks
    Complete {
        /// Thread request id
        id: String,
        /// Number of chunks the thread sent
        total: u32,
    },
    /// Thread failed on the sender
    Error {
        /// Thread request id
        id: String,
        /// Failure description
        message: String,
    },
}

fn read_u32(data: &[u8], at: usize) -> Result<u32, FrameError> {
    let bytes = data.get(at..at + 4).ok_or(FrameError::Truncated {
        needed: at + 4,
        actual: data.len(),
    })?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl TransferFrame {
    /// Frame type code
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Chunk { .. } => FrameType::Chunk,
            Self::Complete { .. } => FrameType::Complete,
            Self::Error { .. } => FrameType::Error,
        }
    }

    /// Thread request id the frame belongs to
    pub fn id(&self) -> &str {
        match self {
            Self::Chunk { id, .. } | Self::Complete { id, .. } | Self::Error { id, .. } => id,
        }
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        let payload = match self {
            Self::Chunk { data, .. } => 8 + data.len(),
            Self::Complete { .. } => 4,
            Self::Error { message, .. } => message.len(),
        };
        FRAME_PREFIX_SIZE + self.id().len() + payload
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let id = self.id().as_bytes();
        let mut buf = Vec::with_capacity(self.encoded_len());

        buf.extend_from_slice(&(self.frame_type() as u32).to_be_bytes());
        buf.extend_from_slice(&(id.len() as u32).to_be_bytes());
        buf.extend_from_slice(id);

        match self {
            Self::Chunk {
                index, total, data, ..
            } => {
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&total.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Self::Complete { total, .. } => buf.extend_from_slice(&total.to_be_bytes()),
            Self::Error { message, .. } => buf.extend_from_slice(message.as_bytes()),
        }

        buf
    }

    /// Parse wire bytes
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] for truncated input, an unknown type code, or
    /// non-UTF-8 text fields.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let frame_type = FrameType::try_from(read_u32(data, 0)?)?;
        let id_len = read_u32(data, 4)? as usize;

        let id_end = FRAME_PREFIX_SIZE
            .checked_add(id_len)
            .ok_or(FrameError::Truncated {
                needed: usize::MAX,
                actual: data.len(),
            })?;
        let id_bytes = data
            .get(FRAME_PREFIX_SIZE..id_end)
            .ok_or(FrameError::Truncated {
                needed: id_end,
                actual: data.len(),
            })?;
        let id = std::str::from_utf8(id_bytes)
            .map_err(|_| FrameError::InvalidId)?
            .to_string();
        let payload = &data[id_end..];

        match frame_type {
            FrameType::Chunk => {
                let index = read_u32(data, id_end)?;
                let total = read_u32(data, id_end + 4)?;
                Ok(Self::Chunk {
                    id,
                    index,
                    total,
                    data: payload[8..].to_vec(),
                })
            }
            FrameType::Complete => Ok(Self::Complete {
                id,
                total: read_u32(data, id_end)?,
            }),
            FrameType::Error => {
                let message = std::str::from_utf8(payload)
                    .map_err(|_| FrameError::InvalidMessage)?
                    .to_string();
                Ok(Self::Error { id, message })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_layout() {
        let frame = TransferFrame::Chunk {
            id: "ab".to_string(),
            index: 3,
            total: 7,
            data: vec![0xAA, 0xBB],
        };
        let bytes = frame.encode();

        assert_eq!(
            bytes,
            vec![
                0, 0, 0, 0, // type
                0, 0, 0, 2, // idLen
                b'a', b'b', // id
                0, 0, 0, 3, // chunkIndex
                0, 0, 0, 7, // totalChunks
                0xAA, 0xBB,
            ]
        );
        assert_eq!(bytes.len(), frame.encoded_len());
        assert_eq!(TransferFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_complete_and_error_layout() {
        let complete = TransferFrame::Complete {
            id: "t".to_string(),
            total: 2,
        };
        assert_eq!(complete.encode(), vec![0, 0, 0, 1, 0, 0, 0, 1, b't', 0, 0, 0, 2]);

        let error = TransferFrame::Error {
            id: "t".to_string(),
            message: "disk full".to_string(),
        };
        let decoded = TransferFrame::decode(&error.encode()).unwrap();
        assert_eq!(decoded, error);
    }

    #[test]
    fn test_empty_chunk_payload() {
        let frame = TransferFrame::Chunk {
            id: "transfer-1-thread-0".to_string(),
            index: 0,
            total: 1,
            data: Vec::new(),
        };
        assert_eq!(TransferFrame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_unknown_type() {
        let bytes = [0, 0, 0, 9, 0, 0, 0, 0];
        assert_eq!(
            TransferFrame::decode(&bytes).unwrap_err(),
            FrameError::UnknownType(9)
        );
    }

    #[test]
    fn test_truncated_inputs() {
        assert!(matches!(
            TransferFrame::decode(&[0, 0, 0]),
            Err(FrameError::Truncated { .. })
        ));
        // id length points past the end
        assert!(matches!(
            TransferFrame::decode(&[0, 0, 0, 1, 0, 0, 0, 50, b'x']),
            Err(FrameError::Truncated { .. })
        ));
        // chunk without index/total
        assert!(matches!(
            TransferFrame::decode(&[0, 0, 0, 0, 0, 0, 0, 1, b'x', 0, 0]),
            Err(FrameError::Truncated { .. })
        ));
        // huge id length must not overflow
        assert!(TransferFrame::decode(&[0, 0, 0, 2, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_invalid_utf8_id() {
        let bytes = [0, 0, 0, 1, 0, 0, 0, 1, 0xFF, 0, 0, 0, 0];
        assert_eq!(TransferFrame::decode(&bytes).unwrap_err(), FrameError::InvalidId);
    }

    mod frame_properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
                let _ = TransferFrame::decode(&bytes);
            }
        }
    }
}
