use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod signal;

/// Default chunk payload size for file transfers.
pub const CHUNK_SIZE: usize = 64 * 1024;
/// Default number of parallel data channels per transfer session.
pub const CHANNEL_COUNT: usize = 4;
/// Aggregate buffered-bytes level at which a sender pauses chunk dispatch.
pub const HIGH_WATERMARK: u64 = 16 * 1024 * 1024;
/// Aggregate buffered-bytes level below which a paused sender resumes.
pub const LOW_WATERMARK: u64 = 4 * 1024 * 1024;
/// Upper bound on a single frame payload accepted by the codec.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Number of chunks a payload of `size` bytes splits into.
pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    if size == 0 {
        0
    } else {
        size.div_ceil(chunk_size as u64) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    FileMetadata = 1,
    FileChunk = 2,
    FileComplete = 3,
    TransferAck = 4,
    TransferSuccess = 5,
    TransferFailed = 6,
    TransferCancel = 7,
}

impl FrameType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::FileMetadata),
            2 => Some(Self::FileChunk),
            3 => Some(Self::FileComplete),
            4 => Some(Self::TransferAck),
            5 => Some(Self::TransferSuccess),
            6 => Some(Self::TransferFailed),
            7 => Some(Self::TransferCancel),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    EmptyFrame,
    InvalidFrameType,
    UnexpectedEof,
    PayloadTooLarge,
    InvalidMetadataJson,
    InvalidUtf8,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyFrame => write!(f, "empty frame"),
            Self::InvalidFrameType => write!(f, "invalid frame type"),
            Self::UnexpectedEof => write!(f, "unexpected end of frame"),
            Self::PayloadTooLarge => write!(f, "payload exceeds limits"),
            Self::InvalidMetadataJson => write!(f, "invalid metadata payload"),
            Self::InvalidUtf8 => write!(f, "invalid utf-8 payload"),
        }
    }
}

impl Error for CodecError {}

/// Per-file transfer descriptor carried in the `FILE_METADATA` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub total_chunks: u32,
    pub checksum: String,
}

/// A single frame of the transfer protocol. The first byte on the wire is
/// the type tag; chunk frames carry a big-endian `u32` index, control frames
/// carry UTF-8 payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFrame {
    Metadata(FileMetadata),
    Chunk { index: u32, data: Vec<u8> },
    Complete { checksum: String },
    Ack { transfer_id: String },
    Success { transfer_id: String },
    Failed { reason: String },
    Cancel { transfer_id: String },
}

impl TransferFrame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Metadata(_) => FrameType::FileMetadata,
            Self::Chunk { .. } => FrameType::FileChunk,
            Self::Complete { .. } => FrameType::FileComplete,
            Self::Ack { .. } => FrameType::TransferAck,
            Self::Success { .. } => FrameType::TransferSuccess,
            Self::Failed { .. } => FrameType::TransferFailed,
            Self::Cancel { .. } => FrameType::TransferCancel,
        }
    }

    /// Control frames travel on channel 0 only; chunk frames fan out.
    pub fn is_control(&self) -> bool {
        !matches!(self, Self::Chunk { .. })
    }

    /// Serializes the frame into its tagged binary representation.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buffer = vec![self.frame_type() as u8];
        match self {
            Self::Metadata(metadata) => {
                let encoded =
                    serde_json::to_vec(metadata).map_err(|_| CodecError::InvalidMetadataJson)?;
                if encoded.len() > MAX_FRAME_LEN {
                    return Err(CodecError::PayloadTooLarge);
                }
                buffer.extend_from_slice(&encoded);
            }
            Self::Chunk { index, data } => {
                if data.len() > MAX_FRAME_LEN {
                    return Err(CodecError::PayloadTooLarge);
                }
                buffer.extend_from_slice(&index.to_be_bytes());
                buffer.extend_from_slice(data);
            }
            Self::Complete { checksum } => buffer.extend_from_slice(checksum.as_bytes()),
            Self::Ack { transfer_id }
            | Self::Success { transfer_id }
            | Self::Cancel { transfer_id } => buffer.extend_from_slice(transfer_id.as_bytes()),
            Self::Failed { reason } => buffer.extend_from_slice(reason.as_bytes()),
        }
        Ok(buffer)
    }

    /// Decodes one frame from a datagram-bounded buffer.
    pub fn decode(buffer: &[u8]) -> Result<Self, CodecError> {
        let tag = *buffer.first().ok_or(CodecError::EmptyFrame)?;
        let frame_type = FrameType::from_u8(tag).ok_or(CodecError::InvalidFrameType)?;
        let payload = &buffer[1..];
        if payload.len() > MAX_FRAME_LEN + 4 {
            return Err(CodecError::PayloadTooLarge);
        }
        match frame_type {
            FrameType::FileMetadata => serde_json::from_slice(payload)
                .map(Self::Metadata)
                .map_err(|_| CodecError::InvalidMetadataJson),
            FrameType::FileChunk => {
                if payload.len() < 4 {
                    return Err(CodecError::UnexpectedEof);
                }
                let mut index_bytes = [0u8; 4];
                index_bytes.copy_from_slice(&payload[..4]);
                Ok(Self::Chunk {
                    index: u32::from_be_bytes(index_bytes),
                    data: payload[4..].to_vec(),
                })
            }
            FrameType::FileComplete => Ok(Self::Complete {
                checksum: utf8_payload(payload)?,
            }),
            FrameType::TransferAck => Ok(Self::Ack {
                transfer_id: utf8_payload(payload)?,
            }),
            FrameType::TransferSuccess => Ok(Self::Success {
                transfer_id: utf8_payload(payload)?,
            }),
            FrameType::TransferFailed => Ok(Self::Failed {
                reason: utf8_payload(payload)?,
            }),
            FrameType::TransferCancel => Ok(Self::Cancel {
                transfer_id: utf8_payload(payload)?,
            }),
        }
    }
}

fn utf8_payload(payload: &[u8]) -> Result<String, CodecError> {
    std::str::from_utf8(payload)
        .map(str::to_string)
        .map_err(|_| CodecError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> FileMetadata {
        FileMetadata {
            transfer_id: "sess-41".to_string(),
            file_name: "report.pdf".to_string(),
            file_size: 131_072,
            file_type: "pdf".to_string(),
            total_chunks: 2,
            checksum: "ab".repeat(32),
        }
    }

    #[test]
    fn metadata_roundtrip() {
        let frame = TransferFrame::Metadata(sample_metadata());
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded[0], 1);
        assert_eq!(TransferFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn chunk_roundtrip_preserves_index_and_bytes() {
        let frame = TransferFrame::Chunk {
            index: 7,
            data: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded[0], 2);
        assert_eq!(&encoded[1..5], &7u32.to_be_bytes());
        assert_eq!(TransferFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn empty_chunk_payload_is_legal() {
        let frame = TransferFrame::Chunk {
            index: 0,
            data: Vec::new(),
        };
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), 5);
        assert_eq!(TransferFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn control_frames_roundtrip() {
        let frames = [
            TransferFrame::Complete {
                checksum: "CAFE".repeat(16),
            },
            TransferFrame::Ack {
                transfer_id: "sess-41".to_string(),
            },
            TransferFrame::Success {
                transfer_id: "sess-41".to_string(),
            },
            TransferFrame::Failed {
                reason: "Missing chunk 3".to_string(),
            },
            TransferFrame::Cancel {
                transfer_id: "sess-41".to_string(),
            },
        ];
        for frame in frames {
            let encoded = frame.encode().unwrap();
            assert_eq!(TransferFrame::decode(&encoded).unwrap(), frame);
            assert!(frame.is_control());
        }
    }

    #[test]
    fn decode_rejects_empty_buffer() {
        assert!(matches!(
            TransferFrame::decode(&[]),
            Err(CodecError::EmptyFrame)
        ));
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        assert!(matches!(
            TransferFrame::decode(&[0x2a, 1, 2]),
            Err(CodecError::InvalidFrameType)
        ));
    }

    #[test]
    fn decode_rejects_truncated_chunk_header() {
        assert!(matches!(
            TransferFrame::decode(&[2, 0, 0]),
            Err(CodecError::UnexpectedEof)
        ));
    }

    #[test]
    fn decode_rejects_non_utf8_control_payload() {
        assert!(matches!(
            TransferFrame::decode(&[3, 0xff, 0xfe]),
            Err(CodecError::InvalidUtf8)
        ));
    }

    #[test]
    fn encode_rejects_oversized_chunk() {
        let frame = TransferFrame::Chunk {
            index: 0,
            data: vec![0u8; MAX_FRAME_LEN + 1],
        };
        assert!(matches!(frame.encode(), Err(CodecError::PayloadTooLarge)));
    }

    #[test]
    fn metadata_serializes_camel_case() {
        let value = serde_json::to_value(sample_metadata()).unwrap();
        assert!(value.get("transferId").is_some());
        assert!(value.get("fileName").is_some());
        assert!(value.get("totalChunks").is_some());
        assert!(value.get("transfer_id").is_none());
    }

    #[test]
    fn chunk_count_boundaries() {
        assert_eq!(chunk_count(0, CHUNK_SIZE), 0);
        assert_eq!(chunk_count(1, CHUNK_SIZE), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64, CHUNK_SIZE), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64 + 1, CHUNK_SIZE), 2);
        assert_eq!(chunk_count(10 * 1024 * 1024, CHUNK_SIZE), 160);
    }
}
