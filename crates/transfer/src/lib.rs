//! Peer-to-peer file transfer protocol: chunked framing over N parallel
//! ordered reliable channels, watermark backpressure, whole-file SHA-256
//! verification, and progress/cancellation surfaces.

use sha2::{Digest, Sha256};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod memory;
pub(crate) mod pump;
pub mod receiver;
pub mod sender;
pub mod transport;

pub use flux_proto::{
    chunk_count, FileMetadata, TransferFrame, CHANNEL_COUNT, CHUNK_SIZE, HIGH_WATERMARK,
    LOW_WATERMARK,
};
pub use memory::{MemoryEndpoint, MemoryLink};
pub use receiver::{FileReceiver, ReceivedFile, ReceiverConfig};
pub use sender::{FileSender, SenderConfig};
pub use transport::{ChannelTransport, LinkState, TransportError, TransportEvent};

/// What the local endpoint knows about a file before offering it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub transfer_id: String,
    pub file_name: String,
    pub file_type: String,
}

/// Progress and terminal events reported to the consumer of a transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferUpdate {
    Progress {
        transferred: u64,
        total: u64,
        speed_bps: f64,
    },
    Completed,
    Failed(String),
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TransferError {
    Transport,
    Disconnected,
    Cancelled,
    Rejected(String),
    MissingChunk(u32),
    ChecksumMismatch,
    ScratchWrite,
}

impl Display for TransferError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport => write!(f, "transport failure"),
            Self::Disconnected => write!(f, "peer link lost"),
            Self::Cancelled => write!(f, "transfer cancelled"),
            Self::Rejected(reason) => write!(f, "{reason}"),
            Self::MissingChunk(index) => write!(f, "Missing chunk {index}"),
            Self::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Self::ScratchWrite => write!(f, "Scratch write failed"),
        }
    }
}

impl Error for TransferError {}

/// Lowercase hex SHA-256 of a payload.
pub fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push(hex_nibble(byte >> 4));
        output.push(hex_nibble(byte & 0x0f));
    }
    output
}

fn hex_nibble(value: u8) -> char {
    match value {
        0..=9 => char::from(b'0' + value),
        10..=15 => char::from(b'a' + (value - 10)),
        _ => '0',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_matches_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn failure_reasons_match_the_wire_text() {
        assert_eq!(TransferError::MissingChunk(3).to_string(), "Missing chunk 3");
        assert_eq!(
            TransferError::ChecksumMismatch.to_string(),
            "Checksum mismatch"
        );
    }
}
