//! Receiving half of the transfer protocol. Chunks accumulate in an
//! index-keyed map owned exclusively by this task; the reassembled payload is
//! verified against the declared SHA-256 before it touches the scratch path.

use crate::pump::{next_signal, CancelWatch, Signal};
use crate::transport::{ChannelTransport, TransportEvent};
use crate::{sha256_hex, TransferError, TransferUpdate};
use flux_proto::{FileMetadata, TransferFrame};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Directory receiving reassembled payloads.
    pub scratch_dir: PathBuf,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir(),
        }
    }
}

/// A verified, persisted transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub transfer_id: String,
    pub file_name: String,
    pub file_type: String,
    pub size: u64,
    pub checksum: String,
    pub path: PathBuf,
}

pub struct FileReceiver {
    config: ReceiverConfig,
    updates: mpsc::Sender<TransferUpdate>,
}

impl FileReceiver {
    pub fn new(config: ReceiverConfig, updates: mpsc::Sender<TransferUpdate>) -> Self {
        Self { config, updates }
    }

    /// Accepts one inbound transfer and drives it to a terminal state.
    pub async fn receive(
        &self,
        transport: &dyn ChannelTransport,
        events: &mut mpsc::Receiver<TransportEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Result<ReceivedFile, TransferError> {
        let mut cancel = CancelWatch::new(cancel);
        let result = self.run(transport, events, &mut cancel).await;
        match &result {
            Ok(_) => self.push_terminal(TransferUpdate::Completed).await,
            Err(TransferError::Cancelled) => self.push_terminal(TransferUpdate::Cancelled).await,
            Err(error) => {
                self.push_terminal(TransferUpdate::Failed(error.to_string()))
                    .await
            }
        }
        result
    }

    async fn run(
        &self,
        transport: &dyn ChannelTransport,
        events: &mut mpsc::Receiver<TransportEvent>,
        cancel: &mut CancelWatch,
    ) -> Result<ReceivedFile, TransferError> {
        let metadata = self.await_metadata(transport, events, cancel).await?;
        debug!(
            transfer = %metadata.transfer_id,
            file = %metadata.file_name,
            size = metadata.file_size,
            chunks = metadata.total_chunks,
            "incoming file"
        );
        send_control(
            transport,
            TransferFrame::Ack {
                transfer_id: metadata.transfer_id.clone(),
            },
        )
        .await?;

        let (chunks, declared_checksum) = self
            .collect_chunks(transport, events, cancel, &metadata)
            .await?;
        let payload = self.reassemble(transport, &metadata, chunks).await?;

        let checksum = sha256_hex(&payload);
        if !checksum.eq_ignore_ascii_case(&declared_checksum) {
            send_failure(transport, "Checksum mismatch").await;
            return Err(TransferError::ChecksumMismatch);
        }

        let path = self
            .config
            .scratch_dir
            .join(scratch_file_name(&metadata.transfer_id, &metadata.file_name));
        if let Err(error) = tokio::fs::write(&path, &payload).await {
            warn!(path = %path.display(), error = %error, "scratch write failed");
            send_failure(transport, "Scratch write failed").await;
            return Err(TransferError::ScratchWrite);
        }

        send_control(
            transport,
            TransferFrame::Success {
                transfer_id: metadata.transfer_id.clone(),
            },
        )
        .await?;
        debug!(transfer = %metadata.transfer_id, path = %path.display(), "transfer verified");

        Ok(ReceivedFile {
            transfer_id: metadata.transfer_id,
            file_name: metadata.file_name,
            file_type: metadata.file_type,
            size: payload.len() as u64,
            checksum,
            path,
        })
    }

    async fn await_metadata(
        &self,
        transport: &dyn ChannelTransport,
        events: &mut mpsc::Receiver<TransportEvent>,
        cancel: &mut CancelWatch,
    ) -> Result<FileMetadata, TransferError> {
        loop {
            tokio::select! {
                _ = cancel.fired() => return Err(cancel_local(transport, None).await),
                signal = next_signal(events) => match signal {
                    Signal::Frame(TransferFrame::Metadata(metadata)) => return Ok(metadata),
                    Signal::Frame(TransferFrame::Cancel { .. }) => {
                        return Err(TransferError::Cancelled);
                    }
                    Signal::Lost => return Err(TransferError::Disconnected),
                    Signal::Frame(_) | Signal::Drained => {}
                },
            }
        }
    }

    /// Collects chunk frames until `FILE_COMPLETE`; returns the chunk map
    /// and the digest declared by the sender. The first occurrence of an
    /// index wins; duplicates are tolerated and dropped.
    async fn collect_chunks(
        &self,
        transport: &dyn ChannelTransport,
        events: &mut mpsc::Receiver<TransportEvent>,
        cancel: &mut CancelWatch,
        metadata: &FileMetadata,
    ) -> Result<(HashMap<u32, Vec<u8>>, String), TransferError> {
        let mut chunks: HashMap<u32, Vec<u8>> = HashMap::new();
        let mut received: u64 = 0;
        let started = Instant::now();
        loop {
            tokio::select! {
                _ = cancel.fired() => {
                    return Err(cancel_local(transport, Some(&metadata.transfer_id)).await);
                }
                signal = next_signal(events) => match signal {
                    Signal::Frame(TransferFrame::Chunk { index, data }) => {
                        if let std::collections::hash_map::Entry::Vacant(entry) =
                            chunks.entry(index)
                        {
                            received += data.len() as u64;
                            entry.insert(data);
                            self.report_progress(received, metadata.file_size, started);
                        } else {
                            debug!(index, "duplicate chunk dropped");
                        }
                    }
                    Signal::Frame(TransferFrame::Complete { checksum }) => {
                        return Ok((chunks, checksum));
                    }
                    Signal::Frame(TransferFrame::Cancel { .. }) => {
                        return Err(TransferError::Cancelled);
                    }
                    Signal::Frame(TransferFrame::Failed { reason }) => {
                        return Err(TransferError::Rejected(reason));
                    }
                    Signal::Lost => return Err(TransferError::Disconnected),
                    Signal::Frame(_) | Signal::Drained => {}
                },
            }
        }
    }

    /// Verifies coverage of `0 … N-1` and concatenates in index order.
    async fn reassemble(
        &self,
        transport: &dyn ChannelTransport,
        metadata: &FileMetadata,
        mut chunks: HashMap<u32, Vec<u8>>,
    ) -> Result<Vec<u8>, TransferError> {
        for index in 0..metadata.total_chunks {
            if !chunks.contains_key(&index) {
                send_failure(transport, &format!("Missing chunk {index}")).await;
                return Err(TransferError::MissingChunk(index));
            }
        }
        let mut payload = Vec::with_capacity(metadata.file_size as usize);
        for index in 0..metadata.total_chunks {
            if let Some(data) = chunks.remove(&index) {
                payload.extend_from_slice(&data);
            }
        }
        Ok(payload)
    }

    fn report_progress(&self, transferred: u64, total: u64, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64();
        let speed_bps = if elapsed > 0.0 {
            transferred as f64 / elapsed
        } else {
            0.0
        };
        let _ = self.updates.try_send(TransferUpdate::Progress {
            transferred,
            total,
            speed_bps,
        });
    }

    async fn push_terminal(&self, update: TransferUpdate) {
        let _ = self.updates.send(update).await;
    }
}

async fn send_control(
    transport: &dyn ChannelTransport,
    frame: TransferFrame,
) -> Result<(), TransferError> {
    let encoded = frame.encode().map_err(|_| TransferError::Transport)?;
    transport
        .send(0, encoded)
        .await
        .map_err(|_| TransferError::Transport)
}

async fn send_failure(transport: &dyn ChannelTransport, reason: &str) {
    let frame = TransferFrame::Failed {
        reason: reason.to_string(),
    };
    if let Ok(encoded) = frame.encode() {
        let _ = transport.send(0, encoded).await;
    }
}

async fn cancel_local(
    transport: &dyn ChannelTransport,
    transfer_id: Option<&str>,
) -> TransferError {
    let frame = TransferFrame::Cancel {
        transfer_id: transfer_id.unwrap_or_default().to_string(),
    };
    if let Ok(encoded) = frame.encode() {
        let _ = transport.send(0, encoded).await;
    }
    TransferError::Cancelled
}

/// Scratch file names are derived from attacker-supplied strings; anything
/// outside a conservative character set is flattened.
fn scratch_file_name(transfer_id: &str, file_name: &str) -> String {
    let base = if file_name.is_empty() {
        "payload"
    } else {
        file_name
    };
    format!("{}-{}", sanitize(transfer_id), sanitize(base))
}

fn sanitize(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches(['.', '_']).is_empty() {
        "payload".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_names_strip_path_separators() {
        assert_eq!(
            scratch_file_name("sess-1", "../../etc/passwd"),
            "sess-1-.._.._etc_passwd"
        );
        assert_eq!(scratch_file_name("sess 2", "a b.bin"), "sess_2-a_b.bin");
    }

    #[test]
    fn scratch_names_never_collapse_to_nothing() {
        assert_eq!(scratch_file_name("sess-1", ""), "sess-1-payload");
        assert_eq!(scratch_file_name("sess-1", "..."), "sess-1-payload");
    }
}
