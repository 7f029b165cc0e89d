//! Sending half of the transfer protocol. One driver task pumps chunks in
//! ascending index order across the channel fan-out, yielding between
//! batches and pausing on the buffered-bytes high watermark.

use crate::pump::{next_signal, CancelWatch, Signal};
use crate::transport::{ChannelTransport, TransportEvent};
use crate::{sha256_hex, FileDescriptor, TransferError, TransferUpdate};
use flux_proto::{chunk_count, FileMetadata, TransferFrame, CHUNK_SIZE, HIGH_WATERMARK, LOW_WATERMARK};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub chunk_size: usize,
    pub high_watermark: u64,
    pub low_watermark: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            high_watermark: HIGH_WATERMARK,
            low_watermark: LOW_WATERMARK,
        }
    }
}

pub struct FileSender {
    config: SenderConfig,
    updates: mpsc::Sender<TransferUpdate>,
}

impl FileSender {
    pub fn new(config: SenderConfig, updates: mpsc::Sender<TransferUpdate>) -> Self {
        Self { config, updates }
    }

    /// Streams `payload` to the peer and drives the handshake to a terminal
    /// state. The transport is borrowed for the duration of the transfer.
    pub async fn send_bytes(
        &self,
        transport: &dyn ChannelTransport,
        events: &mut mpsc::Receiver<TransportEvent>,
        cancel: watch::Receiver<bool>,
        descriptor: &FileDescriptor,
        payload: &[u8],
    ) -> Result<(), TransferError> {
        let mut cancel = CancelWatch::new(cancel);
        let result = self
            .run(transport, events, &mut cancel, descriptor, payload)
            .await;
        match &result {
            Ok(()) => self.push_terminal(TransferUpdate::Completed).await,
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
        descriptor: &FileDescriptor,
        payload: &[u8],
    ) -> Result<(), TransferError> {
        let channels = transport.channel_count().max(1);
        let total = payload.len() as u64;
        let checksum = sha256_hex(payload);
        let total_chunks = chunk_count(total, self.config.chunk_size);
        debug!(
            transfer = %descriptor.transfer_id,
            size = total,
            chunks = total_chunks,
            channels,
            "offering file"
        );

        let metadata = FileMetadata {
            transfer_id: descriptor.transfer_id.clone(),
            file_name: descriptor.file_name.clone(),
            file_size: total,
            file_type: descriptor.file_type.clone(),
            total_chunks,
            checksum: checksum.clone(),
        };
        send_control(transport, TransferFrame::Metadata(metadata)).await?;
        self.await_ack(transport, events, cancel, descriptor).await?;

        let started = Instant::now();
        let mut index = 0u32;
        while index < total_chunks {
            if cancel.is_cancelled() {
                return cancel_local(transport, descriptor).await;
            }
            self.drain_inbound(events)?;
            while transport.total_buffered_amount() > self.config.high_watermark {
                self.await_drain(transport, events, cancel, descriptor)
                    .await?;
            }
            let start = index as usize * self.config.chunk_size;
            let end = usize::min(start + self.config.chunk_size, payload.len());
            let frame = TransferFrame::Chunk {
                index,
                data: payload[start..end].to_vec(),
            };
            let encoded = frame.encode().map_err(|_| TransferError::Transport)?;
            transport
                .send(index as usize % channels, encoded)
                .await
                .map_err(|_| TransferError::Transport)?;
            index += 1;
            if index % channels as u32 == 0 || index == total_chunks {
                let transferred =
                    u64::min(index as u64 * self.config.chunk_size as u64, total);
                self.report_progress(transferred, total, started);
                tokio::task::yield_now().await;
            }
        }

        send_control(transport, TransferFrame::Complete { checksum }).await?;
        debug!(transfer = %descriptor.transfer_id, "all chunks submitted");
        self.await_outcome(transport, events, cancel, descriptor).await
    }

    /// Metadata out, chunks held until the peer acknowledges the offer.
    async fn await_ack(
        &self,
        transport: &dyn ChannelTransport,
        events: &mut mpsc::Receiver<TransportEvent>,
        cancel: &mut CancelWatch,
        descriptor: &FileDescriptor,
    ) -> Result<(), TransferError> {
        loop {
            tokio::select! {
                _ = cancel.fired() => return cancel_local(transport, descriptor).await,
                signal = next_signal(events) => match signal {
                    Signal::Frame(TransferFrame::Ack { transfer_id })
                        if transfer_id == descriptor.transfer_id =>
                    {
                        return Ok(());
                    }
                    Signal::Frame(TransferFrame::Failed { reason }) => {
                        return Err(TransferError::Rejected(reason));
                    }
                    Signal::Frame(TransferFrame::Cancel { .. }) => {
                        return Err(TransferError::Cancelled);
                    }
                    Signal::Lost => return Err(TransferError::Disconnected),
                    Signal::Frame(_) | Signal::Drained => {}
                },
            }
        }
    }

    /// Paused above the high watermark; control frames keep flowing while
    /// chunk dispatch waits for the aggregate to fall below the low mark.
    async fn await_drain(
        &self,
        transport: &dyn ChannelTransport,
        events: &mut mpsc::Receiver<TransportEvent>,
        cancel: &mut CancelWatch,
        descriptor: &FileDescriptor,
    ) -> Result<(), TransferError> {
        loop {
            tokio::select! {
                _ = cancel.fired() => return cancel_local(transport, descriptor).await,
                signal = next_signal(events) => match signal {
                    Signal::Drained => {
                        if transport.total_buffered_amount() <= self.config.low_watermark {
                            return Ok(());
                        }
                    }
                    Signal::Frame(TransferFrame::Failed { reason }) => {
                        return Err(TransferError::Rejected(reason));
                    }
                    Signal::Frame(TransferFrame::Cancel { .. }) => {
                        return Err(TransferError::Cancelled);
                    }
                    Signal::Lost => return Err(TransferError::Disconnected),
                    Signal::Frame(_) => {}
                },
            }
        }
    }

    async fn await_outcome(
        &self,
        transport: &dyn ChannelTransport,
        events: &mut mpsc::Receiver<TransportEvent>,
        cancel: &mut CancelWatch,
        descriptor: &FileDescriptor,
    ) -> Result<(), TransferError> {
        loop {
            tokio::select! {
                _ = cancel.fired() => return cancel_local(transport, descriptor).await,
                signal = next_signal(events) => match signal {
                    Signal::Frame(TransferFrame::Success { .. }) => return Ok(()),
                    Signal::Frame(TransferFrame::Failed { reason }) => {
                        return Err(TransferError::Rejected(reason));
                    }
                    Signal::Frame(TransferFrame::Cancel { .. }) => {
                        return Err(TransferError::Cancelled);
                    }
                    Signal::Lost => return Err(TransferError::Disconnected),
                    Signal::Frame(_) | Signal::Drained => {}
                },
            }
        }
    }

    /// Non-blocking sweep of inbound control frames between chunk sends.
    fn drain_inbound(
        &self,
        events: &mut mpsc::Receiver<TransportEvent>,
    ) -> Result<(), TransferError> {
        while let Ok(event) = events.try_recv() {
            match crate::pump::classify(event) {
                Some(Signal::Frame(TransferFrame::Failed { reason })) => {
                    return Err(TransferError::Rejected(reason));
                }
                Some(Signal::Frame(TransferFrame::Cancel { .. })) => {
                    return Err(TransferError::Cancelled);
                }
                Some(Signal::Lost) => return Err(TransferError::Disconnected),
                Some(Signal::Frame(_)) | Some(Signal::Drained) | None => {}
            }
        }
        Ok(())
    }

    fn report_progress(&self, transferred: u64, total: u64, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64();
        let speed_bps = if elapsed > 0.0 {
            transferred as f64 / elapsed
        } else {
            0.0
        };
        // Progress is lossy under a congested consumer; terminal updates are not.
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

async fn cancel_local(
    transport: &dyn ChannelTransport,
    descriptor: &FileDescriptor,
) -> Result<(), TransferError> {
    let frame = TransferFrame::Cancel {
        transfer_id: descriptor.transfer_id.clone(),
    };
    if let Ok(encoded) = frame.encode() {
        let _ = transport.send(0, encoded).await;
    }
    Err(TransferError::Cancelled)
}
