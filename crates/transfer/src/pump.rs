//! Shared plumbing for the sender and receiver drivers: transport events
//! folded into protocol signals, and a cancellation watch that stays quiet
//! after its sender goes away.

use crate::transport::{LinkState, TransportEvent};
use flux_proto::TransferFrame;
use tokio::sync::{mpsc, watch};
use tracing::warn;

pub(crate) enum Signal {
    Frame(TransferFrame),
    Drained,
    Lost,
}

pub(crate) fn classify(event: TransportEvent) -> Option<Signal> {
    match event {
        TransportEvent::Inbound { payload, .. } => match TransferFrame::decode(&payload) {
            Ok(frame) => Some(Signal::Frame(frame)),
            Err(error) => {
                warn!(error = %error, "dropping undecodable frame");
                None
            }
        },
        TransportEvent::BufferDrained { .. } => Some(Signal::Drained),
        TransportEvent::ChannelClosed(_) => Some(Signal::Lost),
        TransportEvent::State(LinkState::Disconnected) | TransportEvent::State(LinkState::Failed(_)) => {
            Some(Signal::Lost)
        }
        TransportEvent::ChannelOpened(_) | TransportEvent::State(_) => None,
    }
}

/// Blocks until the next meaningful signal; a closed event stream reads as a
/// lost link.
pub(crate) async fn next_signal(events: &mut mpsc::Receiver<TransportEvent>) -> Signal {
    loop {
        match events.recv().await {
            None => return Signal::Lost,
            Some(event) => {
                if let Some(signal) = classify(event) {
                    return signal;
                }
            }
        }
    }
}

/// A `watch`-backed cancellation flag. Once the flag's sender is dropped the
/// watch goes permanently silent instead of spinning.
pub(crate) struct CancelWatch {
    rx: watch::Receiver<bool>,
    open: bool,
}

impl CancelWatch {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx, open: true }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation fires; never resolves once the sender is
    /// gone without having fired.
    pub(crate) async fn fired(&mut self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            if !self.open {
                std::future::pending::<()>().await;
            }
            if self.rx.changed().await.is_err() {
                self.open = false;
            }
        }
    }
}
