//! In-process transport adapter: a pair of linked endpoints with N channels,
//! buffered-bytes accounting, and drain notifications. Optional pacing delays
//! delivery so buffered bytes actually accumulate, which is how the protocol
//! tests exercise the backpressure contract.

use crate::transport::{ChannelTransport, LinkState, TransportError, TransportEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

const EVENT_CAPACITY: usize = 1024;

pub struct MemoryEndpoint {
    pub link: Arc<MemoryLink>,
    pub events: mpsc::Receiver<TransportEvent>,
}

pub struct MemoryLink {
    label: String,
    channels: usize,
    buffered: Arc<Vec<AtomicU64>>,
    peak: Arc<AtomicU64>,
    outbound: mpsc::UnboundedSender<(usize, Vec<u8>)>,
    closed: Arc<AtomicBool>,
    own_events: mpsc::Sender<TransportEvent>,
    peer_events: mpsc::Sender<TransportEvent>,
}

impl MemoryLink {
    /// Opens a linked pair with `channels` channels and immediate delivery.
    pub fn pair(channels: usize, label_prefix: &str) -> (MemoryEndpoint, MemoryEndpoint) {
        Self::pair_with_pacing(channels, label_prefix, None)
    }

    /// Opens a linked pair whose deliveries are delayed by `pace` per frame.
    pub fn pair_with_pacing(
        channels: usize,
        label_prefix: &str,
        pace: Option<Duration>,
    ) -> (MemoryEndpoint, MemoryEndpoint) {
        let channels = channels.max(1);
        let (a_events_tx, a_events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (b_events_tx, b_events_rx) = mpsc::channel(EVENT_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));

        let a = Self::endpoint(
            format!("{label_prefix}-a"),
            channels,
            pace,
            Arc::clone(&closed),
            a_events_tx.clone(),
            b_events_tx.clone(),
        );
        let b = Self::endpoint(
            format!("{label_prefix}-b"),
            channels,
            pace,
            Arc::clone(&closed),
            b_events_tx.clone(),
            a_events_tx.clone(),
        );

        for index in 0..channels {
            let _ = a_events_tx.try_send(TransportEvent::ChannelOpened(index));
            let _ = b_events_tx.try_send(TransportEvent::ChannelOpened(index));
        }
        let _ = a_events_tx.try_send(TransportEvent::State(LinkState::Connected));
        let _ = b_events_tx.try_send(TransportEvent::State(LinkState::Connected));

        (
            MemoryEndpoint {
                link: a,
                events: a_events_rx,
            },
            MemoryEndpoint {
                link: b,
                events: b_events_rx,
            },
        )
    }

    fn endpoint(
        label: String,
        channels: usize,
        pace: Option<Duration>,
        closed: Arc<AtomicBool>,
        own_events: mpsc::Sender<TransportEvent>,
        peer_events: mpsc::Sender<TransportEvent>,
    ) -> Arc<Self> {
        let buffered: Arc<Vec<AtomicU64>> =
            Arc::new((0..channels).map(|_| AtomicU64::new(0)).collect());
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<(usize, Vec<u8>)>();

        let pump_buffered = Arc::clone(&buffered);
        let pump_own = own_events.clone();
        let pump_peer = peer_events.clone();
        tokio::spawn(async move {
            while let Some((channel, payload)) = outbound_rx.recv().await {
                if let Some(delay) = pace {
                    sleep(delay).await;
                }
                let len = payload.len() as u64;
                if pump_peer
                    .send(TransportEvent::Inbound { channel, payload })
                    .await
                    .is_err()
                {
                    break;
                }
                let remaining =
                    pump_buffered[channel].fetch_sub(len, Ordering::SeqCst) - len;
                let _ = pump_own
                    .send(TransportEvent::BufferDrained {
                        channel,
                        buffered: remaining,
                    })
                    .await;
            }
        });

        Arc::new(Self {
            label,
            channels,
            buffered,
            peak: Arc::new(AtomicU64::new(0)),
            outbound: outbound_tx,
            closed,
            own_events,
            peer_events,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Highest aggregate buffered-bytes level observed over the link's life.
    pub fn peak_buffered_amount(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }

    /// Tears the pair down; both endpoints observe channel closes and a
    /// disconnected state.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for index in 0..self.channels {
            let _ = self
                .own_events
                .send(TransportEvent::ChannelClosed(index))
                .await;
            let _ = self
                .peer_events
                .send(TransportEvent::ChannelClosed(index))
                .await;
        }
        let _ = self
            .own_events
            .send(TransportEvent::State(LinkState::Disconnected))
            .await;
        let _ = self
            .peer_events
            .send(TransportEvent::State(LinkState::Disconnected))
            .await;
    }
}

#[async_trait]
impl ChannelTransport for MemoryLink {
    fn channel_count(&self) -> usize {
        self.channels
    }

    async fn send(&self, channel: usize, payload: Vec<u8>) -> Result<(), TransportError> {
        if channel >= self.channels {
            return Err(TransportError::UnknownChannel);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        let len = payload.len() as u64;
        self.buffered[channel].fetch_add(len, Ordering::SeqCst);
        let total = self.total_buffered_amount();
        self.peak.fetch_max(total, Ordering::SeqCst);
        self.outbound
            .send((channel, payload))
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn buffered_amount(&self, channel: usize) -> u64 {
        self.buffered
            .get(channel)
            .map(|counter| counter.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn total_buffered_amount(&self) -> u64 {
        self.buffered
            .iter()
            .map(|counter| counter.load(Ordering::SeqCst))
            .sum()
    }
}
