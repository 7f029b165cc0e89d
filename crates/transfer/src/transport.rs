//! Abstraction over the ordered reliable datagram transport carrying
//! transfer frames. The concrete transport (data channels of the peer link)
//! lives behind [`ChannelTransport`]; the protocol state machines only ever
//! borrow it and observe it through a [`TransportEvent`] stream.

use async_trait::async_trait;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, PartialEq, Eq)]
pub enum TransportError {
    UnknownChannel,
    ChannelClosed,
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownChannel => write!(f, "unknown channel index"),
            Self::ChannelClosed => write!(f, "channel closed"),
        }
    }
}

impl Error for TransportError {}

/// Connection-level state of the underlying peer link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed(String),
}

/// Events delivered by a transport adapter to the endpoint driving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ChannelOpened(usize),
    ChannelClosed(usize),
    Inbound { channel: usize, payload: Vec<u8> },
    BufferDrained { channel: usize, buffered: u64 },
    State(LinkState),
}

/// N parallel ordered reliable binary channels plus buffered-bytes
/// accounting. Implementations wrap one concrete transport library and are
/// the only code aware of it.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    fn channel_count(&self) -> usize;

    /// Enqueues a binary frame on the given channel.
    async fn send(&self, channel: usize, payload: Vec<u8>) -> Result<(), TransportError>;

    fn buffered_amount(&self, channel: usize) -> u64;

    /// Aggregate buffered bytes across all channels; the sender's
    /// backpressure predicate reads this.
    fn total_buffered_amount(&self) -> u64;
}
