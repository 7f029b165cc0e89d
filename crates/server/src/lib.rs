//! The Flux signaling hub: authenticates peers over WebSocket, discovers
//! them by connect code, maintains friendships, and brokers P2P session
//! negotiation. Bulk file content never touches the hub; it only relays
//! control messages.

pub mod config;
pub mod directory;
pub mod hub;
pub mod metrics;
pub mod registry;
pub mod session;
