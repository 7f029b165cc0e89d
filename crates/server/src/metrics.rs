use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    messages_ingress: AtomicU64,
    messages_egress: AtomicU64,
    relays_forwarded: AtomicU64,
    sessions_created: AtomicU64,
    sessions_purged: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_ingress(&self) {
        self.messages_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.messages_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_relay(&self) {
        self.relays_forwarded.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_sessions_purged(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.sessions_purged.fetch_add(count, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_active: self.connections_active.load(Ordering::SeqCst),
            messages_ingress: self.messages_ingress.load(Ordering::SeqCst),
            messages_egress: self.messages_egress.load(Ordering::SeqCst),
            relays_forwarded: self.relays_forwarded.load(Ordering::SeqCst),
            sessions_created: self.sessions_created.load(Ordering::SeqCst),
            sessions_purged: self.sessions_purged.load(Ordering::SeqCst),
        }
    }

    pub fn encode_prometheus(&self) -> String {
        format!(
            "# TYPE flux_connections_active gauge\nflux_connections_active {}\n# TYPE flux_messages_ingress counter\nflux_messages_ingress {}\n# TYPE flux_messages_egress counter\nflux_messages_egress {}\n# TYPE flux_relays_forwarded counter\nflux_relays_forwarded {}\n# TYPE flux_sessions_created counter\nflux_sessions_created {}\n# TYPE flux_sessions_purged counter\nflux_sessions_purged {}\n",
            self.connections_active.load(Ordering::SeqCst),
            self.messages_ingress.load(Ordering::SeqCst),
            self.messages_egress.load(Ordering::SeqCst),
            self.relays_forwarded.load(Ordering::SeqCst),
            self.sessions_created.load(Ordering::SeqCst),
            self.sessions_purged.load(Ordering::SeqCst),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connections_active: u64,
    pub messages_ingress: u64,
    pub messages_egress: u64,
    pub relays_forwarded: u64,
    pub sessions_created: u64,
    pub sessions_purged: u64,
}
