//! In-memory P2P session table. State transitions are the only legal
//! mutations; terminal transitions delete the record, and a peer disconnect
//! purges every session referencing it.

use chrono::{DateTime, Utc};
use flux_proto::signal::FileHint;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Accepted,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub initiator: String,
    pub responder: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub file: FileHint,
}

impl Session {
    /// The participant on the far side of `user_id`, if `user_id` is a
    /// participant at all.
    pub fn other_peer(&self, user_id: &str) -> Option<&str> {
        if self.initiator == user_id {
            Some(&self.responder)
        } else if self.responder == user_id {
            Some(&self.initiator)
        } else {
            None
        }
    }

    fn involves(&self, user_id: &str) -> bool {
        self.initiator == user_id || self.responder == user_id
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SessionError {
    NotFound,
    AlreadyExists,
    InvalidTransition,
    NotParticipant,
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "session not found"),
            Self::AlreadyExists => write!(f, "session already exists"),
            Self::InvalidTransition => write!(f, "invalid session state"),
            Self::NotParticipant => write!(f, "not a session participant"),
        }
    }
}

impl Error for SessionError {}

#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(
        &self,
        session_id: &str,
        initiator: &str,
        responder: &str,
        file: FileHint,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return Err(SessionError::AlreadyExists);
        }
        sessions.insert(
            session_id.to_string(),
            Session {
                session_id: session_id.to_string(),
                initiator: initiator.to_string(),
                responder: responder.to_string(),
                state: SessionState::Pending,
                created_at: Utc::now(),
                file,
            },
        );
        Ok(())
    }

    /// `pending → accepted`, driven by the responder.
    pub async fn accept(&self, session_id: &str, actor: &str) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id).ok_or(SessionError::NotFound)?;
        if session.responder != actor {
            return Err(SessionError::NotParticipant);
        }
        if session.state != SessionState::Pending {
            return Err(SessionError::InvalidTransition);
        }
        session.state = SessionState::Accepted;
        Ok(session.clone())
    }

    /// `accepted → connected`, driven by either participant once the direct
    /// link is up.
    pub async fn mark_connected(
        &self,
        session_id: &str,
        actor: &str,
    ) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id).ok_or(SessionError::NotFound)?;
        if !session.involves(actor) {
            return Err(SessionError::NotParticipant);
        }
        if session.state != SessionState::Accepted {
            return Err(SessionError::InvalidTransition);
        }
        session.state = SessionState::Connected;
        Ok(session.clone())
    }

    /// Terminal removal (reject or close) by a participant. Absent sessions
    /// are a no-op rather than an error.
    pub async fn remove_for(&self, session_id: &str, actor: &str) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(session_id) {
            Some(session) if session.involves(actor) => sessions.remove(session_id),
            _ => None,
        }
    }

    /// Drops every session referencing the peer; returns the purged rows so
    /// the hub can notify survivors.
    pub async fn purge_for_peer(&self, user_id: &str) -> Vec<Session> {
        let mut sessions = self.sessions.write().await;
        let doomed: Vec<String> = sessions
            .values()
            .filter(|session| session.involves(user_id))
            .map(|session| session.session_id.clone())
            .collect();
        doomed
            .iter()
            .filter_map(|session_id| sessions.remove(session_id))
            .collect()
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned()
    }

    pub async fn len(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
