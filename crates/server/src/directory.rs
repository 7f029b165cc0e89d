//! Identity and directory facade. The hub talks to a [`Directory`] trait
//! object; production wires it to PostgreSQL, tests wire it to memory.

use async_trait::async_trait;
use flux_storage::{Storage, StorageError};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DirectoryError {
    Unauthenticated,
    SelfFriend,
    AlreadyFriends,
    CodeExhaustion,
    Backend,
}

impl Display for DirectoryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "token rejected"),
            Self::SelfFriend => write!(f, "cannot befriend self"),
            Self::AlreadyFriends => write!(f, "friendship already present"),
            Self::CodeExhaustion => write!(f, "connect code space exhausted"),
            Self::Backend => write!(f, "directory backend failure"),
        }
    }
}

impl Error for DirectoryError {}

impl From<StorageError> for DirectoryError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::SelfFriend => Self::SelfFriend,
            StorageError::AlreadyFriends => Self::AlreadyFriends,
            StorageError::CodeExhaustion => Self::CodeExhaustion,
            StorageError::Postgres | StorageError::Missing => Self::Backend,
        }
    }
}

/// Display handle shown next to a peer: the local-part of their email.
pub fn handle_from_email(email: &str) -> String {
    match email.split('@').next() {
        Some(local) if !local.is_empty() => local.to_string(),
        _ => email.to_string(),
    }
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// Validates a bearer credential against the identity provider.
    async fn verify_token(&self, token: &str) -> Result<AuthenticatedUser, DirectoryError>;

    /// Returns the user's connect code, allocating one on first request.
    async fn connect_code(&self, user_id: &str) -> Result<String, DirectoryError>;

    /// Resolves an uppercased connect code to its owner.
    async fn resolve_code(&self, code: &str) -> Result<Option<String>, DirectoryError>;

    /// Inserts a symmetric friendship; idempotence violations surface as
    /// typed errors.
    async fn add_friendship(&self, user_id: &str, friend_id: &str) -> Result<(), DirectoryError>;

    async fn friend_ids(&self, user_id: &str) -> Result<Vec<String>, DirectoryError>;

    async fn lookup_user(&self, user_id: &str)
        -> Result<Option<AuthenticatedUser>, DirectoryError>;
}

pub struct PgDirectory {
    storage: Arc<Storage>,
}

impl PgDirectory {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn verify_token(&self, token: &str) -> Result<AuthenticatedUser, DirectoryError> {
        match self.storage.resolve_session_token(token).await? {
            Some(record) => Ok(AuthenticatedUser {
                user_id: record.user_id,
                email: record.email,
            }),
            None => Err(DirectoryError::Unauthenticated),
        }
    }

    async fn connect_code(&self, user_id: &str) -> Result<String, DirectoryError> {
        Ok(self.storage.get_or_create_connect_code(user_id).await?)
    }

    async fn resolve_code(&self, code: &str) -> Result<Option<String>, DirectoryError> {
        Ok(self.storage.resolve_connect_code(code).await?)
    }

    async fn add_friendship(&self, user_id: &str, friend_id: &str) -> Result<(), DirectoryError> {
        Ok(self.storage.add_friendship(user_id, friend_id).await?)
    }

    async fn friend_ids(&self, user_id: &str) -> Result<Vec<String>, DirectoryError> {
        Ok(self.storage.list_friend_ids(user_id).await?)
    }

    async fn lookup_user(
        &self,
        user_id: &str,
    ) -> Result<Option<AuthenticatedUser>, DirectoryError> {
        Ok(self.storage.load_user(user_id).await?.map(|record| {
            AuthenticatedUser {
                user_id: record.user_id,
                email: record.email,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_is_the_email_local_part() {
        assert_eq!(handle_from_email("ada@example.com"), "ada");
        assert_eq!(handle_from_email("grace.h@dept.example.org"), "grace.h");
    }

    #[test]
    fn degenerate_emails_fall_back_to_the_full_string() {
        assert_eq!(handle_from_email("@example.com"), "@example.com");
        assert_eq!(handle_from_email("opaque-id"), "opaque-id");
    }
}
