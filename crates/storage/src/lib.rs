use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};

const CONNECT_CODES_SQL: &str = include_str!("../migrations/001_connect_codes.sql");
const FRIENDSHIPS_SQL: &str = include_str!("../migrations/002_friendships.sql");

/// Symbols allowed in connect codes: A-Z and 2-9 with the ambiguous
/// I, L, O, 1, 0 removed.
pub const CONNECT_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
pub const CONNECT_CODE_LENGTH: usize = 6;
const CODE_ALLOC_MAX_ATTEMPTS: usize = 10;

#[derive(Debug, PartialEq, Eq)]
pub enum StorageError {
    Postgres,
    Missing,
    SelfFriend,
    AlreadyFriends,
    CodeExhaustion,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Missing => write!(f, "missing record"),
            Self::SelfFriend => write!(f, "cannot befriend self"),
            Self::AlreadyFriends => write!(f, "friendship already present"),
            Self::CodeExhaustion => write!(f, "connect code space exhausted"),
        }
    }
}

impl Error for StorageError {}

/// A row of the externally owned user directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: String,
    pub email: String,
}

pub struct Storage {
    client: Client,
    _pg_task: JoinHandle<()>,
}

/// Establishes connectivity to the PostgreSQL backend.
pub async fn connect(postgres_dsn: &str) -> Result<Storage, StorageError> {
    let (client, connection) = tokio_postgres::connect(postgres_dsn, NoTls)
        .await
        .map_err(|_| StorageError::Postgres)?;
    let task = tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!("postgres connection stopped: {}", error);
        }
    });
    Ok(Storage {
        client,
        _pg_task: task,
    })
}

impl Storage {
    /// Applies the bundled migrations. The `users` and `auth_sessions`
    /// tables belong to the user directory and session store and are
    /// provisioned out of band.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        self.client
            .batch_execute(CONNECT_CODES_SQL)
            .await
            .map_err(|_| StorageError::Postgres)?;
        self.client
            .batch_execute(FRIENDSHIPS_SQL)
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Executes a lightweight readiness probe.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Resolves a bearer token against the session store. Expired or unknown
    /// tokens resolve to `None`.
    pub async fn resolve_session_token(
        &self,
        token: &str,
    ) -> Result<Option<UserRecord>, StorageError> {
        let now = Utc::now();
        let row = self
            .client
            .query_opt(
                "SELECT s.user_id, u.email FROM auth_sessions s
                JOIN users u ON u.id = s.user_id
                WHERE s.token = $1 AND s.expires_at > $2",
                &[&token, &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.map(|row| UserRecord {
            user_id: row.get(0),
            email: row.get(1),
        }))
    }

    /// Looks up a user in the directory.
    pub async fn load_user(&self, user_id: &str) -> Result<Option<UserRecord>, StorageError> {
        let row = self
            .client
            .query_opt("SELECT id, email FROM users WHERE id = $1", &[&user_id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.map(|row| UserRecord {
            user_id: row.get(0),
            email: row.get(1),
        }))
    }

    /// Returns the user's connect code, allocating one on first request.
    /// Allocation draws uniformly random candidates and retries uniqueness
    /// collisions a bounded number of times.
    pub async fn get_or_create_connect_code(
        &self,
        user_id: &str,
    ) -> Result<String, StorageError> {
        if let Some(code) = self.connect_code_for(user_id).await? {
            return Ok(code);
        }
        for _ in 0..CODE_ALLOC_MAX_ATTEMPTS {
            let code = generate_connect_code();
            let inserted = self
                .client
                .execute(
                    "INSERT INTO connect_codes (user_id, code) VALUES ($1, $2)
                    ON CONFLICT DO NOTHING",
                    &[&user_id, &code],
                )
                .await
                .map_err(|_| StorageError::Postgres)?;
            if inserted == 1 {
                return Ok(code);
            }
            // A concurrent allocator for the same user may have won the race.
            if let Some(existing) = self.connect_code_for(user_id).await? {
                return Ok(existing);
            }
        }
        Err(StorageError::CodeExhaustion)
    }

    async fn connect_code_for(&self, user_id: &str) -> Result<Option<String>, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT code FROM connect_codes WHERE user_id = $1",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.map(|row| row.get(0)))
    }

    /// Resolves a connect code to its owner. Codes are stored uppercase.
    pub async fn resolve_connect_code(
        &self,
        code: &str,
    ) -> Result<Option<String>, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT user_id FROM connect_codes WHERE code = $1",
                &[&code],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.map(|row| row.get(0)))
    }

    /// Inserts both directed friendship edges inside one transaction.
    pub async fn add_friendship(&self, a: &str, b: &str) -> Result<(), StorageError> {
        if a == b {
            return Err(StorageError::SelfFriend);
        }
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|_| StorageError::Postgres)?;
        let present = match self
            .client
            .query_opt(
                "SELECT 1 FROM friendships WHERE user_id = $1 AND friend_id = $2",
                &[&a, &b],
            )
            .await
        {
            Ok(row) => row.is_some(),
            Err(_) => {
                let _ = self.client.batch_execute("ROLLBACK").await;
                return Err(StorageError::Postgres);
            }
        };
        if present {
            let _ = self.client.batch_execute("ROLLBACK").await;
            return Err(StorageError::AlreadyFriends);
        }
        if self
            .client
            .execute(
                "INSERT INTO friendships (user_id, friend_id) VALUES ($1, $2), ($2, $1)",
                &[&a, &b],
            )
            .await
            .is_err()
        {
            let _ = self.client.batch_execute("ROLLBACK").await;
            return Err(StorageError::Postgres);
        }
        if self.client.batch_execute("COMMIT").await.is_err() {
            let _ = self.client.batch_execute("ROLLBACK").await;
            return Err(StorageError::Postgres);
        }
        Ok(())
    }

    /// Lists the user's friends as bare ids.
    pub async fn list_friend_ids(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT friend_id FROM friendships WHERE user_id = $1 ORDER BY created_at",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }
}

fn generate_connect_code() -> String {
    let mut bytes = [0u8; CONNECT_CODE_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|byte| CONNECT_CODE_ALPHABET[(*byte as usize) % CONNECT_CODE_ALPHABET.len()] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_code_has_expected_shape() {
        let code = generate_connect_code();
        assert_eq!(code.len(), CONNECT_CODE_LENGTH);
        assert!(code.bytes().all(|b| CONNECT_CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn connect_code_avoids_ambiguous_symbols() {
        for _ in 0..256 {
            let code = generate_connect_code();
            assert!(
                !code.contains(['I', 'L', 'O', '0', '1']),
                "ambiguous symbol in {code}"
            );
        }
    }

    #[test]
    fn alphabet_is_the_31_symbol_set() {
        assert_eq!(CONNECT_CODE_ALPHABET.len(), 31);
        let mut symbols = CONNECT_CODE_ALPHABET.to_vec();
        symbols.sort_unstable();
        symbols.dedup();
        assert_eq!(symbols.len(), 31);
    }
}
