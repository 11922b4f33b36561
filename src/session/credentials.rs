use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand_core::OsRng;
use tokio::sync::RwLock;

use crate::{Error, Result};

const MAX_TOTAL_USERS: usize = 10_000;

/// Durable credential record for one user.
#[derive(Clone, Debug)]
pub struct UserRecord {
    /// Stable user id (UUID).
    pub id: String,
    /// Sign-in identifier, unique across users.
    pub identifier: String,
    /// Name shown to other users.
    pub display_name: String,
    /// Contact address.
    pub email: String,
    /// Role carried into issued bearer credentials.
    pub role: String,
    /// Argon2 PHC string of the user's secret.
    pub password_hash: String,
}

/// Durable user store consulted at sign-in.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// Finds the record for `identifier`.
    async fn find(&self, identifier: &str) -> Result<Option<UserRecord>>;

    /// Adds a new record.
    ///
    /// # Errors
    /// [`Error::AlreadyExists`] if the identifier is taken.
    async fn insert(&self, record: UserRecord) -> Result<()>;

    /// Number of stored users.
    async fn count(&self) -> Result<usize>;
}

/// In-process [`CredentialStore`].
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    users: Arc<RwLock<HashMap<String, UserRecord>>>,
}

impl MemoryCredentialStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find(&self, identifier: &str) -> Result<Option<UserRecord>> {
        Ok(self.users.read().await.get(identifier).cloned())
    }

    async fn insert(&self, record: UserRecord) -> Result<()> {
        let mut users = self.users.write().await;

        if users.len() >= MAX_TOTAL_USERS {
            return Err(Error::Store(format!(
                "credential store has reached maximum user capacity ({MAX_TOTAL_USERS})"
            )));
        }

        if users.contains_key(&record.identifier) {
            return Err(Error::AlreadyExists(format!(
                "user '{}' already registered",
                record.identifier
            )));
        }

        users.insert(record.identifier.clone(), record);
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.users.read().await.len())
    }
}

/// Hashes `secret` with Argon2id and a random salt.
///
/// # Errors
/// Returns [`Error::Internal`] if hashing fails.
pub fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal(format!("password hashing failed: {e}")))
}

/// Checks `secret` against a stored PHC string. Malformed hashes never match.
pub fn verify_secret(secret: &str, password_hash: &str) -> bool {
    PasswordHash::new(password_hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(secret.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Burns the same work as a real comparison when the identifier is unknown, so
/// response timing does not reveal which identifiers exist.
pub(crate) fn verify_against_dummy(secret: &str) {
    static DUMMY_HASH: OnceLock<Option<String>> = OnceLock::new();

    if let Some(hash) = DUMMY_HASH.get_or_init(|| hash_secret("callguard-timing-equalizer").ok()) {
        let _ = verify_secret(secret, hash);
    }
}
