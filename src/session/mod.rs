//! Human sign-in and store-backed sessions.
//!
//! The [`SessionManager`] checks identifiers and secrets against a
//! [`CredentialStore`] and records live sessions in a [`SessionStore`]. The store
//! alone decides whether a session is alive: there is no separate revocation
//! list, and session ids are 256-bit random values that are never reissued.

/// Durable user records and password hashing.
pub mod credentials;

/// Session key/value store.
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

pub use credentials::{
    hash_secret, verify_secret, CredentialStore, MemoryCredentialStore, UserRecord,
};
pub use store::{MemorySessionStore, SessionStore};

use crate::identity::unix_now;
use crate::{Error, Result};

/// Session lifetime in the reference policy.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const SESSION_ID_BYTES: usize = 32;
const MAX_ID_ATTEMPTS: usize = 3;

/// Identity payload stored with a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// User id.
    pub id: String,
    /// Display name at the time the session was issued.
    pub display_name: String,
    /// Email at the time the session was issued.
    pub email: String,
}

impl From<&UserRecord> for Identity {
    fn from(record: &UserRecord) -> Self {
        Self {
            id: record.id.clone(),
            display_name: record.display_name.clone(),
            email: record.email.clone(),
        }
    }
}

/// A live session as stored in the [`SessionStore`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque, unique session id.
    pub session_id: String,
    /// Who the session belongs to.
    pub identity: Identity,
    /// Unix timestamp (seconds) of issuance.
    pub issued_at: u64,
    /// Lifetime in seconds.
    pub ttl_secs: u64,
}

impl Session {
    /// Unix timestamp (seconds) at which the store drops the session.
    pub fn expires_at(&self) -> u64 {
        self.issued_at.saturating_add(self.ttl_secs)
    }
}

/// Result of a successful [`SessionManager::sign_in`].
#[derive(Clone, Debug)]
pub struct SignedIn {
    /// The newly issued session.
    pub session: Session,
    /// Role stored for the user, used to mint bearer credentials.
    pub role: String,
}

/// New account details accepted by [`SessionManager::register`].
#[derive(Clone, Debug)]
pub struct NewAccount {
    /// Sign-in identifier.
    pub identifier: String,
    /// Plaintext secret; hashed before storage.
    pub secret: String,
    /// Display name.
    pub display_name: String,
    /// Contact email.
    pub email: String,
    /// Role granted to the account.
    pub role: String,
}

/// Issues, resolves, and revokes sessions.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<dyn SessionStore>,
    credentials: Arc<dyn CredentialStore>,
    ttl: Duration,
}

impl SessionManager {
    /// Creates a manager writing sessions with the given `ttl`.
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        credentials: Arc<dyn CredentialStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            sessions,
            credentials,
            ttl,
        }
    }

    /// Creates a credential record for a new account.
    ///
    /// # Errors
    /// [`Error::AlreadyExists`] if the identifier is taken, [`Error::Internal`] if
    /// hashing fails.
    pub async fn register(&self, account: NewAccount) -> Result<UserRecord> {
        let NewAccount {
            identifier,
            secret,
            display_name,
            email,
            role,
        } = account;

        let password_hash = blocking(move || hash_secret(&secret)).await??;

        let record = UserRecord {
            id: uuid::Uuid::new_v4().to_string(),
            identifier,
            display_name,
            email,
            role,
            password_hash,
        };

        self.credentials.insert(record.clone()).await?;
        tracing::info!(user_id = %record.id, identifier = %record.identifier, "account registered");

        Ok(record)
    }

    /// Checks `secret` for `identifier` without touching the session store.
    ///
    /// Unknown identifiers and wrong secrets are indistinguishable to the caller.
    ///
    /// # Errors
    /// [`Error::Authentication`] on mismatch or unknown identifier.
    pub async fn authenticate(&self, identifier: &str, secret: &str) -> Result<UserRecord> {
        let record = self.credentials.find(identifier).await?;
        let secret = secret.to_string();

        let record = match record {
            Some(record) => {
                let hash = record.password_hash.clone();
                let matches = blocking(move || verify_secret(&secret, &hash)).await?;
                matches.then_some(record)
            }
            None => {
                blocking(move || credentials::verify_against_dummy(&secret)).await?;
                None
            }
        };

        record.ok_or_else(|| {
            tracing::info!(%identifier, "sign-in rejected");
            Error::Authentication("invalid identifier or secret".to_string())
        })
    }

    /// Checks `secret` for `identifier` and, on success, issues a new session.
    ///
    /// A rejected sign-in never writes to the session store.
    ///
    /// # Errors
    /// [`Error::Authentication`] on mismatch or unknown identifier.
    pub async fn sign_in(&self, identifier: &str, secret: &str) -> Result<SignedIn> {
        let record = self.authenticate(identifier, secret).await?;
        let session = self.issue_session(Identity::from(&record)).await?;

        Ok(SignedIn {
            session,
            role: record.role,
        })
    }

    /// Issues a session for an already-established identity.
    ///
    /// # Errors
    /// [`Error::Store`] if the store fails, [`Error::Internal`] if no unused id
    /// could be drawn.
    pub async fn issue_session(&self, identity: Identity) -> Result<Session> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let session = Session {
                session_id: new_session_id(),
                identity: identity.clone(),
                issued_at: unix_now(),
                ttl_secs: self.ttl.as_secs(),
            };

            let value = serde_json::to_string(&session)
                .map_err(|e| Error::Internal(format!("failed to serialize session: {e}")))?;

            match self.sessions.insert(&session.session_id, value, self.ttl).await {
                Ok(()) => {
                    tracing::info!(
                        user_id = %session.identity.id,
                        ttl_secs = session.ttl_secs,
                        "session issued"
                    );
                    return Ok(session);
                }
                Err(Error::AlreadyExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(Error::Internal("could not allocate a unique session id".to_string()))
    }

    /// Resolves a live session.
    ///
    /// # Errors
    /// [`Error::NotFound`] if the id is unknown, revoked, or expired.
    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        let value = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| Error::NotFound("session not found or expired".to_string()))?;

        serde_json::from_str(&value)
            .map_err(|e| Error::Internal(format!("corrupt session record: {e}")))
    }

    /// Revokes a session. Revoking an unknown id succeeds.
    pub async fn sign_out(&self, session_id: &str) -> Result<()> {
        self.sessions.remove(session_id).await?;
        tracing::info!("session revoked");
        Ok(())
    }

    /// Number of registered users.
    pub async fn user_count(&self) -> Result<usize> {
        self.credentials.count().await
    }

    /// Configured session lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {e}")))
}
