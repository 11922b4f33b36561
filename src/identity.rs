//! Signed bearer credentials.
//!
//! [`TokenVerifier`] is the identity verifier consulted by the auth interceptor: a
//! pure function of the token and the server-held secret. [`TokenIssuer`] mints the
//! same credentials after a successful sign-in.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::context::Caller;
use crate::{Error, Result};

/// Claims carried by a bearer credential.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject the credential was issued to.
    #[serde(rename = "sub")]
    pub subject_id: String,
    /// Caller role.
    pub role: String,
    /// Unix timestamp (seconds) after which the credential is rejected.
    #[serde(rename = "exp")]
    pub expires_at: u64,
}

impl From<Claims> for Caller {
    fn from(claims: Claims) -> Self {
        Caller {
            subject_id: claims.subject_id,
            role: claims.role,
        }
    }
}

/// Verifies HS256 bearer credentials. Fails closed on any parse, signature, or
/// expiry error.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Creates a verifier for credentials signed with `secret`.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Verifies `token` and returns its claims.
    ///
    /// # Errors
    /// Returns [`Error::Authentication`] for any malformed, forged, or expired token.
    /// The error never describes which check failed.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "bearer credential rejected");
                Error::Authentication("invalid or expired credential".to_string())
            })
    }
}

/// A freshly minted bearer credential.
#[derive(Clone, Debug)]
pub struct IssuedToken {
    /// Encoded JWT.
    pub token: String,
    /// Unix timestamp (seconds) at which the token expires.
    pub expires_at: u64,
}

/// Mints HS256 bearer credentials.
#[derive(Clone)]
pub struct TokenIssuer {
    key: EncodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    /// Creates an issuer signing with `secret`; tokens live for `ttl`.
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
            ttl,
        }
    }

    /// Issues a credential for `subject_id` holding `role`.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if encoding fails.
    pub fn issue(&self, subject_id: &str, role: &str) -> Result<IssuedToken> {
        let expires_at = unix_now().saturating_add(self.ttl.as_secs());
        let claims = Claims {
            subject_id: subject_id.to_string(),
            role: role.to_string(),
            expires_at,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| Error::Internal(format!("failed to sign credential: {e}")))?;

        Ok(IssuedToken { token, expires_at })
    }
}

/// Extracts the token from an `authorization` value.
///
/// Accepts both the raw token and the `Bearer <token>` form. Returns `None` for
/// blank values.
pub fn bearer_token(value: &str) -> Option<&str> {
    let value = value.trim();
    let token = match value.get(..6) {
        Some(scheme)
            if scheme.eq_ignore_ascii_case("bearer")
                && (value.len() == 6 || value[6..].starts_with(' ')) =>
        {
            value[6..].trim_start()
        }
        _ => value,
    };

    (!token.is_empty()).then_some(token)
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| unreachable!("System time is after UNIX_EPOCH"))
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"an-unguessable-32-byte-test-secret!!";

    #[test]
    fn issued_token_verifies_with_same_secret() {
        let issuer = TokenIssuer::new(SECRET, Duration::from_secs(60));
        let verifier = TokenVerifier::new(SECRET);

        let issued = issuer.issue("user-1", "member").unwrap();
        let claims = verifier.verify(&issued.token).unwrap();

        assert_eq!(claims.subject_id, "user-1");
        assert_eq!(claims.role, "member");
        assert_eq!(claims.expires_at, issued.expires_at);
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let issuer = TokenIssuer::new(
            b"some-other-secret-of-sufficient-length",
            Duration::from_secs(60),
        );
        let verifier = TokenVerifier::new(SECRET);

        let issued = issuer.issue("user-1", "member").unwrap();
        assert!(matches!(
            verifier.verify(&issued.token),
            Err(Error::Authentication(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let claims = Claims {
            subject_id: "user-1".to_string(),
            role: "member".to_string(),
            expires_at: unix_now() - 10,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        assert!(TokenVerifier::new(SECRET).verify(&token).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let verifier = TokenVerifier::new(SECRET);
        assert!(verifier.verify("").is_err());
        assert!(verifier.verify("not-a-jwt").is_err());
        assert!(verifier.verify("a.b.c").is_err());
    }

    #[test]
    fn bearer_token_accepts_raw_and_prefixed_forms() {
        assert_eq!(bearer_token("abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(bearer_token("Bearer abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(bearer_token("bearer  abc"), Some("abc"));
        assert_eq!(bearer_token("  "), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
