//! Credential validation for multi-tenant sessions.
//!
//! Secrets are looked up in a [`CredentialSource`], retried on transient
//! failures, cached per username, and compared according to the configured
//! [`SecretPolicy`]. Every rejection looks the same to the client, whether
//! the user is unknown or the password is wrong.

pub mod secret;
pub mod source;

use crate::config::SecretPolicy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub use source::{CredentialSource, LookupError, PostgresCredentialSource, StorageCredentialSource};

/// Lookup attempts before giving up on a source
const LOOKUP_ATTEMPTS: u32 = 10;

/// Pause between lookup attempts
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Password the dummy Argon2 hash is built from
const DUMMY_PASSWORD: &str = "multikv-dummy-password";
const DUMMY_SALT: &[u8] = b"multikv-dummy-salt";

#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown user or wrong password
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The source kept failing
    #[error("credential lookup failed: {0}")]
    Lookup(#[source] LookupError),

    #[error("password verification task failed: {0}")]
    Verifier(#[from] tokio::task::JoinError),

    #[error("argon2 setup failed: {0}")]
    Hashing(String),
}

struct CachedSecret {
    secret: String,
    fetched: Instant,
}

/// Validates `username:password` pairs.
///
/// Lives for the whole process and is shared by every connection.
pub struct CredentialService {
    source: Arc<dyn CredentialSource>,
    policy: SecretPolicy,
    cache: RwLock<HashMap<String, CachedSecret>>,
    /// `None` keeps cached secrets for the process lifetime
    cache_ttl: Option<Duration>,
    /// Verified against when the user does not exist (Argon2 only)
    dummy_hash: Option<String>,
}

impl CredentialService {
    pub fn new(
        source: Arc<dyn CredentialSource>,
        policy: SecretPolicy,
        cache_ttl: Duration,
    ) -> Result<Self, AuthError> {
        let dummy_hash = match policy {
            SecretPolicy::Plain => None,
            SecretPolicy::Argon2 => Some(
                secret::hash_with_salt(DUMMY_PASSWORD, DUMMY_SALT)
                    .map_err(|e| AuthError::Hashing(e.to_string()))?,
            ),
        };

        Ok(Self {
            source,
            policy,
            cache: RwLock::new(HashMap::new()),
            cache_ttl: (!cache_ttl.is_zero()).then_some(cache_ttl),
            dummy_hash,
        })
    }

    /// Check `password` for `username`.
    pub async fn validate(&self, username: &str, password: &str) -> Result<(), AuthError> {
        if username.is_empty() {
            self.burn(password).await?;
            return Err(AuthError::InvalidCredentials);
        }

        let secret = match self.secret(username).await {
            Ok(secret) => secret,
            Err(LookupError::NotFound) => {
                self.burn(password).await?;
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => return Err(AuthError::Lookup(e)),
        };

        if self.verify(secret, password).await? {
            debug!(user = username, "Credentials accepted");
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }

    /// Cached secret, falling back to the source with retries
    async fn secret(&self, username: &str) -> Result<String, LookupError> {
        if let Some(secret) = self.cached(username) {
            return Ok(secret);
        }

        let mut attempt = 1;
        loop {
            match self.source.secret(username).await {
                Ok(secret) => {
                    self.cache.write().insert(
                        username.to_string(),
                        CachedSecret {
                            secret: secret.clone(),
                            fetched: Instant::now(),
                        },
                    );
                    return Ok(secret);
                }
                Err(LookupError::NotFound) => return Err(LookupError::NotFound),
                Err(e) if attempt >= LOOKUP_ATTEMPTS => return Err(e),
                Err(e) => {
                    warn!(user = username, attempt, error = %e, "Credential lookup failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    fn cached(&self, username: &str) -> Option<String> {
        let cache = self.cache.read();
        let entry = cache.get(username)?;
        match self.cache_ttl {
            Some(ttl) if entry.fetched.elapsed() >= ttl => None,
            _ => Some(entry.secret.clone()),
        }
    }

    async fn verify(&self, secret: String, password: &str) -> Result<bool, AuthError> {
        match self.policy {
            SecretPolicy::Plain => Ok(secret::constant_time_eq(secret.as_bytes(), password.as_bytes())),
            SecretPolicy::Argon2 => {
                let password = password.to_string();
                Ok(tokio::task::spawn_blocking(move || secret::verify_argon2(&password, &secret)).await?)
            }
        }
    }

    /// Spend the cost of one verification on a path that must fail anyway
    async fn burn(&self, password: &str) -> Result<(), AuthError> {
        if let Some(dummy) = &self.dummy_hash {
            self.verify(dummy.clone(), password).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Source that fails `failures` times before answering
    struct FlakySource {
        secrets: HashMap<String, String>,
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakySource {
        fn new(failures: u32) -> Self {
            let mut secrets = HashMap::new();
            secrets.insert("bob".to_string(), "rightpass".to_string());
            Self {
                secrets,
                failures,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialSource for FlakySource {
        async fn secret(&self, username: &str) -> Result<String, LookupError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(LookupError::Encoding(username.to_string()));
            }
            self.secrets.get(username).cloned().ok_or(LookupError::NotFound)
        }
    }

    fn service(source: Arc<FlakySource>, policy: SecretPolicy, ttl: Duration) -> CredentialService {
        CredentialService::new(source, policy, ttl).unwrap()
    }

    #[tokio::test]
    async fn test_plain_validation() {
        let source = Arc::new(FlakySource::new(0));
        let auth = service(source.clone(), SecretPolicy::Plain, Duration::ZERO);

        assert!(auth.validate("bob", "rightpass").await.is_ok());
        assert!(matches!(
            auth.validate("bob", "wrongpass").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.validate("eve", "rightpass").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.validate("", "rightpass").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_cache_skips_source() {
        let source = Arc::new(FlakySource::new(0));
        let auth = service(source.clone(), SecretPolicy::Plain, Duration::ZERO);

        auth.validate("bob", "rightpass").await.unwrap();
        auth.validate("bob", "rightpass").await.unwrap();
        let _ = auth.validate("bob", "wrongpass").await;
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_ttl_refetches() {
        let source = Arc::new(FlakySource::new(0));
        let auth = service(source.clone(), SecretPolicy::Plain, Duration::from_millis(20));

        auth.validate("bob", "rightpass").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        auth.validate("bob", "rightpass").await.unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let source = Arc::new(FlakySource::new(0));
        let auth = service(source.clone(), SecretPolicy::Plain, Duration::ZERO);

        let _ = auth.validate("eve", "x").await;
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let source = Arc::new(FlakySource::new(3));
        let auth = service(source.clone(), SecretPolicy::Plain, Duration::ZERO);

        assert!(auth.validate("bob", "rightpass").await.is_ok());
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let source = Arc::new(FlakySource::new(u32::MAX));
        let auth = service(source.clone(), SecretPolicy::Plain, Duration::ZERO);

        assert!(matches!(
            auth.validate("bob", "rightpass").await,
            Err(AuthError::Lookup(_))
        ));
        assert_eq!(source.calls(), LOOKUP_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_argon2_validation() {
        let mut source = FlakySource::new(0);
        source.secrets.insert(
            "bob".to_string(),
            secret::hash_with_salt("rightpass", b"per-user-salt").unwrap(),
        );
        let auth = service(Arc::new(source), SecretPolicy::Argon2, Duration::ZERO);

        assert!(auth.validate("bob", "rightpass").await.is_ok());
        assert!(matches!(
            auth.validate("bob", "wrongpass").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.validate("eve", DUMMY_PASSWORD).await,
            Err(AuthError::InvalidCredentials)
        ));
    }
}
