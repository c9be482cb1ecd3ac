use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::AuthError;
use crate::store::{ChatStore, UserRecord};

/// Authentication collaborator: resolves a bearer token to a user record.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, token: &str) -> Result<UserRecord, AuthError>;
}

struct Session {
    user_id: i64,
    expires_at: Option<Instant>,
}

/// Opaque-token session table backed by the store. Token issuance belongs
/// to the login flow outside the core; `issue` stands in for it.
pub struct TokenTable {
    store: Arc<dyn ChatStore>,
    sessions: RwLock<HashMap<String, Session>>,
}

impl TokenTable {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        TokenTable {
            store,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn issue(&self, user_id: i64) -> String {
        self.insert(user_id, None).await
    }

    pub async fn issue_expiring(&self, user_id: i64, expires_at: Instant) -> String {
        self.insert(user_id, Some(expires_at)).await
    }

    async fn insert(&self, user_id: i64, expires_at: Option<Instant>) -> String {
        let token = Uuid::new_v4().to_string();
        let mut sessions = self.sessions.write().await;
        sessions.insert(token.clone(), Session { user_id, expires_at });
        token
    }
}

fn strip_bearer(token: &str) -> &str {
    let token = token.trim();
    // get() refuses a non-boundary index, so multi-byte tokens pass through
    match token.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => &token[7..],
        _ => token,
    }
}

#[async_trait]
impl Authenticator for TokenTable {
    async fn verify(&self, token: &str) -> Result<UserRecord, AuthError> {
        let token = strip_bearer(token);
        if token.is_empty() {
            return Err(AuthError::Invalid);
        }

        let user_id = {
            let sessions = self.sessions.read().await;
            let session = sessions.get(token).ok_or(AuthError::Invalid)?;
            if let Some(deadline) = session.expires_at {
                if Instant::now() >= deadline {
                    return Err(AuthError::Expired);
                }
            }
            session.user_id
        };

        match self.store.user(user_id).await {
            Ok(Some(user)) => Ok(user),
            Ok(None) => Err(AuthError::NotFound),
            Err(_) => Err(AuthError::Invalid),
        }
    }
}

fn digest_hex(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Salted credential hash, stored as `"{salt}${digest}"`.
pub fn hash_password(password: &str) -> String {
    let mut salt_bytes = [0u8; 16];
    OsRng.fill_bytes(&mut salt_bytes);
    let salt: String = salt_bytes.iter().map(|b| format!("{b:02x}")).collect();
    let digest = digest_hex(&salt, password);
    format!("{salt}${digest}")
}

/// Compare a plaintext credential against a stored hash.
pub fn verify_password(password: &str, stored: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, digest)) => digest_hex(salt, password) == digest,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    async fn table_with_alice() -> TokenTable {
        let store = MemoryStore::new();
        store
            .add_user(UserRecord {
                id: 1,
                username: "alice".into(),
                first_name: "Alice".into(),
                last_name: "Anders".into(),
            })
            .await;
        TokenTable::new(Arc::new(store))
    }

    #[tokio::test]
    async fn verify_resolves_issued_token() {
        let table = table_with_alice().await;
        let token = table.issue(1).await;
        let user = table.verify(&token).await.unwrap();
        assert_eq!(user.username, "alice");
    }

    #[tokio::test]
    async fn bearer_prefix_is_accepted() {
        let table = table_with_alice().await;
        let token = table.issue(1).await;
        assert!(table.verify(&format!("Bearer {token}")).await.is_ok());
        assert!(table.verify(&format!("bearer {token}")).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let table = table_with_alice().await;
        assert_eq!(table.verify("nope").await.unwrap_err(), AuthError::Invalid);
        assert_eq!(table.verify("").await.unwrap_err(), AuthError::Invalid);
    }

    #[tokio::test]
    async fn multibyte_token_is_rejected_not_mangled() {
        let table = table_with_alice().await;
        // byte 7 falls inside a multi-byte character in each of these
        for token in ["ñññññ", "béarer xyz", "日本語トークン"] {
            assert_eq!(table.verify(token).await.unwrap_err(), AuthError::Invalid);
        }
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let table = table_with_alice().await;
        let token = table
            .issue_expiring(1, Instant::now() - Duration::from_secs(1))
            .await;
        assert_eq!(table.verify(&token).await.unwrap_err(), AuthError::Expired);
    }

    #[tokio::test]
    async fn token_for_missing_user_is_not_found() {
        let table = table_with_alice().await;
        let token = table.issue(42).await;
        assert_eq!(table.verify(&token).await.unwrap_err(), AuthError::NotFound);
    }

    #[test]
    fn password_hash_round_trip() {
        let stored = hash_password("swordfish");
        assert!(verify_password("swordfish", &stored));
        assert!(!verify_password("wrong", &stored));
        assert!(!verify_password("swordfish", "garbage-without-separator"));
    }

    #[test]
    fn hashes_are_salted() {
        assert_ne!(hash_password("swordfish"), hash_password("swordfish"));
    }
}
