//! Credentials and login sessions.
//!
//! Passwords are stored as a random salt plus a BLAKE3 derived key. Sessions
//! live in memory only; restarting the backend logs everybody out.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};

pub const SESSION_COOKIE: &str = "mlwio.sid";
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 7);
/// Upper bound on a session lifetime, about ten years.
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 3650);
const PASSWORD_CONTEXT: &str = "mlwio-catalog 2024-05 user password";
const SALT_LEN: usize = 16;
const TOKEN_LEN: usize = 32;

/// Salted password digest as persisted in the `users` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordDigest {
    pub salt: String,
    pub hash: String,
}

impl PasswordDigest {
    pub fn generate(password: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let hash = derive(&salt, password);
        Self {
            salt: STANDARD.encode(salt),
            hash: STANDARD.encode(hash.as_bytes()),
        }
    }

    /// Errors only when the stored values are not valid base64.
    pub fn verify(&self, password: &str) -> Result<bool> {
        let salt = STANDARD
            .decode(&self.salt)
            .context("decoding stored password salt")?;
        let stored: [u8; blake3::OUT_LEN] = STANDARD
            .decode(&self.hash)
            .context("decoding stored password hash")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("stored password hash has the wrong length"))?;
        // `blake3::Hash` equality is constant time.
        Ok(derive(&salt, password) == blake3::Hash::from(stored))
    }
}

fn derive(salt: &[u8], password: &str) -> blake3::Hash {
    let mut material = Vec::with_capacity(salt.len() + password.len());
    material.extend_from_slice(salt);
    material.extend_from_slice(password.as_bytes());
    blake3::Hash::from(blake3::derive_key(PASSWORD_CONTEXT, &material))
}

struct SessionEntry {
    user_id: String,
    expires_at: Instant,
}

/// Token to user mapping with a fixed lifetime per session.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    ttl: Duration,
}

impl SessionStore {
    /// `ttl` is capped at [`MAX_SESSION_TTL`].
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl: ttl.min(MAX_SESSION_TTL),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Starts a session and returns its token.
    pub fn create(&self, user_id: &str) -> String {
        let mut bytes = [0u8; TOKEN_LEN];
        OsRng.fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);
        self.sessions.lock().insert(
            token.clone(),
            SessionEntry {
                user_id: user_id.to_owned(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        token
    }

    /// Looks up the user behind a token; expired entries are dropped on sight.
    pub fn user_id(&self, token: &str) -> Option<String> {
        let mut sessions = self.sessions.lock();
        match sessions.get(token) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.user_id.clone()),
            Some(_) => {
                sessions.remove(token);
                None
            }
            None => None,
        }
    }

    pub fn destroy(&self, token: &str) -> bool {
        self.sessions.lock().remove(token).is_some()
    }

    /// Removes expired sessions, returning how many were dropped.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, entry| entry.expires_at > now);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_verifies_only_the_right_password() {
        let digest = PasswordDigest::generate("hunter2");
        assert!(digest.verify("hunter2").unwrap());
        assert!(!digest.verify("hunter3").unwrap());
        assert!(!digest.verify("").unwrap());
    }

    #[test]
    fn digests_are_salted() {
        let first = PasswordDigest::generate("same");
        let second = PasswordDigest::generate("same");
        assert_ne!(first.salt, second.salt);
        assert_ne!(first.hash, second.hash);
    }

    #[test]
    fn corrupt_digest_is_an_error() {
        let digest = PasswordDigest {
            salt: "!!!".to_owned(),
            hash: "AAAA".to_owned(),
        };
        assert!(digest.verify("x").is_err());
    }

    #[test]
    fn sessions_resolve_until_destroyed() {
        let store = SessionStore::new(DEFAULT_SESSION_TTL);
        let token = store.create("user-1");
        assert_eq!(store.user_id(&token).as_deref(), Some("user-1"));
        assert!(store.destroy(&token));
        assert_eq!(store.user_id(&token), None);
        assert!(!store.destroy(&token));
    }

    #[test]
    fn tokens_are_unique() {
        let store = SessionStore::new(DEFAULT_SESSION_TTL);
        let a = store.create("u");
        let b = store.create("u");
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn huge_ttl_is_capped() {
        let store = SessionStore::new(Duration::from_secs(u64::MAX));
        assert_eq!(store.ttl(), MAX_SESSION_TTL);
        let token = store.create("user-1");
        assert_eq!(store.user_id(&token).as_deref(), Some("user-1"));
    }

    #[test]
    fn expired_sessions_are_rejected_and_pruned() {
        let store = SessionStore::new(Duration::ZERO);
        let token = store.create("user-1");
        store.create("user-2");
        assert_eq!(store.user_id(&token), None);
        assert_eq!(store.prune(), 1);
        assert!(store.is_empty());
    }
}
