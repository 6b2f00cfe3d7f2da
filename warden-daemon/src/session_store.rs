//! Session tokens owned by the authority.
//!
//! Each session is identified by a CSPRNG bearer token handed to the
//! client as hex. The store indexes sessions by the SHA-256 digest of the
//! token, so lookups never compare raw token bytes with an early exit;
//! the stored token is then confirmed with constant-time equality.
//!
//! A session is valid iff it is not revoked and `now < expires_at`.
//! Revocations are published on a broadcast channel as token digests so
//! dependent services can drop cached decisions.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::errors::{AuthError, DaemonError, Result};
use crate::users::UserId;

/// Capacity of the revocation broadcast. Slow listeners that lag behind
/// it must resynchronise by clearing their caches.
const REVOCATION_CHANNEL_CAPACITY: usize = 1024;

/// 256-bit session token.
///
/// - Generated via OS CSPRNG (`getrandom` crate)
/// - Compared with constant-time equality to prevent timing attacks
/// - Serialized as lowercase hex on the wire
#[derive(Clone, Copy)]
pub struct SessionToken([u8; 32]);

impl SessionToken {
    /// Generate a new cryptographically random token.
    pub fn generate() -> std::result::Result<Self, getrandom::Error> {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes)?;
        Ok(SessionToken(bytes))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        SessionToken(bytes)
    }

    /// Encode the token as a lowercase hex string (64 chars).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode a hex string into a token. Returns `None` on invalid input.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(SessionToken(arr))
    }

    /// Hex SHA-256 of the token's hex form. Safe to log and to use as a key.
    pub fn digest(&self) -> String {
        token_digest(&self.to_hex())
    }
}

/// Hex SHA-256 of a token as presented on the wire.
///
/// Hex case is normalised first, so every spelling of one token maps to
/// one digest.
pub fn token_digest(token: &str) -> String {
    let normalized = token.trim().to_ascii_lowercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

impl PartialEq for SessionToken {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SessionToken {}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log the actual token value
        f.write_str("SessionToken(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl Session {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }
}

/// Owned session table. The single writer of session state.
pub struct SessionStore {
    entries: RwLock<HashMap<String, (SessionToken, Session)>>,
    ttl: chrono::Duration,
    revocations: broadcast::Sender<String>,
}

impl SessionStore {
    pub fn new(ttl: std::time::Duration) -> Self {
        let (revocations, _) = broadcast::channel(REVOCATION_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            revocations,
        }
    }

    /// Issue a new session for a user.
    pub fn issue(&self, user_id: UserId) -> Result<(SessionToken, Session)> {
        self.issue_at(user_id, Utc::now())
    }

    pub fn issue_at(&self, user_id: UserId, now: DateTime<Utc>) -> Result<(SessionToken, Session)> {
        let token = SessionToken::generate().map_err(DaemonError::Entropy)?;
        let session = Session {
            user_id,
            issued_at: now,
            expires_at: now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            revoked: false,
        };
        self.entries
            .write()
            .insert(token.digest(), (token, session.clone()));
        info!("Issued session for user {} (expires {})", user_id, session.expires_at);
        Ok((token, session))
    }

    /// Look a token up without checking validity.
    pub fn lookup(&self, token: &str) -> Option<Session> {
        let presented = SessionToken::from_hex(token)?;
        let entries = self.entries.read();
        let (stored, session) = entries.get(&presented.digest())?;
        (*stored == presented).then(|| session.clone())
    }

    pub fn validate(&self, token: &str) -> std::result::Result<Session, AuthError> {
        self.validate_at(token, Utc::now())
    }

    /// Resolve a token into its session if the session is valid at `now`.
    pub fn validate_at(&self, token: &str, now: DateTime<Utc>) -> std::result::Result<Session, AuthError> {
        match self.lookup(token) {
            Some(session) if session.is_valid_at(now) => Ok(session),
            _ => Err(AuthError::Unauthorized),
        }
    }

    /// Revoke a session. Returns `false` if the token is unknown or was
    /// already revoked.
    pub fn revoke(&self, token: &str) -> bool {
        let Some(presented) = SessionToken::from_hex(token) else {
            return false;
        };
        let digest = presented.digest();
        let revoked = {
            let mut entries = self.entries.write();
            match entries.get_mut(&digest) {
                Some((stored, session)) if *stored == presented && !session.revoked => {
                    session.revoked = true;
                    true
                }
                _ => false,
            }
        };
        if revoked {
            debug!("Revoked session {}", &digest[..12]);
            let _ = self.revocations.send(digest);
        }
        revoked
    }

    /// Revoke every session of a user. Returns how many were revoked.
    pub fn revoke_user(&self, user_id: UserId) -> usize {
        let digests: Vec<String> = {
            let mut entries = self.entries.write();
            entries
                .iter_mut()
                .filter(|(_, (_, session))| session.user_id == user_id && !session.revoked)
                .map(|(digest, (_, session))| {
                    session.revoked = true;
                    digest.clone()
                })
                .collect()
        };
        for digest in &digests {
            let _ = self.revocations.send(digest.clone());
        }
        if !digests.is_empty() {
            info!("Revoked {} session(s) for user {}", digests.len(), user_id);
        }
        digests.len()
    }

    /// Drop sessions that can never validate again. Returns how many were
    /// removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, (_, session)| session.is_valid_at(now));
        before - entries.len()
    }

    /// Digests of revoked tokens, in revocation order.
    pub fn subscribe_revocations(&self) -> broadcast::Receiver<String> {
        self.revocations.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
