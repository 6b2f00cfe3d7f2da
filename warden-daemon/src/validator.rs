//! Delegated session validation for dependent services.
//!
//! A dependent service owns no sessions. It asks the authority, and keeps
//! the answer for a short TTL so a busy stream of requests doesn't turn
//! into a busy stream of upstream calls. Properties:
//!
//! - Decisions (valid or invalid) are cached under the token's SHA-256
//!   digest. A positive decision never outlives the session itself.
//! - Concurrent validations of one uncached token share a single upstream
//!   call.
//! - Transport failures and timeouts are retried a bounded number of times
//!   with exponential backoff, then reported as `ServiceUnavailable`. They
//!   are never cached and never treated as an allow.
//! - Revocations published by the authority evict cached decisions. A
//!   revocation that lands while a validation is in flight keeps that
//!   flight's answer out of the cache.
//! - Expired decisions are swept periodically, so junk tokens cannot grow
//!   the cache without bound.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use warden_protocol::client::Client;
use warden_protocol::protocol::{Response, ResponseData, ServerEvent};

use crate::config::ValidatorConfig;
use crate::errors::AuthError;
use crate::gate::Identity;
use crate::session_store::token_digest;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Could not reach the authority or the connection dropped; retryable
    #[error("authority unreachable: {0}")]
    Transport(String),

    /// The authority answered with something other than a decision
    #[error("unexpected answer from authority: {0}")]
    Protocol(String),
}

/// The authority as seen from a dependent service.
#[async_trait]
pub trait AuthorityUpstream: Send + Sync + 'static {
    /// `Ok(None)` means the authority says the token is not valid.
    async fn validate(&self, token: &str) -> Result<Option<Identity>, UpstreamError>;

    /// Open the revocation feed: a stream of token digests.
    async fn watch_revocations(&self) -> Result<mpsc::UnboundedReceiver<String>, UpstreamError>;
}

/// Talks to an authority daemon over its Unix socket.
///
/// Keeps one connection and reopens it after a failure.
pub struct SocketAuthority {
    socket_path: PathBuf,
    client: Mutex<Option<Arc<Client>>>,
}

impl SocketAuthority {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<Arc<Client>, UpstreamError> {
        if let Some(client) = self.client.lock().clone() {
            return Ok(client);
        }
        let client = Client::connect(&self.socket_path)
            .await
            .map(Arc::new)
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        *self.client.lock() = Some(Arc::clone(&client));
        Ok(client)
    }

    fn reset(&self, stale: &Arc<Client>) {
        let mut slot = self.client.lock();
        if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, stale)) {
            *slot = None;
        }
    }
}

#[async_trait]
impl AuthorityUpstream for SocketAuthority {
    async fn validate(&self, token: &str) -> Result<Option<Identity>, UpstreamError> {
        let client = self.client().await?;
        let response = match client.validate_session(token).await {
            Ok(response) => response,
            Err(e) => {
                self.reset(&client);
                return Err(UpstreamError::Transport(e.to_string()));
            }
        };
        match response {
            Response::Ok {
                data: Some(ResponseData::SessionValidation(validation)),
                ..
            } => Identity::from_validation(&validation).map_err(UpstreamError::Protocol),
            Response::Ok { .. } => Err(UpstreamError::Protocol("response carried no validation".into())),
            Response::Error { kind, message } => {
                Err(UpstreamError::Protocol(format!("{}: {}", kind, message)))
            }
        }
    }

    async fn watch_revocations(&self) -> Result<mpsc::UnboundedReceiver<String>, UpstreamError> {
        // Dedicated connection so the feed's lifetime is independent of
        // request traffic.
        let client = Client::connect(&self.socket_path)
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let mut events = client
            .watch_revocations()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let _client = client;
            while let Some(event) = events.recv().await {
                if let ServerEvent::SessionRevoked { digest, .. } = event
                    && tx.send(digest).is_err()
                {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[derive(Debug, Clone)]
pub struct ValidatorSettings {
    pub timeout: Duration,
    pub cache_ttl: Duration,
    pub retries: u32,
    pub backoff: Duration,
    pub reconnect_delay: Duration,
}

impl From<&ValidatorConfig> for ValidatorSettings {
    fn from(config: &ValidatorConfig) -> Self {
        Self {
            timeout: config.timeout,
            cache_ttl: config.cache_ttl,
            retries: config.retries,
            backoff: config.backoff,
            reconnect_delay: config.reconnect_delay,
        }
    }
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self::from(&ValidatorConfig::default())
    }
}

type Decision = Result<Option<Identity>, AuthError>;
type SharedDecision = Shared<BoxFuture<'static, Decision>>;

#[derive(Clone)]
struct InFlight {
    decision: SharedDecision,
    /// The token was revoked before the answer landed; waiters are refused
    revoked: Arc<AtomicBool>,
    /// The answer must not be cached (revocation or a cache clear)
    stale: Arc<AtomicBool>,
}

struct CachedDecision {
    identity: Option<Identity>,
    expires: Instant,
}

pub struct CrossServiceValidator {
    upstream: Arc<dyn AuthorityUpstream>,
    settings: ValidatorSettings,
    cache: DashMap<String, CachedDecision>,
    in_flight: DashMap<String, InFlight>,
}

impl CrossServiceValidator {
    pub fn new(upstream: Arc<dyn AuthorityUpstream>, settings: ValidatorSettings) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            settings,
            cache: DashMap::new(),
            in_flight: DashMap::new(),
        })
    }

    /// Resolve a token through the cache or, on a miss, the authority.
    pub async fn validate(self: &Arc<Self>, token: &str) -> Result<Identity, AuthError> {
        let key = token_digest(token);

        if let Some(decision) = self.cached(&key) {
            return decision.ok_or(AuthError::Unauthorized);
        }

        let flight = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                // The previous flight for this key stores its answer before
                // leaving the map, so re-check under the entry lock.
                if let Some(decision) = self.cached(&key) {
                    return decision.ok_or(AuthError::Unauthorized);
                }
                let flight = self.start_flight(key, token.to_string());
                entry.insert(flight.clone());
                flight
            }
        };

        let identity = flight.decision.await?.ok_or(AuthError::Unauthorized)?;
        if flight.revoked.load(Ordering::SeqCst) {
            return Err(AuthError::Unauthorized);
        }
        Ok(identity)
    }

    fn start_flight(self: &Arc<Self>, key: String, token: String) -> InFlight {
        let this = Arc::clone(self);
        let revoked = Arc::new(AtomicBool::new(false));
        let stale = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stale);
        // Spawned so the call completes even if every waiter goes away.
        let task = tokio::spawn(async move {
            let decision = this.fetch(&token).await;
            if let Ok(identity) = &decision {
                // Store first, then look at the flag. Invalidation sets the
                // flag before evicting, so one of the two sides always
                // removes the entry.
                this.store(key.clone(), identity.clone());
                if flag.load(Ordering::SeqCst) {
                    this.cache.remove(&key);
                    debug!("Dropped decision for {} invalidated mid-flight", short(&key));
                }
            }
            this.in_flight.remove(&key);
            decision
        });
        let decision = async move {
            task.await.unwrap_or_else(|e| {
                Err(AuthError::ServiceUnavailable(format!("validation task failed: {}", e)))
            })
        }
        .boxed()
        .shared();
        InFlight {
            decision,
            revoked,
            stale,
        }
    }

    /// One upstream validation, with per-attempt timeout and bounded retries.
    async fn fetch(&self, token: &str) -> Decision {
        let mut delay = self.settings.backoff;
        let mut attempt = 0;
        loop {
            let failure = match tokio::time::timeout(self.settings.timeout, self.upstream.validate(token)).await {
                Ok(Ok(identity)) => return Ok(identity),
                Ok(Err(UpstreamError::Protocol(msg))) => {
                    warn!("Authority gave an unusable validation answer: {}", msg);
                    return Err(AuthError::ServiceUnavailable(msg));
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("authority did not answer within {:?}", self.settings.timeout),
            };

            if attempt >= self.settings.retries {
                warn!("Session validation failed after {} attempt(s): {}", attempt + 1, failure);
                return Err(AuthError::ServiceUnavailable(failure));
            }
            attempt += 1;
            debug!("Validation attempt {} failed ({}), retrying in {:?}", attempt, failure, delay);
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }

    fn cached(&self, key: &str) -> Option<Option<Identity>> {
        let now = Instant::now();
        if let Some(entry) = self.cache.get(key) {
            if entry.expires > now {
                return Some(entry.identity.clone());
            }
        } else {
            return None;
        }
        self.cache.remove_if(key, |_, entry| entry.expires <= now);
        None
    }

    fn store(&self, key: String, identity: Option<Identity>) {
        let mut ttl = self.settings.cache_ttl;
        if let Some(identity) = &identity {
            let remaining = (identity.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            ttl = ttl.min(remaining);
        }
        if ttl.is_zero() {
            return;
        }
        self.cache.insert(
            key,
            CachedDecision {
                identity,
                expires: Instant::now() + ttl,
            },
        );
    }

    /// Forget any cached decision for a token.
    pub fn invalidate(&self, token: &str) {
        self.invalidate_digest(&token_digest(token));
    }

    pub fn invalidate_digest(&self, digest: &str) {
        if let Some(flight) = self.in_flight.get(digest) {
            flight.revoked.store(true, Ordering::SeqCst);
            flight.stale.store(true, Ordering::SeqCst);
        }
        if self.cache.remove(digest).is_some() {
            debug!("Evicted cached decision {}", short(digest));
        }
    }

    pub fn clear(&self) {
        for flight in self.in_flight.iter() {
            flight.stale.store(true, Ordering::SeqCst);
        }
        self.cache.clear();
    }

    /// Drop every expired decision. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.cache.len();
        self.cache.retain(|_, entry| entry.expires > now);
        before.saturating_sub(self.cache.len())
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Periodically sweep expired decisions out of the cache.
    pub fn spawn_cache_sweep(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = this.purge_expired();
                if purged > 0 {
                    debug!("Swept {} expired validation decision(s)", purged);
                }
            }
        })
    }

    /// Follow the authority's revocation feed for as long as the returned
    /// task runs, reopening it after failures.
    ///
    /// The cache is cleared whenever the feed is (re)opened, since
    /// revocations may have been missed while it was down.
    pub fn spawn_revocation_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match this.upstream.watch_revocations().await {
                    Ok(mut digests) => {
                        this.clear();
                        info!("Following authority revocation feed");
                        while let Some(digest) = digests.recv().await {
                            this.invalidate_digest(&digest);
                        }
                        warn!("Authority revocation feed closed");
                    }
                    Err(e) => warn!("Cannot open authority revocation feed: {}", e),
                }
                // Decisions made while the feed is down may be stale.
                this.clear();
                tokio::time::sleep(this.settings.reconnect_delay).await;
            }
        })
    }
}

fn short(digest: &str) -> &str {
    &digest[..digest.len().min(12)]
}
