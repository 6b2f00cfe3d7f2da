//! Upstream wrapper that counts validation round-trips

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use warden_daemon::gate::Identity;
use warden_daemon::validator::{AuthorityUpstream, SocketAuthority, UpstreamError};

/// Talks to a real authority socket and counts every `validate` call that
/// reaches it.
pub struct CountingAuthority {
    inner: SocketAuthority,
    calls: AtomicUsize,
}

impl CountingAuthority {
    pub fn new(socket_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            inner: SocketAuthority::new(socket_path),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthorityUpstream for CountingAuthority {
    async fn validate(&self, token: &str) -> Result<Option<Identity>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.validate(token).await
    }

    async fn watch_revocations(&self) -> Result<mpsc::UnboundedReceiver<String>, UpstreamError> {
        self.inner.watch_revocations().await
    }
}
