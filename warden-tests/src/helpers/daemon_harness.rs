//! Test harness that runs a full daemon in-process without the binary

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::error;
use warden_daemon::audit::{AuditEntry, AuditLog, MemoryAuditSink};
use warden_daemon::config::WardenConfig;
use warden_daemon::context::{AuthorityState, DaemonContext};
use warden_daemon::handler::handle_request;
use warden_daemon::manager::{CommandManager, ProcessManager};
use warden_daemon::roles::Role;
use warden_daemon::users::{ExternalIds, UserId};
use warden_daemon::validator::AuthorityUpstream;
use warden_protocol::client::Client;
use warden_protocol::protocol::Request;
use warden_protocol::server::{RequestContext, Server, ShutdownTx};

use super::wait_utils::wait_for_socket;

/// A daemon context behind a live socket server, with audit entries
/// captured in memory.
pub struct TestDaemonHarness {
    pub daemon: Arc<DaemonContext>,
    pub audit: Arc<MemoryAuditSink>,
    socket_path: PathBuf,
    shutdown_tx: ShutdownTx,
    server: Option<JoinHandle<()>>,
}

impl TestDaemonHarness {
    /// Start a daemon with the `command` process manager
    pub async fn start(config: WardenConfig) -> io::Result<Self> {
        Self::start_with(config, Arc::new(CommandManager), None).await
    }

    /// Start a daemon with a custom process manager and, in dependent
    /// mode, a custom view of the authority
    pub async fn start_with(
        config: WardenConfig,
        manager: Arc<dyn ProcessManager>,
        upstream: Option<Arc<dyn AuthorityUpstream>>,
    ) -> io::Result<Self> {
        let socket_path = config.socket_path().map_err(io::Error::other)?;
        let audit = Arc::new(MemoryAuditSink::new());
        let audit_log = Arc::new(AuditLog::new().with_sink(audit.clone()));

        let daemon = Arc::new(
            DaemonContext::start(&config, manager, audit_log, upstream).map_err(io::Error::other)?,
        );

        let handler_daemon = daemon.clone();
        let handler = move |request: Request, ctx: RequestContext| {
            let daemon = handler_daemon.clone();
            async move { handle_request(daemon, request, ctx).await }
        };
        let server = Server::new(socket_path.clone(), handler).with_socket_mode(0o600);
        let shutdown_tx = server.shutdown_handle();
        let task = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Test server stopped: {}", e);
            }
        });

        if !wait_for_socket(&socket_path, Duration::from_secs(5)).await {
            task.abort();
            return Err(io::Error::other(format!(
                "daemon did not start listening on {}",
                socket_path.display()
            )));
        }

        Ok(Self {
            daemon,
            audit,
            socket_path,
            shutdown_tx,
            server: Some(task),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Open a new client connection
    pub async fn client(&self) -> Client {
        Client::connect(&self.socket_path)
            .await
            .expect("connect to test daemon")
    }

    /// User, role and session tables (authority mode only)
    pub fn authority(&self) -> &AuthorityState {
        self.daemon
            .authority
            .as_ref()
            .expect("harness daemon is not in authority mode")
    }

    /// Create a user holding `roles`
    pub fn create_user(&self, roles: &[Role]) -> UserId {
        let authority = self.authority();
        let user = authority
            .users
            .create(None, ExternalIds::default())
            .expect("create user");
        for role in roles {
            authority.roles.seed(user.id, *role).expect("seed role");
        }
        user.id
    }

    /// Issue a fresh session token for `user`
    pub fn session_for(&self, user: UserId) -> String {
        let (token, _) = self.authority().sessions.issue(user).expect("issue session");
        token.to_hex()
    }

    /// Create a user holding `roles` and log them in
    pub fn login(&self, roles: &[Role]) -> (UserId, String) {
        let user = self.create_user(roles);
        (user, self.session_for(user))
    }

    /// Audit entries for `action`, oldest first
    pub fn audit_entries(&self, action: &str) -> Vec<AuditEntry> {
        self.audit
            .entries()
            .into_iter()
            .filter(|e| e.action == action)
            .collect()
    }

    /// Stop accepting connections and shut the daemon down
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Some(task) = self.server.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        self.daemon.shutdown().await;
    }
}

impl Drop for TestDaemonHarness {
    fn drop(&mut self) {
        if let Some(task) = self.server.take() {
            task.abort();
        }
    }
}
