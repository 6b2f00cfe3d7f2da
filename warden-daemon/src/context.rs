//! Long-lived daemon state shared by every request handler.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::audit::AuditLog;
use crate::config::{Mode, ServiceCatalog, WardenConfig};
use crate::controller::ServiceController;
use crate::errors::{DaemonError, Result};
use crate::gate::{AuthorizationGate, LocalGate};
use crate::hub::{HubRegistry, HubSettings};
use crate::manager::ProcessManager;
use crate::roles::RoleRegistry;
use crate::session_store::SessionStore;
use crate::users::UserDirectory;
use crate::validator::{AuthorityUpstream, CrossServiceValidator, SocketAuthority, ValidatorSettings};

/// Floor for the validator cache sweep interval
const MIN_CACHE_SWEEP: Duration = Duration::from_secs(1);

/// Tables only the authority owns.
pub struct AuthorityState {
    pub users: Arc<UserDirectory>,
    pub roles: Arc<RoleRegistry>,
    pub sessions: Arc<SessionStore>,
}

pub struct DaemonContext {
    pub mode: Mode,
    pub catalog: ServiceCatalog,
    pub gate: Arc<AuthorizationGate>,
    /// `Some` in authority mode
    pub authority: Option<AuthorityState>,
    pub hubs: HubRegistry,
    pub controller: ServiceController,
    pub audit: Arc<AuditLog>,
    /// Effective uid of the daemon; peers with this uid (or root) are
    /// local operators
    pub daemon_uid: u32,
    pub viewer_rank: u8,
    pub reauth_interval: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl DaemonContext {
    /// Wire up every component described by the config and start the
    /// background tasks.
    ///
    /// In dependent mode `upstream` overrides the configured authority
    /// socket.
    pub fn start(
        config: &WardenConfig,
        manager: Arc<dyn ProcessManager>,
        audit: Arc<AuditLog>,
        upstream: Option<Arc<dyn AuthorityUpstream>>,
    ) -> Result<Self> {
        let mut tasks = Vec::new();

        let (gate, authority) = match config.mode {
            Mode::Authority => {
                let users = Arc::new(UserDirectory::new());
                let roles = Arc::new(RoleRegistry::new(users.clone(), audit.clone()));
                let sessions = Arc::new(SessionStore::new(config.sessions.ttl));
                tasks.push(spawn_session_purge(sessions.clone(), config.sessions.purge_interval));

                let gate = AuthorizationGate::Local(LocalGate::new(sessions.clone(), roles.clone()));
                (gate, Some(AuthorityState { users, roles, sessions }))
            }
            Mode::Dependent => {
                let upstream = match upstream {
                    Some(upstream) => upstream,
                    None => {
                        let authority = config.authority.as_ref().ok_or_else(|| {
                            DaemonError::Config("dependent mode requires an authority socket".into())
                        })?;
                        Arc::new(SocketAuthority::new(authority.socket_path.clone()))
                    }
                };
                let validator = CrossServiceValidator::new(upstream, ValidatorSettings::from(&config.validator));
                tasks.push(validator.spawn_revocation_listener());
                tasks.push(validator.spawn_cache_sweep(config.validator.cache_ttl.max(MIN_CACHE_SWEEP)));
                (AuthorizationGate::Remote(validator), None)
            }
        };
        let gate = Arc::new(gate);

        let catalog = config.catalog();
        let hubs = HubRegistry::start(&catalog, manager.clone(), HubSettings::from(&config.hub));
        let controller = ServiceController::new(
            gate.clone(),
            catalog.clone(),
            manager.clone(),
            audit.clone(),
            config.control.restart_timeout,
        );

        info!(
            "Daemon context ready: {:?} mode, {} service(s), {} process manager",
            config.mode,
            catalog.len(),
            manager.name()
        );

        Ok(Self {
            mode: config.mode,
            catalog,
            gate,
            authority,
            hubs,
            controller,
            audit,
            daemon_uid: nix::unistd::geteuid().as_raw(),
            viewer_rank: config.hub.viewer_role.rank(),
            reauth_interval: config.hub.reauth_interval,
            tasks,
        })
    }

    /// Stop background tasks and every log hub.
    pub async fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.hubs.shutdown_all().await;
    }
}

fn spawn_session_purge(sessions: Arc<SessionStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = sessions.purge_expired(Utc::now());
            if purged > 0 {
                debug!("Purged {} dead session(s)", purged);
            }
        }
    })
}
