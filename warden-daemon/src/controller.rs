//! Authorized service restarts.
//!
//! Every call, including one refused by the gate, leaves exactly one
//! `restart` audit entry before the result is returned.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::audit::{ACTION_RESTART, AuditEntry, AuditLog, AuditOutcome};
use crate::config::ServiceCatalog;
use crate::errors::{AuthError, ControlError};
use crate::gate::AuthorizationGate;
use crate::manager::{ProcessManager, RestartOutcome};
use crate::roles::MODERATOR_OR_ABOVE;
use crate::users::UserId;

pub struct ServiceController {
    gate: Arc<AuthorizationGate>,
    catalog: ServiceCatalog,
    manager: Arc<dyn ProcessManager>,
    audit: Arc<AuditLog>,
    timeout: Duration,
}

impl ServiceController {
    pub fn new(
        gate: Arc<AuthorizationGate>,
        catalog: ServiceCatalog,
        manager: Arc<dyn ProcessManager>,
        audit: Arc<AuditLog>,
        timeout: Duration,
    ) -> Self {
        Self {
            gate,
            catalog,
            manager,
            audit,
            timeout,
        }
    }

    /// Restart a managed service on behalf of the token's owner.
    pub async fn restart(&self, token: &str, service: &str) -> Result<RestartOutcome, ControlError> {
        let identity = match self.gate.require_min_rank(token, MODERATOR_OR_ABOVE).await {
            Ok(identity) => identity,
            Err(e) => {
                self.record(e.actor(), service, denied_outcome(&e));
                return Err(e.into());
            }
        };
        let actor = Some(identity.user_id);

        let Some(definition) = self.catalog.get(service) else {
            let err = ControlError::ServiceNotFound(service.to_string());
            self.record(actor, service, AuditOutcome::Failure { reason: err.to_string() });
            return Err(err);
        };

        info!("User {} restarting {}", identity.user_id, service);
        let result = match tokio::time::timeout(self.timeout, self.manager.restart(definition)).await {
            Err(_) => Err(ControlError::Timeout {
                service: service.to_string(),
                timeout: self.timeout,
            }),
            Ok(Err(e)) => Err(ControlError::ServiceControl {
                service: service.to_string(),
                exit_code: None,
                message: e.to_string(),
            }),
            Ok(Ok(outcome)) if outcome.success() => Ok(outcome),
            Ok(Ok(outcome)) => Err(ControlError::ServiceControl {
                service: service.to_string(),
                exit_code: outcome.exit_code,
                message: if outcome.stderr.is_empty() {
                    "restart command failed".to_string()
                } else {
                    outcome.stderr
                },
            }),
        };

        match &result {
            Ok(_) => self.record(actor, service, AuditOutcome::Success),
            Err(e) => {
                warn!("Restart of {} failed: {}", service, e);
                self.record(actor, service, AuditOutcome::Failure { reason: e.to_string() });
            }
        }
        result
    }

    fn record(&self, actor: Option<UserId>, service: &str, outcome: AuditOutcome) {
        self.audit
            .record(AuditEntry::new(actor, ACTION_RESTART, service, outcome));
    }
}

fn denied_outcome(err: &AuthError) -> AuditOutcome {
    match err {
        AuthError::ServiceUnavailable(_) => AuditOutcome::Failure { reason: err.to_string() },
        _ => AuditOutcome::Denied { reason: err.to_string() },
    }
}
