//! Per-request authorization.
//!
//! One gate per daemon, picked once from the config: the authority checks
//! its own session and role tables, a dependent service delegates to the
//! authority through [`CrossServiceValidator`]. Either way a check is a
//! pure read; a failure is terminal for the request and never downgraded
//! to an allow.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use warden_protocol::protocol::SessionValidation;

use crate::errors::AuthError;
use crate::roles::{Role, RoleRegistry, min_rank_of};
use crate::session_store::SessionStore;
use crate::users::UserId;
use crate::validator::CrossServiceValidator;

/// Who a token belongs to and how privileged they are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: UserId,
    /// Most privileged first
    pub roles: Vec<Role>,
    pub min_rank: u8,
    pub expires_at: DateTime<Utc>,
}

impl Identity {
    pub fn has_rank(&self, required: u8) -> bool {
        self.min_rank <= required
    }

    /// Wire form returned by the authority's validation endpoint.
    pub fn to_validation(&self) -> SessionValidation {
        SessionValidation {
            valid: true,
            user_id: Some(self.user_id.0),
            roles: self.roles.iter().map(|r| r.name().to_string()).collect(),
            min_rank: Some(self.min_rank),
            expires_at: Some(self.expires_at.timestamp_millis()),
        }
    }

    /// Parse the authority's answer. `Ok(None)` means the token is not
    /// valid; `Err` means the answer itself is malformed.
    pub fn from_validation(validation: &SessionValidation) -> Result<Option<Identity>, String> {
        if !validation.valid {
            return Ok(None);
        }
        let user_id = validation
            .user_id
            .ok_or("validation response is missing user_id")?;
        let min_rank = validation
            .min_rank
            .ok_or("validation response is missing min_rank")?;
        let expires_at = validation
            .expires_at
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or("validation response is missing expires_at")?;

        // Roles this build doesn't know are dropped; min_rank is authoritative.
        let mut roles: Vec<Role> = validation.roles.iter().filter_map(|r| Role::parse(r)).collect();
        roles.sort();

        Ok(Some(Identity {
            user_id: UserId(user_id),
            roles,
            min_rank,
            expires_at,
        }))
    }
}

/// Fail with `Forbidden` unless the identity holds `required` or better.
pub fn check_rank(identity: &Identity, required: u8) -> Result<(), AuthError> {
    if identity.has_rank(required) {
        Ok(())
    } else {
        Err(AuthError::Forbidden {
            user_id: identity.user_id,
            required,
            actual: identity.min_rank,
        })
    }
}

/// Gate backed by the authority's own tables.
pub struct LocalGate {
    sessions: Arc<SessionStore>,
    roles: Arc<RoleRegistry>,
}

impl LocalGate {
    pub fn new(sessions: Arc<SessionStore>, roles: Arc<RoleRegistry>) -> Self {
        Self { sessions, roles }
    }

    pub fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let session = self.sessions.validate(token)?;
        let roles = self.roles.roles_of(session.user_id);
        Ok(Identity {
            user_id: session.user_id,
            min_rank: min_rank_of(&roles),
            roles,
            expires_at: session.expires_at,
        })
    }
}

pub enum AuthorizationGate {
    Local(LocalGate),
    Remote(Arc<CrossServiceValidator>),
}

impl AuthorizationGate {
    /// Resolve the identity behind a token.
    ///
    /// Fails with `Unauthorized` for a bad credential and, for the remote
    /// gate only, `ServiceUnavailable` when the authority cannot answer.
    pub async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        match self {
            AuthorizationGate::Local(gate) => gate.validate(token),
            AuthorizationGate::Remote(validator) => validator.validate(token).await,
        }
    }

    /// Validate, then require `required` rank or better.
    pub async fn require_min_rank(&self, token: &str, required: u8) -> Result<Identity, AuthError> {
        let identity = self.validate(token).await?;
        check_rank(&identity, required)?;
        Ok(identity)
    }

    pub fn is_local(&self) -> bool {
        matches!(self, AuthorizationGate::Local(_))
    }
}

#[cfg(test)]
mod tests;
