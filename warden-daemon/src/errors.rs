use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use warden_protocol::protocol::ErrorKind;

use crate::users::UserId;

/// Format a YAML error for user-friendly display, including the field path
fn format_yaml_error(e: &serde_path_to_error::Error<serde_yaml::Error>) -> String {
    let path = e.path().to_string();
    let inner = e.inner();
    let msg = inner.to_string();

    let located = if let Some(loc) = inner.location() {
        format!("Line {}, Column {}: {}", loc.line(), loc.column(), msg)
    } else {
        msg
    };

    if path.is_empty() || path == "." {
        located
    } else {
        format!("{}: {}", path, located)
    }
}

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse config file '{path}':\n  {}", format_yaml_error(.source))]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_path_to_error::Error<serde_yaml::Error>,
    },

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Failed to open audit log {path}: {source}")]
    AuditLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("OS random number generator unavailable: {0}")]
    Entropy(getrandom::Error),

    #[error("Server error: {0}")]
    Server(#[from] warden_protocol::errors::ServerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Outcome of an authorization check that did not allow the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Missing, malformed, expired or revoked session token
    #[error("invalid, expired or revoked session")]
    Unauthorized,

    /// Valid session whose best rank is not good enough
    #[error("user {user_id} has rank {actual}, rank {required} or better is required")]
    Forbidden {
        user_id: UserId,
        required: u8,
        actual: u8,
    },

    /// The authority could not answer; the request is refused
    #[error("authority unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Unauthorized => ErrorKind::Unauthorized,
            AuthError::Forbidden { .. } => ErrorKind::Forbidden,
            AuthError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
        }
    }

    /// The user the failed check was about, if the credential identified one.
    pub fn actor(&self) -> Option<UserId> {
        match self {
            AuthError::Forbidden { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoleError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("unknown role: {0}")]
    UnknownRole(String),
}

impl RoleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoleError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            RoleError::UserNotFound(_) => ErrorKind::NotFound,
            RoleError::UnknownRole(_) => ErrorKind::BadRequest,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UserError {
    #[error("{identity} is already linked to user {user_id}")]
    DuplicateIdentity { identity: String, user_id: UserId },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("no log stream for service: {0}")]
    ServiceNotFound(String),

    #[error("log stream for {service} unavailable: {reason}")]
    StreamUnavailable { service: String, reason: String },

    #[error("log hub for {0} has stopped")]
    HubStopped(String),
}

impl HubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::ServiceNotFound(_) => ErrorKind::NotFound,
            HubError::StreamUnavailable { .. } | HubError::HubStopped(_) => ErrorKind::StreamUnavailable,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("restart of {service} failed{}: {message}", exit_code.map(|c| format!(" (exit code {})", c)).unwrap_or_default())]
    ServiceControl {
        service: String,
        exit_code: Option<i32>,
        message: String,
    },

    #[error("restart of {service} did not finish within {timeout:?}")]
    Timeout { service: String, timeout: Duration },
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::Auth(e) => e.kind(),
            ControlError::ServiceNotFound(_) => ErrorKind::NotFound,
            ControlError::ServiceControl { .. } | ControlError::Timeout { .. } => ErrorKind::ServiceControl,
        }
    }
}
