use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::errors::ProtocolError;

/// Maximum message size (1MB). Log lines and validation payloads are small.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Request sent from a client (CLI, dependent service) to the daemon.
///
/// Requests that act on behalf of a user carry the user's session token.
/// Requests without a token are either public (`Ping`, `ValidateSession`)
/// or restricted to local operators by peer credentials.
#[derive(Clone, Serialize, Deserialize)]
pub enum Request {
    /// Ping to check if daemon is alive
    Ping,
    /// Shutdown the daemon (local operator only)
    Shutdown,
    /// Create a user record (local operator only, authority mode)
    CreateUser {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        steam_id64: Option<String>,
        #[serde(default)]
        discord_id: Option<String>,
        /// Roles seeded on creation, by name
        #[serde(default)]
        roles: Vec<String>,
    },
    /// Issue a session for an existing user (local operator only, authority mode)
    IssueSession { user_id: u64 },
    /// Resolve a session token into an identity. This is the endpoint
    /// dependent services delegate to.
    ValidateSession { token: String },
    /// Revoke a session
    Logout { token: String },
    /// Stream revocation signals (`ServerEvent::SessionRevoked`) until the
    /// connection closes
    WatchRevocations,
    /// Grant a role to another user
    AssignRole { token: String, user_id: u64, role: String },
    /// Remove a role from another user
    RemoveRole { token: String, user_id: u64, role: String },
    /// List the managed services
    ListServices { token: String },
    /// Per-service log hub status
    HubStatus { token: String },
    /// Stream live log lines for a service until unsubscribed or disconnected
    SubscribeLogs { token: String, service: String },
    /// End a `SubscribeLogs` stream opened on this connection
    Unsubscribe { request_id: u64 },
    /// Restart a managed service
    RestartService { token: String, service: String },
}

impl Request {
    /// Return the variant name as a static string (for lightweight error reporting)
    pub fn variant_name(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::Shutdown => "Shutdown",
            Request::CreateUser { .. } => "CreateUser",
            Request::IssueSession { .. } => "IssueSession",
            Request::ValidateSession { .. } => "ValidateSession",
            Request::Logout { .. } => "Logout",
            Request::WatchRevocations => "WatchRevocations",
            Request::AssignRole { .. } => "AssignRole",
            Request::RemoveRole { .. } => "RemoveRole",
            Request::ListServices { .. } => "ListServices",
            Request::HubStatus { .. } => "HubStatus",
            Request::SubscribeLogs { .. } => "SubscribeLogs",
            Request::Unsubscribe { .. } => "Unsubscribe",
            Request::RestartService { .. } => "RestartService",
        }
    }
}

// Tokens must never reach logs, so Debug only shows the variant.
impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::IssueSession { user_id } => write!(f, "IssueSession {{ user_id: {} }}", user_id),
            Request::AssignRole { user_id, role, .. } => {
                write!(f, "AssignRole {{ user_id: {}, role: {} }}", user_id, role)
            }
            Request::RemoveRole { user_id, role, .. } => {
                write!(f, "RemoveRole {{ user_id: {}, role: {} }}", user_id, role)
            }
            Request::SubscribeLogs { service, .. } => write!(f, "SubscribeLogs {{ service: {} }}", service),
            Request::RestartService { service, .. } => write!(f, "RestartService {{ service: {} }}", service),
            Request::Unsubscribe { request_id } => write!(f, "Unsubscribe {{ request_id: {} }}", request_id),
            other => f.write_str(other.variant_name()),
        }
    }
}

/// Error category carried by `Response::Error`.
///
/// Callers rely on these staying distinct: a bad credential, a valid
/// credential with too little privilege, and an unreachable authority each
/// call for a different reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Missing, malformed, expired or revoked session
    Unauthorized,
    /// Valid session, insufficient rank
    Forbidden,
    /// The authority could not be reached; nothing was allowed
    ServiceUnavailable,
    /// The log tailing process could not be started
    StreamUnavailable,
    /// The process manager failed to restart a service
    ServiceControl,
    /// A role assignment rule was violated
    PermissionDenied,
    /// Unknown service or user
    NotFound,
    /// Malformed or unsupported request
    BadRequest,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::ServiceUnavailable => "service unavailable",
            Self::StreamUnavailable => "stream unavailable",
            Self::ServiceControl => "service control error",
            Self::PermissionDenied => "permission denied",
            Self::NotFound => "not found",
            Self::BadRequest => "bad request",
            Self::Internal => "internal error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response sent from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Successful response
    Ok {
        /// Optional message
        message: Option<String>,
        /// Optional data payload
        data: Option<ResponseData>,
    },
    /// Error response
    Error {
        kind: ErrorKind,
        /// Error message
        message: String,
    },
}

impl Response {
    /// Create a success response with a message
    pub fn ok_with_message(msg: impl Into<String>) -> Self {
        Response::Ok {
            message: Some(msg.into()),
            data: None,
        }
    }

    /// Create a success response with data
    pub fn ok_with_data(data: ResponseData) -> Self {
        Response::Ok {
            message: None,
            data: Some(data),
        }
    }

    /// Create an error response
    pub fn error(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Response::Error {
            kind,
            message: msg.into(),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Response::Error { kind, .. } => Some(*kind),
            Response::Ok { .. } => None,
        }
    }
}

/// Data payload in response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseData {
    /// Result of `ValidateSession`
    SessionValidation(SessionValidation),
    /// A freshly issued session
    Session(SessionInfo),
    /// A created user
    User(UserInfo),
    /// Outcome of a role assignment or removal
    RoleChange(RoleChangeInfo),
    /// Managed services
    Services(Vec<ServiceSummary>),
    /// Log hub status per service
    HubStatus(Vec<HubStatusInfo>),
    /// Outcome of a successful restart
    Restart(RestartInfo),
}

/// The validation contract between the authority and dependent services.
///
/// `valid == false` means the token is unknown, expired or revoked. The
/// identity fields are only set when `valid` is true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionValidation {
    pub valid: bool,
    #[serde(default)]
    pub user_id: Option<u64>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub min_rank: Option<u8>,
    /// Session expiry, milliseconds since Unix epoch
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl SessionValidation {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            user_id: None,
            roles: Vec::new(),
            min_rank: None,
            expires_at: None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub token: String,
    pub user_id: u64,
    /// Milliseconds since Unix epoch
    pub expires_at: i64,
}

impl std::fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInfo")
            .field("token", &"***")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: u64,
    pub name: Option<String>,
    pub steam_id64: Option<String>,
    pub discord_id: Option<String>,
    pub roles: Vec<String>,
    /// Milliseconds since Unix epoch
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleChangeInfo {
    pub user_id: u64,
    pub role: String,
    /// False when the user already had (or already lacked) the role
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub name: String,
    pub display_name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubStatusInfo {
    pub service: String,
    /// "idle", "starting", "streaming" or "draining"
    pub state: String,
    pub subscribers: usize,
    /// PID of the tailing process, if one is alive
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartInfo {
    pub service: String,
    pub exit_code: i32,
}

/// One log line produced by a service's tailing process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub message: String,
    /// Syslog priority (0 = emerg .. 7 = debug), when known
    #[serde(default)]
    pub priority: Option<u8>,
    /// Microseconds since Unix epoch, when known
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl LogLine {
    pub fn plain(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            priority: None,
            timestamp: None,
        }
    }
}

/// Connection-state changes for a `SubscribeLogs` stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    /// Subscribed; lines follow
    Connected { service: String },
    /// The tailing process stopped; resubscribe to restart it
    ServiceUnavailable { reason: String },
    /// The subscriber fell too far behind and was dropped; resubscribe
    OverflowDisconnect,
    /// The session stopped validating while the stream was open
    Unauthorized,
    /// The daemon is shutting down
    Shutdown,
}

/// Client-to-server message with request ID for multiplexing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub request: Request,
}

/// Server-to-client message: either a response to a request, or a pushed event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    Response { id: u64, response: Response },
    Event { event: ServerEvent },
}

/// Server-pushed events, tagged with the request that opened the stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerEvent {
    Log { request_id: u64, line: LogLine },
    StreamState { request_id: u64, state: StreamState },
    /// A session was revoked; `digest` is the hex SHA-256 of the token
    SessionRevoked { request_id: u64, digest: String },
}

impl ServerEvent {
    pub fn request_id(&self) -> u64 {
        match self {
            ServerEvent::Log { request_id, .. }
            | ServerEvent::StreamState { request_id, .. }
            | ServerEvent::SessionRevoked { request_id, .. } => *request_id,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value).map_err(ProtocolError::Encode)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge);
    }
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
}

/// Encode a request envelope to length-prefixed JSON bytes
pub fn encode_envelope(envelope: &RequestEnvelope) -> Result<Vec<u8>> {
    encode_frame(envelope)
}

/// Decode a request envelope from raw JSON payload (framing already stripped)
pub fn decode_envelope(bytes: &[u8]) -> Result<RequestEnvelope> {
    decode_frame(bytes)
}

/// Encode a server message to length-prefixed JSON bytes
pub fn encode_server_message(msg: &ServerMessage) -> Result<Vec<u8>> {
    encode_frame(msg)
}

/// Decode a server message from raw JSON payload (framing already stripped)
pub fn decode_server_message(bytes: &[u8]) -> Result<ServerMessage> {
    decode_frame(bytes)
}
