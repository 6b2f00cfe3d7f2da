//! Per-service log stream hubs.
//!
//! Each managed service gets one hub actor that owns its tailing process
//! and its subscriber set. Hubs for different services run as independent
//! tasks, so a slow or failing service never blocks another.
//!
//! ## States
//!
//! ```text
//! Idle --subscribe--> Starting --process alive--> Streaming
//! Streaming --last unsubscribe--> Draining --grace elapsed--> Idle
//! Draining --subscribe--> Streaming
//! Streaming/Draining --tail exits--> Idle
//! ```
//!
//! ## Module Structure
//!
//! - `actor` - HubActor (owns the tail process and fans lines out)
//! - `handle` - HubHandle and Subscription (cheap-to-clone client side)
//! - `command` - HubCommand enum
//! - `journal` - parsing of journal JSON lines
//! - `registry` - HubRegistry (one hub per configured service)

mod actor;
mod command;
mod handle;
pub mod journal;
mod registry;

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use warden_protocol::protocol::{HubStatusInfo, LogLine, StreamState};

use crate::config::HubConfig;

pub use actor::HubActor;
pub use handle::{HubHandle, Subscription};
pub use registry::HubRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HubState {
    Idle,
    Starting,
    Streaming,
    Draining,
}

impl HubState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubState::Idle => "idle",
            HubState::Starting => "starting",
            HubState::Streaming => "streaming",
            HubState::Draining => "draining",
        }
    }
}

impl fmt::Display for HubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubStatus {
    pub service: String,
    pub state: HubState,
    pub subscribers: usize,
    pub pid: Option<u32>,
}

impl From<HubStatus> for HubStatusInfo {
    fn from(status: HubStatus) -> Self {
        HubStatusInfo {
            service: status.service,
            state: status.state.as_str().to_string(),
            subscribers: status.subscribers,
            pid: status.pid,
        }
    }
}

/// Why a subscription stopped delivering lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Unsubscribed,
    /// The subscriber's buffer filled up
    Overflow,
    /// The tailing process exited
    ServiceUnavailable(String),
    Shutdown,
}

impl CloseReason {
    /// Stream-state event announcing this close, if the client should be told.
    pub fn stream_state(&self) -> Option<StreamState> {
        match self {
            CloseReason::Unsubscribed => None,
            CloseReason::Overflow => Some(StreamState::OverflowDisconnect),
            CloseReason::ServiceUnavailable(reason) => Some(StreamState::ServiceUnavailable {
                reason: reason.clone(),
            }),
            CloseReason::Shutdown => Some(StreamState::Shutdown),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Line(LogLine),
    Closed(CloseReason),
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub grace_period: Duration,
    pub buffer_capacity: usize,
    pub stop_timeout: Duration,
}

impl From<&HubConfig> for HubSettings {
    fn from(config: &HubConfig) -> Self {
        Self {
            grace_period: config.grace_period,
            buffer_capacity: config.buffer_capacity.max(1),
            stop_timeout: config.stop_timeout,
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

#[cfg(test)]
mod tests;
