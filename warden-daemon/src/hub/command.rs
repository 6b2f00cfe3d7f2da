//! Commands for the HubActor

use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, oneshot};
use warden_protocol::protocol::LogLine;

use super::{CloseReason, HubStatus};
use crate::errors::HubError;

/// What a new subscriber gets back from the actor.
pub struct Admission {
    pub id: u64,
    pub lines: mpsc::Receiver<LogLine>,
    /// Set by the actor before it drops the sending side
    pub close: Arc<OnceLock<CloseReason>>,
}

pub enum HubCommand {
    Subscribe {
        reply: oneshot::Sender<Result<Admission, HubError>>,
    },
    /// Idempotent; unknown ids are ignored
    Unsubscribe { id: u64 },
    Status {
        reply: oneshot::Sender<HubStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
