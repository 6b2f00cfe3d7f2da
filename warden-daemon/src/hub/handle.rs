//! HubHandle and Subscription - the client side of a hub actor.

use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use warden_protocol::protocol::LogLine;

use super::command::HubCommand;
use super::{CloseReason, HubStatus, SubscriptionEvent};
use crate::errors::HubError;

/// Handle for sending commands to a hub actor.
/// This is cheap to clone (just clones the channel sender and name).
#[derive(Clone)]
pub struct HubHandle {
    service: String,
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub(super) fn new(service: String, tx: mpsc::Sender<HubCommand>) -> Self {
        Self { service, tx }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Join the service's stream, starting the tail if the hub is idle.
    ///
    /// Lines produced before this call are not replayed.
    pub async fn subscribe(&self) -> Result<Subscription, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Subscribe { reply: reply_tx })
            .await
            .map_err(|_| self.stopped())?;
        let admission = reply_rx.await.map_err(|_| self.stopped())??;

        Ok(Subscription {
            id: admission.id,
            service: self.service.clone(),
            lines: admission.lines,
            close: admission.close,
            hub: self.tx.clone(),
            unsubscribed: false,
        })
    }

    pub async fn status(&self) -> Result<HubStatus, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Status { reply: reply_tx })
            .await
            .map_err(|_| self.stopped())?;
        reply_rx.await.map_err(|_| self.stopped())
    }

    /// Stop the tail, close every subscription and end the actor.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(HubCommand::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    fn stopped(&self) -> HubError {
        HubError::HubStopped(self.service.clone())
    }
}

/// One subscriber's view of a service's log stream.
///
/// Dropping a subscription unsubscribes it.
pub struct Subscription {
    id: u64,
    service: String,
    lines: mpsc::Receiver<LogLine>,
    close: Arc<OnceLock<CloseReason>>,
    hub: mpsc::Sender<HubCommand>,
    unsubscribed: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Next line, or the reason the stream ended. Keeps returning
    /// `Closed` once closed.
    pub async fn recv(&mut self) -> SubscriptionEvent {
        match self.lines.recv().await {
            Some(line) => SubscriptionEvent::Line(line),
            None => SubscriptionEvent::Closed(
                self.close.get().cloned().unwrap_or(CloseReason::Shutdown),
            ),
        }
    }

    /// Leave the stream. Idempotent.
    pub async fn unsubscribe(&mut self) {
        if std::mem::replace(&mut self.unsubscribed, true) {
            return;
        }
        let _ = self.hub.send(HubCommand::Unsubscribe { id: self.id }).await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.unsubscribed {
            return;
        }
        let command = HubCommand::Unsubscribe { id: self.id };
        match self.hub.try_send(command) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                // Hub is busy; deliver it from a task instead of blocking
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let hub = self.hub.clone();
                    runtime.spawn(async move {
                        let _ = hub.send(command).await;
                    });
                } else {
                    debug!("Dropped subscription {} outside a runtime", self.id);
                }
            }
        }
    }
}
