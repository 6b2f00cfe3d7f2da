//! HubActor - owns one service's tailing process and subscriber set.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use warden_protocol::protocol::LogLine;

use super::command::{Admission, HubCommand};
use super::handle::HubHandle;
use super::{CloseReason, HubSettings, HubState, HubStatus, journal};
use crate::config::ServiceDefinition;
use crate::errors::HubError;
use crate::manager::{ProcessManager, terminate};

/// Raw lines queued between the tail reader task and the actor.
const TAIL_CHANNEL_CAPACITY: usize = 1024;

struct Subscriber {
    lines: mpsc::Sender<LogLine>,
    close: Arc<OnceLock<CloseReason>>,
}

impl Subscriber {
    /// Record why this subscriber is being dropped. The first reason wins.
    fn close(&self, reason: CloseReason) {
        let _ = self.close.set(reason);
    }
}

struct Tail {
    child: Child,
    lines: mpsc::Receiver<String>,
    reader: JoinHandle<()>,
}

pub struct HubActor {
    service: Arc<ServiceDefinition>,
    manager: Arc<dyn ProcessManager>,
    settings: HubSettings,
    rx: mpsc::Receiver<HubCommand>,
    state: HubState,
    subscribers: HashMap<u64, Subscriber>,
    next_id: u64,
    tail: Option<Tail>,
    drain_deadline: Option<Instant>,
}

impl HubActor {
    /// Create an actor and its handle. The caller spawns `run()`.
    pub fn create(
        service: Arc<ServiceDefinition>,
        manager: Arc<dyn ProcessManager>,
        settings: HubSettings,
    ) -> (HubHandle, HubActor) {
        let (tx, rx) = mpsc::channel(256);
        let handle = HubHandle::new(service.name.clone(), tx);
        let actor = HubActor {
            service,
            manager,
            settings,
            rx,
            state: HubState::Idle,
            subscribers: HashMap::new(),
            next_id: 1,
            tail: None,
            drain_deadline: None,
        };
        (handle, actor)
    }

    pub async fn run(mut self) {
        debug!("Log hub for {} started", self.service.name);

        loop {
            let deadline = self.drain_deadline;
            let tail_lines = self.tail.as_mut().map(|t| &mut t.lines);

            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(HubCommand::Subscribe { reply }) => self.subscribe(reply),
                    Some(HubCommand::Unsubscribe { id }) => self.unsubscribe(id),
                    Some(HubCommand::Status { reply }) => {
                        let _ = reply.send(self.status());
                    }
                    Some(HubCommand::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        // Every handle is gone
                        self.shutdown().await;
                        break;
                    }
                },
                line = next_tail_line(tail_lines) => match line {
                    Some(raw) => self.fan_out(journal::parse_line(&raw)),
                    None => self.tail_exited().await,
                },
                _ = grace_elapsed(deadline) => self.drain_finished().await,
            }
        }

        debug!("Log hub for {} stopped", self.service.name);
    }

    fn subscribe(&mut self, reply: oneshot::Sender<Result<Admission, HubError>>) {
        if self.tail.is_none() {
            self.state = HubState::Starting;
            match self.start_tail() {
                Ok(tail) => self.tail = Some(tail),
                Err(reason) => {
                    warn!("Cannot start log tail for {}: {}", self.service.name, reason);
                    self.state = HubState::Idle;
                    let _ = reply.send(Err(HubError::StreamUnavailable {
                        service: self.service.name.clone(),
                        reason,
                    }));
                    return;
                }
            }
        }

        if self.state == HubState::Draining {
            debug!("Resubscribed to {} during grace period", self.service.name);
        }
        self.drain_deadline = None;
        self.state = HubState::Streaming;

        let id = self.next_id;
        self.next_id += 1;
        let (lines_tx, lines_rx) = mpsc::channel(self.settings.buffer_capacity);
        let close = Arc::new(OnceLock::new());
        self.subscribers.insert(
            id,
            Subscriber {
                lines: lines_tx,
                close: close.clone(),
            },
        );

        let admission = Admission {
            id,
            lines: lines_rx,
            close,
        };
        if reply.send(Ok(admission)).is_err() {
            // Caller went away before it could receive the subscription
            self.remove_subscriber(id);
        } else {
            debug!("Subscriber {} joined {} ({} total)", id, self.service.name, self.subscribers.len());
        }
    }

    fn start_tail(&mut self) -> std::result::Result<Tail, String> {
        let mut child = self
            .manager
            .spawn_tail(&self.service)
            .map_err(|e| format!("failed to spawn log tail: {}", e))?;

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => return Err(format!("log tail exited immediately ({})", status)),
            Err(e) => return Err(format!("cannot check log tail: {}", e)),
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "log tail has no stdout".to_string())?;
        let (tx, rx) = mpsc::channel(TAIL_CHANNEL_CAPACITY);
        let reader = tokio::spawn(async move {
            let mut stdout = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match stdout.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Log tail read failed: {}", e);
                        break;
                    }
                }
                // Journal output is not guaranteed to be UTF-8
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        info!(
            "Started log tail for {} via {} (pid {:?})",
            self.service.name,
            self.manager.name(),
            child.id()
        );
        Ok(Tail {
            child,
            lines: rx,
            reader,
        })
    }

    fn unsubscribe(&mut self, id: u64) {
        if let Some(subscriber) = self.subscribers.get(&id) {
            subscriber.close(CloseReason::Unsubscribed);
            self.remove_subscriber(id);
        }
    }

    fn remove_subscriber(&mut self, id: u64) {
        if self.subscribers.remove(&id).is_none() {
            return;
        }
        debug!("Subscriber {} left {} ({} remaining)", id, self.service.name, self.subscribers.len());
        if self.subscribers.is_empty() && self.state == HubState::Streaming {
            self.state = HubState::Draining;
            self.drain_deadline = Some(Instant::now() + self.settings.grace_period);
            debug!("No subscribers left for {}, draining", self.service.name);
        }
    }

    fn fan_out(&mut self, line: LogLine) {
        let mut dropped = Vec::new();
        for (id, subscriber) in &self.subscribers {
            match subscriber.lines.try_send(line.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber {} to {} fell behind, disconnecting", id, self.service.name);
                    subscriber.close(CloseReason::Overflow);
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => dropped.push(*id),
            }
        }
        for id in dropped {
            self.remove_subscriber(id);
        }
    }

    /// The reader saw EOF or a read error. The process may still be alive
    /// with its stdout closed, so it is stopped with the usual timeout.
    async fn tail_exited(&mut self) {
        let status = match self.tail.take() {
            Some(mut tail) => {
                tail.reader.abort();
                match tail.child.try_wait() {
                    Ok(Some(status)) => Some(status),
                    _ => {
                        terminate(&mut tail.child, self.settings.stop_timeout).await;
                        tail.child.try_wait().ok().flatten()
                    }
                }
            }
            None => None,
        };
        let reason = match status {
            Some(status) => format!("log tail exited ({})", status),
            None => "log tail exited".to_string(),
        };
        warn!("Log tail for {} stopped: {}", self.service.name, reason);

        self.close_all(CloseReason::ServiceUnavailable(reason));
        self.state = HubState::Idle;
        self.drain_deadline = None;
    }

    async fn drain_finished(&mut self) {
        self.drain_deadline = None;
        if !self.subscribers.is_empty() {
            return;
        }
        info!("Grace period elapsed for {}, stopping log tail", self.service.name);
        self.stop_tail().await;
        self.state = HubState::Idle;
    }

    async fn stop_tail(&mut self) {
        if let Some(mut tail) = self.tail.take() {
            tail.reader.abort();
            terminate(&mut tail.child, self.settings.stop_timeout).await;
        }
    }

    fn close_all(&mut self, reason: CloseReason) {
        for (_, subscriber) in self.subscribers.drain() {
            subscriber.close(reason.clone());
        }
    }

    async fn shutdown(&mut self) {
        self.close_all(CloseReason::Shutdown);
        self.stop_tail().await;
        self.drain_deadline = None;
        self.state = HubState::Idle;
    }

    fn status(&self) -> HubStatus {
        HubStatus {
            service: self.service.name.clone(),
            state: self.state,
            subscribers: self.subscribers.len(),
            pid: self.tail.as_ref().and_then(|t| t.child.id()),
        }
    }
}

async fn next_tail_line(lines: Option<&mut mpsc::Receiver<String>>) -> Option<String> {
    match lines {
        Some(lines) => lines.recv().await,
        None => std::future::pending().await,
    }
}

async fn grace_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
