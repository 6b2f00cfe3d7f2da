use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    errors::ClientError,
    protocol::{
        MAX_MESSAGE_SIZE, Request, RequestEnvelope, Response, ServerEvent, ServerMessage,
        decode_server_message, encode_envelope,
    },
};

pub type Result<T> = std::result::Result<T, ClientError>;

/// Bounded channel capacity for the client writer task.
const WRITER_CHANNEL_CAPACITY: usize = 64;

struct PendingRequest {
    response_tx: oneshot::Sender<Response>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
}

/// A request in flight: pushed events plus the eventual response.
pub type PendingCall = (
    mpsc::UnboundedReceiver<ServerEvent>,
    std::pin::Pin<Box<dyn Future<Output = Result<Response>> + Send>>,
);

pub struct Client {
    writer_tx: mpsc::Sender<Vec<u8>>,
    pending: Arc<DashMap<u64, PendingRequest>>,
    next_id: Arc<AtomicU64>,
    reader_handle: JoinHandle<()>,
    _writer_handle: JoinHandle<()>,
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

impl Client {
    /// Connect to the daemon at the given socket path
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(ClientError::Connect)?;

        let (read_half, mut write_half) = stream.into_split();

        let pending: Arc<DashMap<u64, PendingRequest>> = Arc::new(DashMap::new());

        // Writer task: receives encoded bytes and writes to stream
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);

        let writer_handle = tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    debug!("Client writer error: {}", e);
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        // Reader task: reads length-prefixed frames, dispatches to pending map
        let reader_pending = pending.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = read_half;

            loop {
                let mut len_buf = [0u8; 4];
                if let Err(e) = reader.read_exact(&mut len_buf).await {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        debug!("Server disconnected (EOF)");
                    } else {
                        debug!("Client reader error: {}", e);
                    }
                    // Drop all pending senders so waiters get RecvError → Disconnected
                    reader_pending.clear();
                    return;
                }
                let msg_len = u32::from_be_bytes(len_buf) as usize;

                if msg_len > MAX_MESSAGE_SIZE {
                    debug!("Server message exceeds maximum size");
                    reader_pending.clear();
                    return;
                }

                let mut payload = vec![0u8; msg_len];
                if let Err(e) = reader.read_exact(&mut payload).await {
                    debug!("Client reader error: {}", e);
                    reader_pending.clear();
                    return;
                }

                match decode_server_message(&payload) {
                    Ok(ServerMessage::Response { id, response }) => {
                        if let Some((_, pending_req)) = reader_pending.remove(&id) {
                            let _ = pending_req.response_tx.send(response);
                        } else {
                            debug!("Received response for unknown request id={}", id);
                        }
                    }
                    Ok(ServerMessage::Event { event }) => {
                        let request_id = event.request_id();
                        if let Some(pending_req) = reader_pending.get(&request_id) {
                            let _ = pending_req.event_tx.send(event);
                        }
                    }
                    Err(e) => {
                        debug!("Failed to decode server message: {}", e);
                    }
                }
            }
        });

        Ok(Self {
            writer_tx,
            pending,
            next_id: Arc::new(AtomicU64::new(1)),
            reader_handle,
            _writer_handle: writer_handle,
        })
    }

    /// Check if daemon is running by attempting to connect and ping
    pub async fn is_daemon_running(socket_path: &Path) -> bool {
        if !socket_path.exists() {
            return false;
        }

        match Self::connect(socket_path).await {
            Ok(client) => matches!(client.call(Request::Ping).await, Ok(Response::Ok { .. })),
            Err(_) => false,
        }
    }

    /// Send a request and receive both server events and a response.
    /// Takes `&self` - multiple requests can be in-flight concurrently.
    ///
    /// Returns the request id (needed to `unsubscribe` a stream), an event
    /// receiver and a future that resolves to the final response.
    pub fn send_request(&self, request: Request) -> Result<(u64, PendingCall)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (response_tx, response_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let envelope = RequestEnvelope { id, request };
        let bytes = encode_envelope(&envelope)?;

        self.pending.insert(id, PendingRequest { response_tx, event_tx });

        let writer_tx = self.writer_tx.clone();
        let response_future = async move {
            writer_tx
                .send(bytes)
                .await
                .map_err(|_| ClientError::Disconnected)?;
            response_rx.await.map_err(|_| ClientError::Disconnected)
        };

        Ok((id, (event_rx, Box::pin(response_future))))
    }

    /// Send a request and wait for its response, ignoring pushed events.
    pub async fn call(&self, request: Request) -> Result<Response> {
        let (_, (_events, response)) = self.send_request(request)?;
        response.await
    }

    pub async fn ping(&self) -> Result<Response> {
        self.call(Request::Ping).await
    }

    /// Shutdown the daemon
    pub async fn shutdown(&self) -> Result<Response> {
        self.call(Request::Shutdown).await
    }

    pub async fn create_user(
        &self,
        name: Option<String>,
        steam_id64: Option<String>,
        discord_id: Option<String>,
        roles: Vec<String>,
    ) -> Result<Response> {
        self.call(Request::CreateUser { name, steam_id64, discord_id, roles }).await
    }

    pub async fn issue_session(&self, user_id: u64) -> Result<Response> {
        self.call(Request::IssueSession { user_id }).await
    }

    pub async fn validate_session(&self, token: &str) -> Result<Response> {
        self.call(Request::ValidateSession { token: token.to_string() }).await
    }

    pub async fn logout(&self, token: &str) -> Result<Response> {
        self.call(Request::Logout { token: token.to_string() }).await
    }

    pub async fn assign_role(&self, token: &str, user_id: u64, role: &str) -> Result<Response> {
        self.call(Request::AssignRole {
            token: token.to_string(),
            user_id,
            role: role.to_string(),
        })
        .await
    }

    pub async fn remove_role(&self, token: &str, user_id: u64, role: &str) -> Result<Response> {
        self.call(Request::RemoveRole {
            token: token.to_string(),
            user_id,
            role: role.to_string(),
        })
        .await
    }

    pub async fn list_services(&self, token: &str) -> Result<Response> {
        self.call(Request::ListServices { token: token.to_string() }).await
    }

    pub async fn hub_status(&self, token: &str) -> Result<Response> {
        self.call(Request::HubStatus { token: token.to_string() }).await
    }

    pub async fn restart_service(&self, token: &str, service: &str) -> Result<Response> {
        self.call(Request::RestartService {
            token: token.to_string(),
            service: service.to_string(),
        })
        .await
    }

    /// Open a log stream. The returned id can be passed to `unsubscribe`.
    pub fn subscribe_logs(&self, token: &str, service: &str) -> Result<(u64, PendingCall)> {
        self.send_request(Request::SubscribeLogs {
            token: token.to_string(),
            service: service.to_string(),
        })
    }

    /// End a log stream opened on this connection.
    pub async fn unsubscribe(&self, request_id: u64) -> Result<Response> {
        self.call(Request::Unsubscribe { request_id }).await
    }

    /// Fire-and-forget revocation feed: sends the request eagerly and returns
    /// only the event receiver. The receiver yields `None` once the
    /// connection is lost.
    pub async fn watch_revocations(&self) -> Result<mpsc::UnboundedReceiver<ServerEvent>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (response_tx, _response_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let envelope = RequestEnvelope {
            id,
            request: Request::WatchRevocations,
        };
        let bytes = encode_envelope(&envelope)?;

        self.pending.insert(id, PendingRequest { response_tx, event_tx });

        self.writer_tx
            .send(bytes)
            .await
            .map_err(|_| ClientError::Disconnected)?;

        Ok(event_rx)
    }
}

#[cfg(test)]
mod tests;
