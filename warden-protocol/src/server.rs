#[cfg(not(unix))]
compile_error!("warden-protocol server requires a unix target for socket security (peer credentials, file permissions)");

use std::{future::Future, path::PathBuf, sync::Arc};

use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    sync::{Notify, mpsc, watch},
};
use tracing::{debug, error, info, warn};

use crate::{
    errors::ServerError,
    protocol::{
        ErrorKind, MAX_MESSAGE_SIZE, Request, Response, ServerEvent, ServerMessage,
        decode_envelope, encode_server_message,
    },
};

pub type Result<T> = std::result::Result<T, ServerError>;
pub type ShutdownTx = mpsc::Sender<()>;

/// Bounded channel capacity for the per-connection writer task.
const WRITER_CHANNEL_CAPACITY: usize = 256;

/// Credentials of the process on the other end of the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

/// Sender for pushed events from a request handler back to the client.
///
/// Wraps the shared write channel and the request ID so handlers can
/// stream events without knowing about framing.
#[derive(Clone)]
pub struct EventSender {
    write_tx: mpsc::Sender<Vec<u8>>,
    request_id: u64,
}

impl EventSender {
    pub fn new(write_tx: mpsc::Sender<Vec<u8>>, request_id: u64) -> Self {
        Self { write_tx, request_id }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Queue an event for the client.
    ///
    /// Waits while the connection's writer queue is full. Returns `false`
    /// once the connection is gone.
    pub async fn send(&self, event: ServerEvent) -> bool {
        let msg = ServerMessage::Event { event };
        match encode_server_message(&msg) {
            Ok(bytes) => self.write_tx.send(bytes).await.is_ok(),
            Err(e) => {
                error!("Failed to encode event for request {}: {}", self.request_id, e);
                true
            }
        }
    }
}

/// Cancellation handle for one long-lived stream on a connection.
///
/// Registered under the request id that opened the stream so that a later
/// `Unsubscribe { request_id }` on the same connection can end it.
/// Dropping the guard unregisters it.
pub struct StreamGuard {
    request_id: u64,
    notify: Arc<Notify>,
    streams: Arc<DashMap<u64, Arc<Notify>>>,
}

impl StreamGuard {
    /// Resolves once the stream has been cancelled.
    pub async fn cancelled(&self) {
        self.notify.notified().await
    }

    /// Whether an `Unsubscribe` has already arrived for this stream.
    pub fn is_cancelled(&self) -> bool {
        !self
            .streams
            .get(&self.request_id)
            .is_some_and(|notify| Arc::ptr_eq(notify.value(), &self.notify))
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.streams.remove(&self.request_id);
    }
}

/// Everything a handler knows about the request it is serving.
pub struct RequestContext {
    request_id: u64,
    peer: PeerInfo,
    events: EventSender,
    shutdown_tx: ShutdownTx,
    closed: watch::Receiver<bool>,
    streams: Arc<DashMap<u64, Arc<Notify>>>,
}

impl RequestContext {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn peer(&self) -> PeerInfo {
        self.peer
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    pub fn shutdown_tx(&self) -> &ShutdownTx {
        &self.shutdown_tx
    }

    /// Resolves once the client connection has closed (EOF, read error or
    /// a failed write).
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|c| *c).await;
    }

    /// Register this request as a cancellable stream.
    pub fn open_stream(&self) -> StreamGuard {
        let notify = Arc::new(Notify::new());
        self.streams.insert(self.request_id, Arc::clone(&notify));
        StreamGuard {
            request_id: self.request_id,
            notify,
            streams: Arc::clone(&self.streams),
        }
    }

    /// Cancel a stream opened on this connection. Returns `false` if no such
    /// stream is open (never opened, already ended, or already cancelled).
    pub fn cancel_stream(&self, request_id: u64) -> bool {
        match self.streams.remove(&request_id) {
            Some((_, notify)) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }
}

pub struct Server<F, Fut>
where
    F: Fn(Request, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send,
{
    socket_path: PathBuf,
    socket_mode: u32,
    handler: Arc<F>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl<F, Fut> Server<F, Fut>
where
    F: Fn(Request, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    pub fn new(socket_path: PathBuf, handler: F) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Self {
            socket_path,
            socket_mode: 0o660,
            handler: Arc::new(handler),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Override the socket file mode (default 0o660).
    pub fn with_socket_mode(mut self, mode: u32) -> Self {
        self.socket_mode = mode;
        self
    }

    /// A sender that stops the accept loop when signalled.
    pub fn shutdown_handle(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        // Reject symlinked socket path before any operations
        if self.socket_path.exists() {
            let meta = std::fs::symlink_metadata(&self.socket_path).map_err(|e| {
                ServerError::StaleSocket {
                    socket_path: self.socket_path.clone(),
                    source: e,
                }
            })?;
            if meta.file_type().is_symlink() {
                return Err(ServerError::SocketSymlink {
                    socket_path: self.socket_path.clone(),
                });
            }
        }

        // Remove stale socket file
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ServerError::StaleSocket {
                    socket_path: self.socket_path.clone(),
                    source: e,
                });
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| ServerError::Bind {
            socket_path: self.socket_path.clone(),
            source: e,
        })?;

        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                &self.socket_path,
                std::fs::Permissions::from_mode(self.socket_mode),
            )
            .map_err(|e| ServerError::SocketPermissions {
                socket_path: self.socket_path.clone(),
                source: e,
            })?;
        }

        info!("Listening on {}", self.socket_path.display());

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let shutdown_tx = self.shutdown_tx.clone();
                            let handler = Arc::clone(&self.handler);

                            tokio::spawn(async move {
                                if let Err(e) = handle_client(handler, stream, shutdown_tx).await {
                                    debug!("Client handler error: {}", e);
                                }
                            });
                        },
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        },
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Server shutdown");
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

async fn handle_client<F, Fut>(
    handler: Arc<F>,
    stream: UnixStream,
    shutdown_tx: mpsc::Sender<()>,
) -> Result<()>
where
    F: Fn(Request, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    let cred = stream.peer_cred().map_err(ServerError::PeerCredentials)?;
    let peer = PeerInfo {
        uid: cred.uid(),
        gid: cred.gid(),
        pid: cred.pid(),
    };
    debug!("Client connected: uid={} pid={:?}", peer.uid, peer.pid);

    let (read_half, mut write_half) = stream.into_split();

    let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
    let (closed_tx, closed_rx) = watch::channel(false);
    let closed_tx = Arc::new(closed_tx);
    let streams: Arc<DashMap<u64, Arc<Notify>>> = Arc::new(DashMap::new());

    // Writer task: receives encoded bytes and writes to stream
    let writer_closed = Arc::clone(&closed_tx);
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = write_rx.recv().await {
            if let Err(e) = write_half.write_all(&bytes).await {
                warn!("Failed to write to client: {}", e);
                writer_closed.send_replace(true);
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut reader = read_half;

    let result = loop {
        // Read 4-byte length header
        let mut len_buf = [0u8; 4];
        if let Err(e) = reader.read_exact(&mut len_buf).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                debug!("Client disconnected (EOF)");
                break Ok(());
            }
            break Err(ServerError::Receive(e));
        }
        let msg_len = u32::from_be_bytes(len_buf) as usize;

        if msg_len > MAX_MESSAGE_SIZE {
            debug!("Request exceeds maximum message size: {} bytes", msg_len);
            let msg = ServerMessage::Response {
                id: 0,
                response: Response::error(
                    ErrorKind::BadRequest,
                    format!("Request exceeds maximum message size of {} bytes", MAX_MESSAGE_SIZE),
                ),
            };
            if let Ok(bytes) = encode_server_message(&msg) {
                let _ = write_tx.send(bytes).await;
            }
            break Err(ServerError::MessageTooLarge);
        }

        let mut payload = vec![0u8; msg_len];
        if let Err(e) = reader.read_exact(&mut payload).await {
            break Err(ServerError::Receive(e));
        }

        let envelope = match decode_envelope(&payload) {
            Ok(env) => env,
            Err(e) => {
                warn!("Failed to parse request envelope: {}", e);
                // We don't know the ID, use 0
                let msg = ServerMessage::Response {
                    id: 0,
                    response: Response::error(ErrorKind::BadRequest, "Invalid request format"),
                };
                if let Ok(bytes) = encode_server_message(&msg) {
                    let _ = write_tx.send(bytes).await;
                }
                continue;
            }
        };

        let request_id = envelope.id;
        let request = envelope.request;
        debug!("Received request id={}: {:?}", request_id, request);

        let ctx = RequestContext {
            request_id,
            peer,
            events: EventSender::new(write_tx.clone(), request_id),
            shutdown_tx: shutdown_tx.clone(),
            closed: closed_rx.clone(),
            streams: Arc::clone(&streams),
        };
        let handler = Arc::clone(&handler);
        let write_tx = write_tx.clone();
        tokio::spawn(async move {
            let response = handler(request, ctx).await;
            let msg = ServerMessage::Response {
                id: request_id,
                response,
            };
            match encode_server_message(&msg) {
                Ok(bytes) => {
                    if let Err(e) = write_tx.send(bytes).await {
                        debug!("Failed to send response for request {}: {}", request_id, e);
                    }
                }
                Err(e) => {
                    error!("Failed to encode response for request {}: {}", request_id, e);
                }
            }
        });
    };

    // Wake every streaming handler on this connection so it can release its
    // subscriptions, then let the writer drain.
    closed_tx.send_replace(true);
    drop(write_tx);
    let _ = writer_task.await;
    result
}
