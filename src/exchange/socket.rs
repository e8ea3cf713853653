//! Paired Socket Channel: a bidirectional link between two known endpoints.
//!
//! ## Responsibility
//! Each side binds a listener and, once it knows the peer's endpoint, runs a
//! writer that connects to the peer's listener. Frames are newline-delimited
//! JSON:
//!
//! ```text
//! {"kind":"request","request_id":"…","message":{"command":"eval",…}}
//! {"kind":"notify","message":{"command":"status","status":"ready"}}
//! {"kind":"reply","request_id":"…","message":{"command":"eval_result",…}}
//! ```
//!
//! ## Guarantees
//! - Background tasks only enqueue inbound frames or store replies; they
//!   never touch business state
//! - Inbound queue is bounded; a slow consumer applies backpressure to readers
//! - Either side may start first: the writer retries connecting every
//!   polling interval until shut down
//! - When the peer goes away the writer reconnects and resends the line
//!   whose write failed, so a restarted peer on the same endpoint is picked up
//! - `close` releases the listener and every reader task before returning
//!
//! ## NOT Responsible For
//! - Frames the kernel accepted before noticing the peer was gone
//! - Exactly-once delivery

use super::{validate_incoming, ExchangeChannel, ExchangeError};
use crate::protocol::{CommandManifest, Endpoint, Incoming, Message, RequestId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Capacity of the inbound queue shared by all reader tasks.
const INBOUND_CAPACITY: usize = 256;
/// Capacity of the outbound queue drained by the writer.
const OUTBOUND_CAPACITY: usize = 1024;
/// How long `close` waits for the writer to flush.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Frame {
    Request {
        request_id: RequestId,
        message: Message,
    },
    Notify {
        message: Message,
    },
    Reply {
        request_id: RequestId,
        message: Message,
    },
}

#[derive(Debug)]
enum Inbound {
    Frame(Incoming),
    Violation(String),
}

type ReplyMap = Arc<Mutex<HashMap<RequestId, Message>>>;

/// TCP implementation of [`ExchangeChannel`].
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use tokio_eval_dispatch::exchange::{ExchangeChannel, PairedSocketChannel};
/// use tokio_eval_dispatch::protocol::{engine_commands, Endpoint};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut channel = PairedSocketChannel::bind(
///     "127.0.0.1", 0, "127.0.0.1".to_string(), engine_commands(), Duration::from_millis(100),
/// ).await?;
/// channel.connect_remote(Endpoint::new("127.0.0.1", 47100))?;
/// # Ok(())
/// # }
/// ```
pub struct PairedSocketChannel {
    local: Endpoint,
    exposed: Vec<CommandManifest>,
    inbound: mpsc::Receiver<Inbound>,
    replies: ReplyMap,
    outbound: Option<mpsc::Sender<String>>,
    shutdown: watch::Sender<bool>,
    listener: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    retry_interval: Duration,
    closed: bool,
}

impl std::fmt::Debug for PairedSocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairedSocketChannel")
            .field("local", &self.local)
            .field("connected", &self.outbound.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

impl PairedSocketChannel {
    /// Bind `bind_host:port` (0 for an ephemeral port) and start accepting.
    ///
    /// The endpoint advertised to the peer is `advertise_host` with the bound
    /// port.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::Socket`] if the address cannot be bound.
    pub async fn bind(
        bind_host: &str,
        port: u16,
        advertise_host: String,
        exposed: Vec<CommandManifest>,
        retry_interval: Duration,
    ) -> Result<Self, ExchangeError> {
        let listener = TcpListener::bind((bind_host, port)).await?;
        let bound = listener.local_addr()?;
        let local = Endpoint::new(advertise_host, bound.port());

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let replies: ReplyMap = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(accept_loop(
            listener,
            inbound_tx,
            Arc::clone(&replies),
            shutdown_rx,
        ));
        info!(bound = %bound, advertised = %local, "Socket channel listening");

        Ok(Self {
            local,
            exposed,
            inbound: inbound_rx,
            replies,
            outbound: None,
            shutdown: shutdown_tx,
            listener: Some(handle),
            writer: None,
            retry_interval,
            closed: false,
        })
    }

    fn enqueue(&mut self, frame: &Frame) -> Result<(), ExchangeError> {
        if self.closed {
            return Err(ExchangeError::Closed);
        }
        let outbound = self.outbound.as_ref().ok_or(ExchangeError::NotConnected)?;
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');
        outbound.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ExchangeError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ExchangeError::Closed,
        })
    }
}

#[async_trait]
impl ExchangeChannel for PairedSocketChannel {
    fn send(&mut self, message: Message) -> Result<(), ExchangeError> {
        self.enqueue(&Frame::Notify { message })
    }

    fn poll_incoming(&mut self) -> Result<Vec<Incoming>, ExchangeError> {
        if self.closed {
            return Err(ExchangeError::Closed);
        }
        let mut drained = Vec::new();
        loop {
            match self.inbound.try_recv() {
                Ok(Inbound::Frame(incoming)) => {
                    validate_incoming(&self.exposed, &incoming)?;
                    drained.push(incoming);
                }
                Ok(Inbound::Violation(reason)) => {
                    return Err(ExchangeError::ProtocolViolation(reason));
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }
        Ok(drained)
    }

    fn request_with_delayed_reply(&mut self, message: Message) -> Result<RequestId, ExchangeError> {
        let request_id = RequestId::new();
        self.enqueue(&Frame::Request {
            request_id,
            message,
        })?;
        Ok(request_id)
    }

    fn check_for_reply(&mut self, token: RequestId) -> Result<Option<Message>, ExchangeError> {
        if self.closed {
            return Err(ExchangeError::Closed);
        }
        Ok(self.replies.lock().remove(&token))
    }

    fn reply(&mut self, request_id: RequestId, message: Message) -> Result<(), ExchangeError> {
        self.enqueue(&Frame::Reply {
            request_id,
            message,
        })
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        Some(self.local.clone())
    }

    fn connect_remote(&mut self, remote: Endpoint) -> Result<(), ExchangeError> {
        if self.closed {
            return Err(ExchangeError::Closed);
        }
        if self.outbound.is_some() {
            return Err(ExchangeError::ProtocolViolation(format!(
                "channel {} already paired; refusing {remote}",
                self.local
            )));
        }
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.writer = Some(tokio::spawn(write_loop(
            remote,
            rx,
            self.shutdown.subscribe(),
            self.retry_interval,
        )));
        self.outbound = Some(tx);
        Ok(())
    }

    fn acknowledges_delivery(&self) -> bool {
        true
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Dropping the sender lets the writer drain what is queued and exit.
        self.outbound = None;
        let _ = self.shutdown.send(true);

        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                warn!(local = %self.local, "Writer did not flush in time, aborting");
                writer.abort();
            }
        }
        if let Some(listener) = self.listener.take() {
            listener.abort();
            // The port is free once the aborted task has dropped the listener.
            let _ = listener.await;
        }
        self.inbound.close();
        self.replies.lock().clear();
        debug!(local = %self.local, "Socket channel closed");
    }
}

impl Drop for PairedSocketChannel {
    fn drop(&mut self) {
        // The writer is left to flush queued frames on its own.
        let _ = self.shutdown.send(true);
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound: mpsc::Sender<Inbound>,
    replies: ReplyMap,
    mut shutdown: watch::Receiver<bool>,
) {
    // Dropping the set when this task ends aborts every reader.
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Peer connected");
                    readers.spawn(read_frames(stream, peer, inbound.clone(), Arc::clone(&replies)));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }
}

async fn read_frames(
    stream: TcpStream,
    peer: SocketAddr,
    inbound: mpsc::Sender<Inbound>,
    replies: ReplyMap,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(peer = %peer, "Peer closed connection");
                return;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let item = match serde_json::from_str::<Frame>(&line) {
            Ok(Frame::Reply {
                request_id,
                message,
            }) => {
                replies.lock().insert(request_id, message);
                continue;
            }
            Ok(Frame::Request {
                request_id,
                message,
            }) => Inbound::Frame(Incoming::request(request_id, message)),
            Ok(Frame::Notify { message }) => Inbound::Frame(Incoming::notify(message)),
            Err(e) => Inbound::Violation(format!("undecodable frame from {peer}: {e}")),
        };
        if inbound.send(item).await.is_err() {
            return;
        }
    }
}

async fn write_loop(
    remote: Endpoint,
    mut outbound: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
    retry_interval: Duration,
) {
    // A line whose write failed; it goes out first on the next link.
    let mut pending: Option<String> = None;
    loop {
        let Some(stream) = connect_with_retry(&remote, &mut shutdown, retry_interval).await else {
            return;
        };
        info!(remote = %remote, "Connected to peer");
        let (mut peer_half, mut write_half) = stream.into_split();

        if let Some(line) = pending.take() {
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                warn!(remote = %remote, error = %e, "Resend failed, reconnecting");
                pending = Some(line);
                continue;
            }
        }

        // The peer never writes on this link, so any readable event is a hangup.
        let mut hangup = [0u8; 1];
        loop {
            tokio::select! {
                biased;
                read = peer_half.read(&mut hangup) => match read {
                    Ok(0) | Err(_) => {
                        info!(remote = %remote, "Peer went away, reconnecting");
                        break;
                    }
                    Ok(_) => {}
                },
                next = outbound.recv() => match next {
                    Some(line) => {
                        if let Err(e) = write_half.write_all(line.as_bytes()).await {
                            warn!(remote = %remote, error = %e, "Write failed, reconnecting");
                            pending = Some(line);
                            break;
                        }
                    }
                    None => {
                        let _ = write_half.shutdown().await;
                        return;
                    }
                },
            }
        }
    }
}

/// Connect to `remote`, retrying every `retry_interval`.
///
/// At least one attempt is made; `None` once shut down with the peer unreachable.
async fn connect_with_retry(
    remote: &Endpoint,
    shutdown: &mut watch::Receiver<bool>,
    retry_interval: Duration,
) -> Option<TcpStream> {
    let mut attempts: u64 = 0;
    loop {
        match TcpStream::connect(remote.address()).await {
            Ok(stream) => return Some(stream),
            Err(e) => {
                attempts += 1;
                if attempts % 20 == 1 {
                    debug!(remote = %remote, attempts, error = %e, "Peer not reachable yet");
                }
                if *shutdown.borrow() {
                    warn!(remote = %remote, "Shut down before peer became reachable");
                    return None;
                }
                tokio::select! {
                    _ = tokio::time::sleep(retry_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            warn!(remote = %remote, "Shut down before peer became reachable");
                            return None;
                        }
                    }
                }
            }
        }
    }
}
