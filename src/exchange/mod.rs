//! # Exchange: transport abstraction between dispatch processes
//!
//! ## Responsibility
//! Provide one channel contract, [`ExchangeChannel`], with two
//! interchangeable implementations chosen from configuration:
//!
//! ```text
//!                 ┌─────────────── FileExchange ───────────────┐
//! Caller ◄──────► │ params.json / objs.json                    │ ◄──────► Map
//! Map    ◄──────► │ master.json / <engine_dir>/result.json     │ ◄──────► Engine
//!                 └─────────── PairedSocketChannel ────────────┘
//!                   listener task → inbound queue / reply map
//!                   writer task   ← outbound queue
//! ```
//!
//! ## Guarantees
//! - Non-blocking: every operation returns within one polling interval
//! - Closed vocabulary: unknown commands and reply-mode mismatches surface
//!   as [`ExchangeError::ProtocolViolation`], never silently dropped
//! - Transient absence is not an error: nothing to read is `Ok(vec![])` / `Ok(None)`
//!
//! ## NOT Responsible For
//! - Business state (see: `engine`, `map`, `caller`)
//! - Retrying lost marker files (accepted data-loss window)

pub mod board;
pub mod file;
pub mod socket;

use crate::config::{DispatchConfig, TransportKind};
use crate::protocol::{
    self, CommandManifest, CommandType, Endpoint, Incoming, Message, RequestId,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use file::{FileExchange, FileRole};
pub use socket::PairedSocketChannel;

/// Errors raised by exchange channels.
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// The peer sent something the protocol does not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Reading or writing a marker file failed.
    #[error("io error on {}: {source}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Binding or connecting a socket failed.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// A message could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The channel was closed.
    #[error("channel closed")]
    Closed,

    /// Sending requires a remote endpoint that is not known yet.
    #[error("remote endpoint not connected")]
    NotConnected,

    /// The outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,

    /// The channel cannot carry this message in this direction.
    #[error("unsupported on this channel: {0}")]
    Unsupported(String),
}

/// One end of a link between two dispatch processes.
///
/// `send`, `poll_incoming`, `request_with_delayed_reply` and
/// `check_for_reply` are the four transport operations; `reply` answers a
/// request picked up through `poll_incoming`.
#[async_trait]
pub trait ExchangeChannel: Send {
    /// Deliver a notification (no reply expected).
    fn send(&mut self, message: Message) -> Result<(), ExchangeError>;

    /// Drain every message that arrived since the last call. Never blocks.
    fn poll_incoming(&mut self) -> Result<Vec<Incoming>, ExchangeError>;

    /// Send a request whose reply will be fetched later with `check_for_reply`.
    fn request_with_delayed_reply(&mut self, message: Message) -> Result<RequestId, ExchangeError>;

    /// Take the reply for `token` if it has arrived.
    fn check_for_reply(&mut self, token: RequestId) -> Result<Option<Message>, ExchangeError>;

    /// Answer a request previously returned by `poll_incoming`.
    fn reply(&mut self, request_id: RequestId, message: Message) -> Result<(), ExchangeError>;

    /// Where the peer can reach this end, if the transport has such a thing.
    fn local_endpoint(&self) -> Option<Endpoint> {
        None
    }

    /// Learn the peer's endpoint after the fact (socket transport's `connect`).
    fn connect_remote(&mut self, _remote: Endpoint) -> Result<(), ExchangeError> {
        Ok(())
    }

    /// `true` when delivering a reply frees the responder without an explicit
    /// `get ready` round-trip.
    fn acknowledges_delivery(&self) -> bool;

    /// Flush what can be flushed and release background tasks.
    async fn close(&mut self);
}

/// Check an incoming message against the receiver's manifests.
///
/// # Errors
///
/// [`ExchangeError::ProtocolViolation`] when the action is unknown or the
/// sender's reply expectation disagrees with the manifest.
pub fn validate_incoming(
    manifests: &[CommandManifest],
    incoming: &Incoming,
) -> Result<(), ExchangeError> {
    let action = incoming.message.action();
    let manifest = manifests
        .iter()
        .find(|m| m.action == action)
        .ok_or_else(|| ExchangeError::ProtocolViolation(format!("unknown command: {action}")))?;

    match (manifest.command_type, incoming.request_id) {
        (CommandType::WithDelayedReply, Some(_)) | (CommandType::WithoutReply, None) => Ok(()),
        (CommandType::WithDelayedReply, None) => Err(ExchangeError::ProtocolViolation(format!(
            "{action} expects a delayed reply but carried no request id"
        ))),
        (CommandType::WithoutReply, Some(id)) => Err(ExchangeError::ProtocolViolation(format!(
            "{action} is a notification but carried request id {id}"
        ))),
        (CommandType::WithImmediateReply, _) => Err(ExchangeError::ProtocolViolation(format!(
            "{action}: immediate replies are not served by this channel"
        ))),
    }
}

/// Builds the channel for each link of the topology from configuration.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tokio_eval_dispatch::config::DispatchConfig;
/// use tokio_eval_dispatch::exchange::ChannelFactory;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let factory = ChannelFactory::new(Arc::new(DispatchConfig::default()));
/// let upstream = factory.map_upstream().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ChannelFactory {
    config: Arc<DispatchConfig>,
}

impl ChannelFactory {
    /// Create a factory over a shared config.
    pub fn new(config: Arc<DispatchConfig>) -> Self {
        Self { config }
    }

    /// The config this factory builds from.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Engine's link to the Map. Socket transport binds an ephemeral port.
    pub async fn engine_side(
        &self,
        engine_id: Uuid,
    ) -> Result<Box<dyn ExchangeChannel>, ExchangeError> {
        let config = &self.config;
        match config.exchange.transport {
            TransportKind::File => Ok(Box::new(FileExchange::new(
                FileRole::Engine {
                    engine_id,
                    board: config.command_board_path(),
                    result: board::result_path(&config.engine_dir()),
                },
                protocol::engine_commands(),
            ))),
            TransportKind::Socket => {
                let channel = PairedSocketChannel::bind(
                    &config.exchange.bind_host,
                    0,
                    config.engine.advertise_host.clone(),
                    protocol::engine_commands(),
                    config.polling_interval(),
                )
                .await?;
                Ok(Box::new(channel))
            }
        }
    }

    /// Map's link to one Engine discovered in `engine_dir`.
    ///
    /// Socket transport binds an ephemeral port for the Engine's return leg
    /// and starts connecting to the advertised endpoint.
    pub async fn map_to_engine(
        &self,
        engine_id: Uuid,
        engine_dir: &Path,
        advertised: Option<Endpoint>,
    ) -> Result<Box<dyn ExchangeChannel>, ExchangeError> {
        let config = &self.config;
        match config.exchange.transport {
            TransportKind::File => Ok(Box::new(FileExchange::new(
                FileRole::MapToEngine {
                    engine_id,
                    board: config.command_board_path(),
                    result: board::result_path(engine_dir),
                },
                protocol::engine_notifications(),
            ))),
            TransportKind::Socket => {
                let remote = advertised.ok_or_else(|| {
                    ExchangeError::ProtocolViolation(format!(
                        "engine {engine_id} advertised no endpoint on a socket transport"
                    ))
                })?;
                let mut channel = PairedSocketChannel::bind(
                    &config.exchange.bind_host,
                    0,
                    config.map.host.clone(),
                    protocol::engine_notifications(),
                    config.polling_interval(),
                )
                .await?;
                channel.connect_remote(remote)?;
                Ok(Box::new(channel))
            }
        }
    }

    /// Map's link to its Caller.
    pub async fn map_upstream(&self) -> Result<Box<dyn ExchangeChannel>, ExchangeError> {
        let config = &self.config;
        match config.exchange.transport {
            TransportKind::File => Ok(Box::new(FileExchange::new(
                FileRole::MapUpstream {
                    params: config.params_path(),
                    objs: config.objs_path(),
                },
                protocol::map_commands(),
            ))),
            TransportKind::Socket => {
                let mut channel = PairedSocketChannel::bind(
                    &config.exchange.bind_host,
                    config.map.upstream_port,
                    config.map.host.clone(),
                    protocol::map_commands(),
                    config.polling_interval(),
                )
                .await?;
                channel.connect_remote(Endpoint::new(config.caller.host.clone(), config.caller.port))?;
                Ok(Box::new(channel))
            }
        }
    }

    /// Caller's link to the Map.
    pub async fn caller_side(&self) -> Result<Box<dyn ExchangeChannel>, ExchangeError> {
        let config = &self.config;
        match config.exchange.transport {
            TransportKind::File => Ok(Box::new(FileExchange::new(
                FileRole::Caller {
                    params: config.params_path(),
                    objs: config.objs_path(),
                },
                Vec::new(),
            ))),
            TransportKind::Socket => {
                let mut channel = PairedSocketChannel::bind(
                    &config.exchange.bind_host,
                    config.caller.port,
                    config.caller.host.clone(),
                    Vec::new(),
                    config.polling_interval(),
                )
                .await?;
                channel.connect_remote(Endpoint::new(config.map.host.clone(), config.map.upstream_port))?;
                Ok(Box::new(channel))
            }
        }
    }
}
