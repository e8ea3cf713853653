//! # Map: the coordinator
//!
//! ## Responsibility
//! Discover Engines, split each Caller batch into tasks, dispatch them to
//! ready Engines, gather the results and reply to the Caller once the whole
//! batch is done.
//!
//! ```text
//!  Caller ──map──► [pending] ──eval──► [running] ──result──► [finished] ──map_result──► Caller
//!                      ▲ LIFO pop          │ one per Engine
//!                      └──── Engine registry (registration order) ◄── engine.json
//! ```
//!
//! ## Guarantees
//! - Sole writer of registry and queues; background I/O never touches them
//! - A task id is in exactly one queue at a time
//! - A batch reply is sent only when `pending` and `running` are both empty,
//!   ordered by task id
//! - `stop` from upstream takes effect at the end of the tick and reaches
//!   every registered Engine before the loop ends
//!
//! ## NOT Responsible For
//! - Detecting dead Engines (a vanished Engine's task stays `running`)
//! - Persisting state across restarts

pub mod mapping;
pub mod queue;
pub mod registry;

pub use mapping::ParamMapping;
pub use queue::{Task, TaskQueues, TaskStatus};
pub use registry::{EngineEntry, EngineRegistry, InFlight};

use crate::config::{DispatchConfig, TransportKind};
use crate::exchange::board::{CommandBoard, DiscoveryBoard};
use crate::exchange::{ChannelFactory, ExchangeChannel};
use crate::protocol::{EngineStatus, Message, RequestId};
use crate::scheduler::{drive, Flow, Throttle, Tickable, Ticker};
use crate::DispatchError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapStatus {
    /// Waiting for a batch.
    Ready,
    /// A batch is open.
    Computing,
    /// `stop` received.
    Stopping,
}

/// The Map's state machine: registry, queues and the open batch.
pub struct Coordinator {
    id: Uuid,
    factory: ChannelFactory,
    upstream: Box<dyn ExchangeChannel>,
    discovery: DiscoveryBoard,
    registry: EngineRegistry,
    queues: TaskQueues,
    mapping: ParamMapping,
    status: MapStatus,
    batch: Option<RequestId>,
    chatter: Throttle,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("engines", &self.registry.len())
            .field("batch", &self.batch)
            .finish()
    }
}

impl Coordinator {
    /// Build a coordinator whose upstream link is `upstream`.
    pub fn new(factory: ChannelFactory, upstream: Box<dyn ExchangeChannel>) -> Self {
        let config = factory.config();
        let discovery = DiscoveryBoard::new(config.engine_dirs());
        let mapping = ParamMapping::from_config(&config.mapping);
        let chatter = Throttle::new(config.exchange.log_every_ticks);
        Self {
            id: Uuid::new_v4(),
            factory,
            upstream,
            discovery,
            registry: EngineRegistry::new(),
            queues: TaskQueues::new(),
            mapping,
            status: MapStatus::Ready,
            batch: None,
            chatter,
        }
    }

    /// Build a coordinator and its upstream channel from `config`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Exchange`] if the upstream channel cannot be opened.
    pub async fn from_config(config: Arc<DispatchConfig>) -> Result<Self, DispatchError> {
        let factory = ChannelFactory::new(config);
        let upstream = factory.map_upstream().await?;
        Ok(Self::new(factory, upstream))
    }

    /// This coordinator's identity (the command board's `id`).
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle status.
    pub fn status(&self) -> MapStatus {
        self.status
    }

    /// Registered Engines.
    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    /// Task queues of the open batch.
    pub fn queues(&self) -> &TaskQueues {
        &self.queues
    }

    /// Correlation token of the open batch.
    pub fn open_batch(&self) -> Option<RequestId> {
        self.batch
    }

    /// Write a fresh command board and drop stale engine files.
    pub fn start(&mut self) -> Result<(), DispatchError> {
        let config = self.factory.config();
        if config.exchange.transport == TransportKind::File {
            CommandBoard::init(&config.command_board_path(), self.id)?;
        }
        self.discovery.clear()?;
        info!(
            map_id = %self.id,
            slots = self.discovery.dirs().len(),
            transport = ?config.exchange.transport,
            "Map started"
        );
        Ok(())
    }

    /// Start, then tick until stopped.
    ///
    /// All channels are closed on every exit path.
    pub async fn run(&mut self, ticker: &mut Ticker) -> Result<(), DispatchError> {
        let outcome = match self.start() {
            Ok(()) => drive(self, ticker).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            error!(map_id = %self.id, error = %e, "Map failed");
            self.release().await;
        }
        outcome
    }

    /// Handle upstream traffic. Returns `Flow::Stop` after a `stop`; anything
    /// queued behind it is ignored.
    fn service_upstream(&mut self) -> Result<Flow, DispatchError> {
        for incoming in self.upstream.poll_incoming()? {
            match incoming.message {
                Message::Map { params_list } => {
                    let request_id = incoming.request_id.ok_or_else(|| {
                        DispatchError::ProtocolViolation("map request without request id".into())
                    })?;
                    if let Some(open) = self.batch {
                        return Err(DispatchError::BatchInProgress { open });
                    }
                    for params in &params_list {
                        self.mapping.name_params(params)?;
                    }
                    info!(request_id = %request_id, batch_size = params_list.len(), "Batch received");
                    self.queues.populate(params_list);
                    self.batch = Some(request_id);
                    self.status = MapStatus::Computing;
                }
                Message::Stop => {
                    info!(map_id = %self.id, engines = self.registry.len(), "Stop received");
                    return Ok(Flow::Stop);
                }
                other => {
                    return Err(DispatchError::ProtocolViolation(format!(
                        "map cannot handle {}",
                        other.action()
                    )))
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Register every newly published Engine.
    async fn discover(&mut self) -> Result<(), DispatchError> {
        for (dir, descriptor) in self.discovery.scan()? {
            if self.registry.contains(descriptor.id) {
                debug!(engine_id = %descriptor.id, "Engine already registered");
                continue;
            }
            if descriptor.status != EngineStatus::Connecting {
                return Err(DispatchError::Registration {
                    engine_id: descriptor.id,
                    status: descriptor.status,
                });
            }
            let mut channel = self
                .factory
                .map_to_engine(descriptor.id, &dir, descriptor.payload.clone())
                .await?;
            let endpoint = channel.local_endpoint();
            channel.send(Message::Connect { endpoint })?;
            info!(engine_id = %descriptor.id, dir = %dir.display(), "Registered engine");
            self.registry.insert(EngineEntry {
                id: descriptor.id,
                status: EngineStatus::Connecting,
                endpoint: descriptor.payload,
                dir,
                submitted: false,
                in_flight: None,
                channel,
            });
        }
        Ok(())
    }

    /// Per Engine: apply status updates, collect a finished task, dispatch
    /// the next one.
    fn service_engines(&mut self) -> Result<(), DispatchError> {
        for entry in self.registry.iter_mut() {
            for incoming in entry.channel.poll_incoming()? {
                match incoming.message {
                    Message::Status { status } => {
                        debug!(engine_id = %entry.id, status = %status, "Engine status");
                        if status == EngineStatus::Ready && entry.in_flight.is_none() {
                            entry.status = EngineStatus::Ready;
                        }
                    }
                    other => {
                        return Err(DispatchError::ProtocolViolation(format!(
                            "engine {} sent {}",
                            entry.id,
                            other.action()
                        )))
                    }
                }
            }

            if let Some(flight) = entry.in_flight {
                if let Some(reply) = entry.channel.check_for_reply(flight.request_id)? {
                    let (task_id, objs) = match reply {
                        Message::EvalResult { task_id, objs } => (task_id, objs),
                        other => {
                            return Err(DispatchError::ProtocolViolation(format!(
                                "engine {} answered eval with {}",
                                entry.id,
                                other.action()
                            )))
                        }
                    };
                    if task_id != flight.task_id {
                        return Err(DispatchError::UnknownTask { task_id });
                    }
                    let objectives = self.mapping.extract_objectives(&objs)?;
                    self.queues.finish(task_id, objectives)?;
                    info!(engine_id = %entry.id, task_id, "Received result");
                    entry.in_flight = None;
                    entry.submitted = false;
                    if !entry.channel.acknowledges_delivery() {
                        entry.channel.send(Message::GetReady)?;
                        entry.status = EngineStatus::Submitted;
                    }
                }
            }

            if entry.can_accept() {
                if let Some(task) = self.queues.start_next() {
                    let params = self.mapping.name_params(&task.params)?;
                    let request_id = entry.channel.request_with_delayed_reply(Message::Eval {
                        task_id: task.id,
                        params,
                    })?;
                    entry.in_flight = Some(InFlight {
                        request_id,
                        task_id: task.id,
                    });
                    entry.submitted = true;
                    info!(engine_id = %entry.id, task_id = task.id, "Sent task");
                }
            }
        }
        Ok(())
    }

    /// Reply to the Caller if the open batch is drained.
    fn complete_batch(&mut self) -> Result<(), DispatchError> {
        if self.status != MapStatus::Computing || !self.queues.is_drained() {
            return Ok(());
        }
        let Some(request_id) = self.batch.take() else {
            return Ok(());
        };
        let objs_list = self.queues.take_finished_sorted();
        info!(request_id = %request_id, batch_size = objs_list.len(), "Batch complete");
        self.upstream
            .reply(request_id, Message::MapResult { objs_list })?;
        self.status = MapStatus::Ready;
        Ok(())
    }

    /// Broadcast `stop` to every Engine, then release every channel.
    async fn shutdown(&mut self) {
        self.status = MapStatus::Stopping;
        for mut entry in self.registry.drain() {
            match entry.channel.send(Message::Stop) {
                Ok(()) => info!(engine_id = %entry.id, "Sent stop"),
                Err(e) => warn!(engine_id = %entry.id, error = %e, "Could not send stop"),
            }
            entry.channel.close().await;
        }
        self.upstream.close().await;
    }

    async fn release(&mut self) {
        for mut entry in self.registry.drain() {
            entry.channel.close().await;
        }
        self.upstream.close().await;
    }
}

#[async_trait]
impl Tickable for Coordinator {
    async fn tick(&mut self) -> Result<Flow, DispatchError> {
        if self.status == MapStatus::Stopping {
            return Ok(Flow::Stop);
        }
        if self.chatter.hit() {
            debug!(
                status = ?self.status,
                engines = self.registry.len(),
                pending = self.queues.pending_len(),
                running = self.queues.running_len(),
                "Checking upstream and engines"
            );
        }
        let flow = self.service_upstream()?;
        self.discover().await?;
        self.service_engines()?;
        self.complete_batch()?;
        if flow == Flow::Stop {
            self.shutdown().await;
        }
        Ok(flow)
    }
}
