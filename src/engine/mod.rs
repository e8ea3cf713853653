//! # Engine: one evaluation slot
//!
//! ## Responsibility
//! Advertise this worker, wait for the Map to pair with it, evaluate one task
//! at a time and hand each result back.
//!
//! ```text
//!  connecting ──connect──► ready ──eval──► busy ──reply──► submitted
//!                            ▲                                  │
//!                            └──────── get ready / delivery ────┘
//!  any state ──stop──► stopping
//! ```
//!
//! ## Guarantees
//! - `connect` is accepted only while `connecting`
//! - `eval` is accepted only while `ready`
//! - Any other command, or an unknown one, ends the Engine with a protocol error
//! - On the socket transport reply delivery returns the Engine to `ready`;
//!   on the file transport it waits for `get ready`
//!
//! ## NOT Responsible For
//! - Choosing tasks (see: `map`)
//! - Timing out a hung evaluator

pub mod evaluator;

use crate::config::DispatchConfig;
use crate::exchange::board::{DiscoveryBoard, DiscoveryDescriptor};
use crate::exchange::{ChannelFactory, ExchangeChannel};
use crate::protocol::{EngineStatus, Incoming, Message};
use crate::scheduler::{drive, Flow, Throttle, Tickable, Ticker};
use crate::DispatchError;
use async_trait::async_trait;
use evaluator::Evaluator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// A worker process's state machine.
pub struct Engine {
    id: Uuid,
    status: EngineStatus,
    channel: Box<dyn ExchangeChannel>,
    evaluator: Arc<dyn Evaluator>,
    dir: PathBuf,
    chatter: Throttle,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("dir", &self.dir)
            .finish()
    }
}

impl Engine {
    /// Assemble an Engine from its parts, in `connecting`.
    pub fn new(
        id: Uuid,
        dir: PathBuf,
        channel: Box<dyn ExchangeChannel>,
        evaluator: Arc<dyn Evaluator>,
        log_every: u64,
    ) -> Self {
        Self {
            id,
            status: EngineStatus::Connecting,
            channel,
            evaluator,
            dir,
            chatter: Throttle::new(log_every),
        }
    }

    /// Build an Engine with a fresh id, the configured evaluator and a
    /// channel from `factory`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Exchange`] if the channel cannot be opened.
    pub async fn from_config(
        config: &DispatchConfig,
        factory: &ChannelFactory,
    ) -> Result<Self, DispatchError> {
        let id = Uuid::new_v4();
        let channel = factory.engine_side(id).await?;
        let evaluator = evaluator::from_config(&config.engine.evaluator);
        Ok(Self::new(
            id,
            config.engine_dir(),
            channel,
            evaluator,
            config.exchange.log_every_ticks,
        ))
    }

    /// This run's identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle status.
    pub fn status(&self) -> EngineStatus {
        self.status
    }

    /// Directory the descriptor is published into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the `connecting` discovery descriptor for the Map to find.
    pub fn publish(&self) -> Result<(), DispatchError> {
        let descriptor = DiscoveryDescriptor::connecting(self.id, self.channel.local_endpoint());
        DiscoveryBoard::publish(&self.dir, &descriptor)?;
        Ok(())
    }

    /// Publish, then tick until stopped.
    ///
    /// The channel is closed on every exit path.
    pub async fn run(&mut self, ticker: &mut Ticker) -> Result<(), DispatchError> {
        info!(engine_id = %self.id, dir = %self.dir.display(), "Starting engine");
        let outcome = match self.publish() {
            Ok(()) => drive(self, ticker).await,
            Err(e) => Err(e),
        };
        self.channel.close().await;
        match &outcome {
            Ok(()) => info!(engine_id = %self.id, "Engine stopped"),
            Err(e) => error!(engine_id = %self.id, error = %e, "Engine failed"),
        }
        outcome
    }

    fn advertise(&mut self, status: EngineStatus) -> Result<(), DispatchError> {
        self.status = status;
        self.channel.send(Message::Status { status })?;
        Ok(())
    }

    async fn handle(&mut self, incoming: Incoming) -> Result<Flow, DispatchError> {
        let action = incoming.message.action();
        match (self.status, incoming.message) {
            (_, Message::Stop) => {
                info!(engine_id = %self.id, "Stop received");
                self.status = EngineStatus::Stopping;
                return Ok(Flow::Stop);
            }
            (EngineStatus::Connecting, Message::Connect { endpoint }) => {
                if let Some(endpoint) = endpoint {
                    info!(engine_id = %self.id, map = %endpoint, "Opening return channel");
                    self.channel.connect_remote(endpoint)?;
                }
                self.advertise(EngineStatus::Ready)?;
                info!(engine_id = %self.id, "Connected, ready");
            }
            (EngineStatus::Ready, Message::Eval { task_id, params }) => {
                let request_id = incoming.request_id.ok_or_else(|| {
                    DispatchError::ProtocolViolation(format!("eval {task_id} without request id"))
                })?;
                self.advertise(EngineStatus::Busy)?;
                info!(engine_id = %self.id, task_id, "Evaluating task");
                let objs = self.evaluator.evaluate(&params).await?;
                debug!(engine_id = %self.id, task_id, features = objs.len(), "Evaluation done");
                self.channel
                    .reply(request_id, Message::EvalResult { task_id, objs })?;
                self.status = if self.channel.acknowledges_delivery() {
                    EngineStatus::Ready
                } else {
                    EngineStatus::Submitted
                };
            }
            (EngineStatus::Submitted | EngineStatus::Ready, Message::GetReady) => {
                self.advertise(EngineStatus::Ready)?;
                debug!(engine_id = %self.id, "Getting ready");
            }
            (status, _) => {
                return Err(DispatchError::ProtocolViolation(format!(
                    "engine {} received {action} while {status}",
                    self.id
                )));
            }
        }
        Ok(Flow::Continue)
    }
}

#[async_trait]
impl Tickable for Engine {
    async fn tick(&mut self) -> Result<Flow, DispatchError> {
        if self.status == EngineStatus::Stopping {
            return Ok(Flow::Stop);
        }
        if self.chatter.hit() {
            debug!(engine_id = %self.id, status = %self.status, "Checking for commands");
        }
        for incoming in self.channel.poll_incoming()? {
            if self.handle(incoming).await? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::evaluator::EchoEvaluator;
    use super::*;
    use crate::exchange::ExchangeError;
    use crate::protocol::{Endpoint, ParamSet, RequestId};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Scripted channel: hands out queued messages, records what was sent.
    #[derive(Default)]
    struct Script {
        inbox: VecDeque<Incoming>,
        sent: Vec<Message>,
        replies: Vec<(RequestId, Message)>,
        connected: Option<Endpoint>,
        closed: bool,
    }

    struct ScriptChannel {
        script: Arc<Mutex<Script>>,
        ack: bool,
    }

    #[async_trait]
    impl ExchangeChannel for ScriptChannel {
        fn send(&mut self, message: Message) -> Result<(), ExchangeError> {
            self.script.lock().sent.push(message);
            Ok(())
        }
        fn poll_incoming(&mut self) -> Result<Vec<Incoming>, ExchangeError> {
            Ok(self.script.lock().inbox.drain(..).collect())
        }
        fn request_with_delayed_reply(&mut self, _: Message) -> Result<RequestId, ExchangeError> {
            Err(ExchangeError::Unsupported("test".to_string()))
        }
        fn check_for_reply(&mut self, _: RequestId) -> Result<Option<Message>, ExchangeError> {
            Ok(None)
        }
        fn reply(&mut self, request_id: RequestId, message: Message) -> Result<(), ExchangeError> {
            self.script.lock().replies.push((request_id, message));
            Ok(())
        }
        fn local_endpoint(&self) -> Option<Endpoint> {
            Some(Endpoint::new("engine", 9000))
        }
        fn connect_remote(&mut self, remote: Endpoint) -> Result<(), ExchangeError> {
            self.script.lock().connected = Some(remote);
            Ok(())
        }
        fn acknowledges_delivery(&self) -> bool {
            self.ack
        }
        async fn close(&mut self) {
            self.script.lock().closed = true;
        }
    }

    fn engine(ack: bool) -> (Engine, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(Script::default()));
        let channel = ScriptChannel {
            script: Arc::clone(&script),
            ack,
        };
        let engine = Engine::new(
            Uuid::new_v4(),
            PathBuf::from("unused"),
            Box::new(channel),
            Arc::new(EchoEvaluator),
            20,
        );
        (engine, script)
    }

    fn push(script: &Arc<Mutex<Script>>, incoming: Incoming) {
        script.lock().inbox.push_back(incoming);
    }

    fn eval(task_id: u64) -> (RequestId, Incoming) {
        let mut params = ParamSet::new();
        params.insert("x0".to_string(), task_id as f64);
        let rid = RequestId::new();
        (rid, Incoming::request(rid, Message::Eval { task_id, params }))
    }

    #[tokio::test]
    async fn test_engine_connect_moves_to_ready() {
        let (mut engine, script) = engine(true);
        push(
            &script,
            Incoming::notify(Message::Connect {
                endpoint: Some(Endpoint::new("map", 4000)),
            }),
        );
        assert_eq!(engine.tick().await.unwrap(), Flow::Continue);
        assert_eq!(engine.status(), EngineStatus::Ready);
        let s = script.lock();
        assert_eq!(s.connected, Some(Endpoint::new("map", 4000)));
        assert_eq!(
            s.sent,
            vec![Message::Status {
                status: EngineStatus::Ready
            }]
        );
    }

    #[tokio::test]
    async fn test_engine_eval_on_socket_returns_to_ready() {
        let (mut engine, script) = engine(true);
        push(&script, Incoming::notify(Message::Connect { endpoint: None }));
        engine.tick().await.unwrap();

        let (rid, incoming) = eval(3);
        push(&script, incoming);
        engine.tick().await.unwrap();

        assert_eq!(engine.status(), EngineStatus::Ready);
        let s = script.lock();
        assert_eq!(s.replies.len(), 1);
        assert_eq!(s.replies[0].0, rid);
        assert!(matches!(s.replies[0].1, Message::EvalResult { task_id: 3, .. }));
    }

    #[tokio::test]
    async fn test_engine_eval_on_files_waits_for_get_ready() {
        let (mut engine, script) = engine(false);
        push(&script, Incoming::notify(Message::Connect { endpoint: None }));
        engine.tick().await.unwrap();
        push(&script, eval(0).1);
        engine.tick().await.unwrap();
        assert_eq!(engine.status(), EngineStatus::Submitted);

        // A second eval before `get ready` is a violation.
        push(&script, eval(1).1);
        assert!(engine.tick().await.is_err());
    }

    #[tokio::test]
    async fn test_engine_get_ready_after_submit() {
        let (mut engine, script) = engine(false);
        push(&script, Incoming::notify(Message::Connect { endpoint: None }));
        engine.tick().await.unwrap();
        push(&script, eval(0).1);
        engine.tick().await.unwrap();
        push(&script, Incoming::notify(Message::GetReady));
        engine.tick().await.unwrap();
        assert_eq!(engine.status(), EngineStatus::Ready);
        assert_eq!(
            script.lock().sent.last(),
            Some(&Message::Status {
                status: EngineStatus::Ready
            })
        );
    }

    #[tokio::test]
    async fn test_engine_connect_twice_is_violation() {
        let (mut engine, script) = engine(true);
        push(&script, Incoming::notify(Message::Connect { endpoint: None }));
        engine.tick().await.unwrap();
        push(&script, Incoming::notify(Message::Connect { endpoint: None }));
        let err = engine.tick().await.unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_engine_eval_while_connecting_is_violation() {
        let (mut engine, script) = engine(true);
        push(&script, eval(0).1);
        assert!(engine.tick().await.unwrap_err().is_protocol_violation());
    }

    #[tokio::test]
    async fn test_engine_stop_from_any_state() {
        let (mut engine, script) = engine(true);
        push(&script, Incoming::notify(Message::Stop));
        push(&script, Incoming::notify(Message::GetReady));
        assert_eq!(engine.tick().await.unwrap(), Flow::Stop);
        assert_eq!(engine.status(), EngineStatus::Stopping);
        assert_eq!(engine.tick().await.unwrap(), Flow::Stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_run_closes_channel_on_stop() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut engine, script) = engine(true);
        engine.dir = dir.path().join("engine_0");
        push(&script, Incoming::notify(Message::Stop));
        let mut ticker = Ticker::new(std::time::Duration::from_millis(100));
        engine.run(&mut ticker).await.unwrap();
        assert!(script.lock().closed);
        assert!(dir.path().join("engine_0").join("engine.json").exists());
    }
}
