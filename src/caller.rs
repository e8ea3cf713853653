//! # Caller: the optimizer-facing batch evaluation interface
//!
//! ## Responsibility
//! Turn "evaluate these N parameter vectors" into one delayed-reply `map`
//! request to the Map and wait, one polling interval at a time, for the
//! matching `map_result`.
//!
//! ## Guarantees
//! - Output length and order match the input
//! - Waiting yields to the runtime between polls; the driver's own tasks keep running
//! - A `stop` is sent to the Map on `close` and, best effort, on drop
//!
//! ## NOT Responsible For
//! - Producing candidate vectors (the optimization driver does that)

use crate::config::DispatchConfig;
use crate::exchange::{ChannelFactory, ExchangeChannel, ExchangeError};
use crate::protocol::Message;
use crate::scheduler::{Throttle, Ticker};
use crate::DispatchError;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Client side of the Caller ↔ Map link.
///
/// # Usage
///
/// ```rust,no_run
/// use tokio_eval_dispatch::caller::CallerAdapter;
/// use tokio_eval_dispatch::config::DispatchConfig;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut caller = CallerAdapter::from_config(DispatchConfig::default()).await?;
/// let objs = caller.evaluate(vec![vec![0.1, 0.03], vec![0.12, 0.05]]).await?;
/// assert_eq!(objs.len(), 2);
/// caller.close().await;
/// # Ok(())
/// # }
/// ```
pub struct CallerAdapter {
    channel: Box<dyn ExchangeChannel>,
    polling_interval: Duration,
    log_every: u64,
    stopped: bool,
}

impl std::fmt::Debug for CallerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerAdapter")
            .field("polling_interval", &self.polling_interval)
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl CallerAdapter {
    /// Wrap an already opened channel.
    pub fn new(channel: Box<dyn ExchangeChannel>, polling_interval: Duration, log_every: u64) -> Self {
        Self {
            channel,
            polling_interval,
            log_every,
            stopped: false,
        }
    }

    /// Open the Caller side of the configured transport.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Exchange`] if the channel cannot be opened.
    pub async fn from_config(config: DispatchConfig) -> Result<Self, DispatchError> {
        let polling_interval = config.polling_interval();
        let log_every = config.exchange.log_every_ticks;
        let channel = ChannelFactory::new(Arc::new(config)).caller_side().await?;
        Ok(Self::new(channel, polling_interval, log_every))
    }

    /// Evaluate a batch and return one objective vector per input vector.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::ResultLength`] if the reply has the wrong length
    /// - [`DispatchError::ProtocolViolation`] if the reply is not a `map_result`
    /// - [`DispatchError::Exchange`] on transport failure, or after `close`
    pub async fn evaluate(&mut self, params_sets: Vec<Vec<f64>>) -> Result<Vec<Vec<f64>>, DispatchError> {
        if self.stopped {
            return Err(ExchangeError::Closed.into());
        }
        let expected = params_sets.len();
        let token = self.channel.request_with_delayed_reply(Message::Map {
            params_list: params_sets,
        })?;
        info!(request_id = %token, batch_size = expected, "Batch submitted");

        let mut ticker = Ticker::new(self.polling_interval);
        let mut chatter = Throttle::new(self.log_every);
        loop {
            ticker.tick().await;
            match self.channel.check_for_reply(token)? {
                Some(Message::MapResult { objs_list }) => {
                    if objs_list.len() != expected {
                        return Err(DispatchError::ResultLength {
                            expected,
                            actual: objs_list.len(),
                        });
                    }
                    info!(request_id = %token, polls = ticker.count(), "Objectives received");
                    return Ok(objs_list);
                }
                Some(other) => {
                    return Err(DispatchError::ProtocolViolation(format!(
                        "map answered with {}",
                        other.action()
                    )))
                }
                None => {
                    if chatter.hit() {
                        debug!(request_id = %token, "Waiting for objectives");
                    }
                }
            }
        }
    }

    /// The `map(identifier, params_list)` callable handed to the optimizer.
    ///
    /// The identifier is only logged.
    pub async fn map_function(
        &mut self,
        identifier: impl Display,
        params_list: Vec<Vec<f64>>,
    ) -> Result<Vec<Vec<f64>>, DispatchError> {
        debug!(identifier = %identifier, "map_function called");
        self.evaluate(params_list).await
    }

    /// Send `stop` to the Map and release the channel.
    pub async fn close(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Err(e) = self.channel.send(Message::Stop) {
            warn!(error = %e, "Could not send stop to map");
        }
        self.channel.close().await;
        info!("Caller closed");
    }

    /// Release the channel without stopping the Map.
    pub async fn release(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.channel.close().await;
        debug!("Caller released, map left running");
    }
}

impl Drop for CallerAdapter {
    fn drop(&mut self) {
        if !self.stopped {
            if let Err(e) = self.channel.send(Message::Stop) {
                warn!(error = %e, "Could not send stop to map on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Incoming, RequestId};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorded {
        sent: Vec<Message>,
        requests: Vec<Message>,
        polls: u32,
        closed: bool,
    }

    /// Answers the first request with `answer` after `delay_polls` polls.
    struct FakeMap {
        state: Arc<Mutex<Recorded>>,
        answer: Option<Message>,
        delay_polls: u32,
    }

    #[async_trait]
    impl ExchangeChannel for FakeMap {
        fn send(&mut self, message: Message) -> Result<(), ExchangeError> {
            self.state.lock().sent.push(message);
            Ok(())
        }
        fn poll_incoming(&mut self) -> Result<Vec<Incoming>, ExchangeError> {
            Ok(Vec::new())
        }
        fn request_with_delayed_reply(&mut self, message: Message) -> Result<RequestId, ExchangeError> {
            self.state.lock().requests.push(message);
            Ok(RequestId::new())
        }
        fn check_for_reply(&mut self, _: RequestId) -> Result<Option<Message>, ExchangeError> {
            let mut state = self.state.lock();
            state.polls += 1;
            if state.polls > self.delay_polls {
                Ok(self.answer.take())
            } else {
                Ok(None)
            }
        }
        fn reply(&mut self, _: RequestId, _: Message) -> Result<(), ExchangeError> {
            Ok(())
        }
        fn acknowledges_delivery(&self) -> bool {
            true
        }
        async fn close(&mut self) {
            self.state.lock().closed = true;
        }
    }

    fn caller(answer: Message, delay_polls: u32) -> (CallerAdapter, Arc<Mutex<Recorded>>) {
        let state = Arc::new(Mutex::new(Recorded::default()));
        let channel = FakeMap {
            state: Arc::clone(&state),
            answer: Some(answer),
            delay_polls,
        };
        (
            CallerAdapter::new(Box::new(channel), Duration::from_millis(100), 20),
            state,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_evaluate_polls_until_reply() {
        let (mut caller, state) = caller(
            Message::MapResult {
                objs_list: vec![vec![1.0], vec![2.0]],
            },
            3,
        );
        let objs = caller.evaluate(vec![vec![0.1], vec![0.2]]).await.unwrap();
        assert_eq!(objs, vec![vec![1.0], vec![2.0]]);
        assert_eq!(state.lock().polls, 4);
        assert_eq!(
            state.lock().requests,
            vec![Message::Map {
                params_list: vec![vec![0.1], vec![0.2]]
            }]
        );
        caller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_evaluate_wrong_length_is_error() {
        let (mut caller, _state) = caller(Message::MapResult { objs_list: vec![] }, 0);
        let err = caller.evaluate(vec![vec![0.1]]).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ResultLength {
                expected: 1,
                actual: 0
            }
        ));
        caller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_map_function_delegates_to_evaluate() {
        let (mut caller, _state) = caller(
            Message::MapResult {
                objs_list: vec![vec![5.0]],
            },
            0,
        );
        let objs = caller.map_function("generation-0", vec![vec![1.0]]).await.unwrap();
        assert_eq!(objs, vec![vec![5.0]]);
        caller.close().await;
    }

    #[tokio::test]
    async fn test_close_sends_stop_once() {
        let (mut caller, state) = caller(Message::Stop, 0);
        caller.close().await;
        caller.close().await;
        drop(caller);
        let state = state.lock();
        assert_eq!(state.sent, vec![Message::Stop]);
        assert!(state.closed);
    }

    #[tokio::test]
    async fn test_drop_sends_stop() {
        let (caller, state) = caller(Message::Stop, 0);
        drop(caller);
        assert_eq!(state.lock().sent, vec![Message::Stop]);
    }

    #[tokio::test]
    async fn test_release_does_not_stop_map() {
        let (mut caller, state) = caller(Message::Stop, 0);
        caller.release().await;
        drop(caller);
        let state = state.lock();
        assert!(state.sent.is_empty());
        assert!(state.closed);
    }

    #[tokio::test]
    async fn test_evaluate_after_close_is_error() {
        let (mut caller, _state) = caller(Message::Stop, 0);
        caller.close().await;
        assert!(caller.evaluate(vec![vec![1.0]]).await.is_err());
    }
}
