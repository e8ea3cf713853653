//! # Scheduler: the tick abstraction every control loop runs on
//!
//! ## Responsibility
//! Replace "loop forever, sleep" with an explicit tick: a [`Ticker`] paces a
//! [`Tickable`] state machine, and [`drive`] runs it until it reports
//! [`Flow::Stop`] or fails. [`Throttle`] keeps per-tick chatter down to one
//! log line every N ticks.
//!
//! ## Guarantees
//! - One tick of work per polling interval; missed ticks are delayed, not bunched
//! - Cooperative cancellation: a machine stops only between ticks
//! - Tests can call `tick()` directly to fast-forward without sleeping
//!
//! ## NOT Responsible For
//! - Timeouts on individual evaluations (a hung evaluator stalls its Engine)

use crate::DispatchError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

/// Whether a state machine wants another tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep ticking.
    Continue,
    /// Leave the loop.
    Stop,
}

/// A state machine advanced one step per tick.
#[async_trait]
pub trait Tickable: Send {
    /// Do one tick's worth of work.
    async fn tick(&mut self) -> Result<Flow, DispatchError>;
}

/// Fixed-period pacing.
#[derive(Debug)]
pub struct Ticker {
    interval: Interval,
    count: u64,
}

impl Ticker {
    /// Tick every `period`.
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, count: 0 }
    }

    /// Wait for the next tick. The first tick completes immediately.
    pub async fn tick(&mut self) {
        self.interval.tick().await;
        self.count += 1;
    }

    /// Ticks completed so far.
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Lets one call in every `every` through.
#[derive(Debug, Clone)]
pub struct Throttle {
    every: u64,
    count: u64,
}

impl Throttle {
    /// Pass the first call and every `every`-th after it (0 is treated as 1).
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            count: 0,
        }
    }

    /// Count one call; `true` if this one should log.
    pub fn hit(&mut self) -> bool {
        let pass = self.count % self.every == 0;
        self.count += 1;
        pass
    }
}

/// Run `machine` on `ticker` until it stops or errors.
///
/// # Errors
///
/// Whatever the machine's `tick` returns.
pub async fn drive<T: Tickable + ?Sized>(
    machine: &mut T,
    ticker: &mut Ticker,
) -> Result<(), DispatchError> {
    loop {
        ticker.tick().await;
        if machine.tick().await? == Flow::Stop {
            tracing::debug!(ticks = ticker.count(), "Control loop finished");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Countdown(u32);

    #[async_trait]
    impl Tickable for Countdown {
        async fn tick(&mut self) -> Result<Flow, DispatchError> {
            if self.0 == 0 {
                return Ok(Flow::Stop);
            }
            self.0 -= 1;
            Ok(Flow::Continue)
        }
    }

    struct Failing;

    #[async_trait]
    impl Tickable for Failing {
        async fn tick(&mut self) -> Result<Flow, DispatchError> {
            Err(DispatchError::Other("boom".to_string()))
        }
    }

    #[test]
    fn test_throttle_passes_every_n_calls() {
        let mut throttle = Throttle::new(20);
        let logged: Vec<u32> = (1..=41).filter(|_| throttle.hit()).collect();
        assert_eq!(logged, vec![1, 21, 41]);
    }

    #[test]
    fn test_throttle_zero_passes_everything() {
        let mut throttle = Throttle::new(0);
        assert!((0..5).all(|_| throttle.hit()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_runs_until_stop() {
        let mut machine = Countdown(5);
        let mut ticker = Ticker::new(Duration::from_millis(100));
        drive(&mut machine, &mut ticker).await.unwrap();
        assert_eq!(ticker.count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_propagates_errors() {
        let mut ticker = Ticker::new(Duration::from_millis(100));
        let result = drive(&mut Failing, &mut ticker).await;
        assert!(matches!(result, Err(DispatchError::Other(_))));
        assert_eq!(ticker.count(), 1);
    }

    struct Backlogged;

    #[async_trait]
    impl Tickable for Backlogged {
        async fn tick(&mut self) -> Result<Flow, DispatchError> {
            Err(crate::exchange::ExchangeError::QueueFull.into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_ends_on_transport_backpressure() {
        let mut ticker = Ticker::new(Duration::from_millis(100));
        let result = drive(&mut Backlogged, &mut ticker).await;
        assert!(matches!(
            result,
            Err(DispatchError::Exchange(crate::exchange::ExchangeError::QueueFull))
        ));
        assert_eq!(ticker.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_paces_at_period() {
        let mut ticker = Ticker::new(Duration::from_millis(100));
        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            ticker.tick().await;
        }
        assert_eq!(start.elapsed(), Duration::from_millis(200));
        assert_eq!(ticker.count(), 3);
    }
}
