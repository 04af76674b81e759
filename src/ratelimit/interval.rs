//! Interval-paced admission.
//!
//! An [`IntervalLimiter`] hands out at most one grant per interval. Callers
//! park in [`IntervalLimiter::wait`] until the next tick, their own
//! cancellation, or a limiter shutdown, whichever comes first.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::{CancelReason, Result, TurnstileError};

/// Paces admission to one grant per fixed interval.
///
/// Waiters queue on the ticker in arrival order; each tick releases exactly one
/// of them. Ticks that elapse while nobody is waiting are skipped rather than
/// banked, so an idle limiter never builds up a burst.
pub struct IntervalLimiter {
    /// Time between grants
    interval: Duration,
    /// Periodic timer, taken out on stop
    ticker: Mutex<Option<Interval>>,
    /// Fires once on stop and stays fired
    shutdown: watch::Sender<bool>,
}

impl IntervalLimiter {
    /// Create a new limiter granting one admission every `interval`.
    ///
    /// The first grant becomes available one interval after construction.
    /// Fails with [`TurnstileError::Config`] outside a tokio runtime.
    pub fn new(interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(TurnstileError::Config(
                "pacing interval must be greater than zero".to_string(),
            ));
        }
        Handle::try_current().map_err(|_| {
            TurnstileError::Config("interval limiter requires a tokio runtime".to_string())
        })?;

        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(interval = ?interval, "Creating interval limiter");

        Ok(Self {
            interval,
            ticker: Mutex::new(Some(ticker)),
            shutdown: watch::Sender::new(false),
        })
    }

    /// Wait for the next grant.
    ///
    /// Races three events with no priority among them:
    /// - the next tick, which admits the caller (`Ok(())`),
    /// - `cancel` resolving, which yields [`TurnstileError::Canceled`] with its reason,
    /// - the limiter being stopped, which yields [`TurnstileError::Shutdown`].
    pub async fn wait<F>(&self, cancel: F) -> Result<()>
    where
        F: Future<Output = CancelReason>,
    {
        tokio::select! {
            ticked = self.next_tick() => {
                if ticked {
                    debug!("Interval limiter: allowed by ticker");
                    Ok(())
                } else {
                    debug!("Interval limiter: ticker already released");
                    Err(TurnstileError::Shutdown)
                }
            }
            reason = cancel => {
                debug!(reason = %reason, "Interval limiter: wait canceled");
                Err(TurnstileError::Canceled(reason))
            }
            _ = stopped(self.shutdown.subscribe()) => {
                debug!("Interval limiter: shutdown signal received");
                self.release_ticker();
                Err(TurnstileError::Shutdown)
            }
        }
    }

    /// Wait for the next grant, giving up after `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        self.wait(async move {
            time::sleep(timeout).await;
            CancelReason::DeadlineExceeded
        })
        .await
    }

    /// Stop the limiter.
    ///
    /// Every pending and future [`wait`](Self::wait) returns
    /// [`TurnstileError::Shutdown`] and the periodic timer is dropped.
    /// Calling this more than once is harmless. Never blocks: if a waiter
    /// holds the ticker, whoever next takes the lock drops the timer.
    pub fn stop(&self) {
        if self.shutdown.send_replace(true) {
            debug!("Interval limiter already stopped");
            return;
        }

        self.release_ticker();
        info!(interval = ?self.interval, "Interval limiter stopped");
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Get the interval between grants.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Drop the timer if nobody holds the ticker lock right now.
    fn release_ticker(&self) {
        if let Ok(mut ticker) = self.ticker.try_lock() {
            ticker.take();
        }
    }

    /// Take the ticker lock and wait for its next tick. `false` once stopped.
    async fn next_tick(&self) -> bool {
        let mut ticker = self.ticker.lock().await;
        if self.is_stopped() {
            ticker.take();
            return false;
        }
        match ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
                true
            }
            None => false,
        }
    }
}

/// Resolves once the shutdown flag is set, immediately if it already is.
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

impl std::fmt::Debug for IntervalLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalLimiter")
            .field("interval", &self.interval)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
