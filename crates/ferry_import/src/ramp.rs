//! Tick-driven dispatch with a rate that ramps from a floor to a ceiling.
//!
//! At tick `t` the controller launches up to
//! `floor(min_rps + (max_rps - min_rps) * t / ramp_period)` items, capped at
//! `max_rps` once the ramp period has elapsed. Each item runs on its own task;
//! a semaphore bounds how many are in flight.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use ferry_core::{FerryError, FerryResult};

/// A unit of work owned by the controller once dispatched. Failures are the
/// item's own business; the controller only counts completions.
pub type WorkItem = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RampConfig {
    pub min_rps: u32,
    pub max_rps: u32,
    /// Ticks over which the rate grows; zero starts at `max_rps`.
    pub ramp_period: u32,
    pub tick: Duration,
    pub max_in_flight: usize,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            min_rps: 1,
            max_rps: 10,
            ramp_period: 0,
            tick: Duration::from_secs(1),
            max_in_flight: 4,
        }
    }
}

impl RampConfig {
    pub fn validate(&self) -> FerryResult<()> {
        if self.min_rps == 0 || self.max_rps == 0 {
            return Err(FerryError::validation(
                "request rates must be greater than zero",
            ));
        }
        if self.min_rps > self.max_rps {
            return Err(FerryError::validation(format!(
                "initial rate {} exceeds maximum rate {}",
                self.min_rps, self.max_rps
            )));
        }
        if self.max_in_flight == 0 {
            return Err(FerryError::validation(
                "max parallel requests must be greater than zero",
            ));
        }
        if self.tick.is_zero() {
            return Err(FerryError::validation("tick duration must be positive"));
        }
        Ok(())
    }

    pub fn rate_at(&self, tick: u32) -> f64 {
        if self.ramp_period == 0 || tick >= self.ramp_period {
            return f64::from(self.max_rps);
        }
        let span = f64::from(self.max_rps - self.min_rps);
        let rate = f64::from(self.min_rps) + span * f64::from(tick) / f64::from(self.ramp_period);
        rate.min(f64::from(self.max_rps))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RampStats {
    pub dispatched: usize,
    pub completed: usize,
    pub ticks: u32,
    /// Dispatch stopped early because the token fired.
    pub cancelled: bool,
}

pub struct RampController {
    config: RampConfig,
}

impl RampController {
    pub fn new(config: RampConfig) -> FerryResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RampConfig {
        &self.config
    }

    /// Dispatch every item, or stop early when `cancel` fires.
    ///
    /// Launched items always run to completion before this returns. A
    /// cancelled run reports `Cancelled` even if every item had launched.
    pub async fn run<I>(&self, items: I, cancel: &CancellationToken) -> FerryResult<RampStats>
    where
        I: IntoIterator<Item = WorkItem>,
    {
        let stats = self.drive(items, cancel).await?;
        if stats.cancelled {
            return Err(FerryError::cancelled(format!(
                "run cancelled after dispatching {} items",
                stats.dispatched
            )));
        }
        Ok(stats)
    }

    /// Same as `run`, but a cancelled run hands back its statistics with
    /// `cancelled` set instead of an error.
    pub async fn drive<I>(&self, items: I, cancel: &CancellationToken) -> FerryResult<RampStats>
    where
        I: IntoIterator<Item = WorkItem>,
    {
        let mut items = items.into_iter().peekable();
        let semaphore = Arc::new(Semaphore::new(self.config.max_in_flight));
        let mut workers = JoinSet::new();
        let mut stats = RampStats::default();
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cancelled = false;

        'ticks: while items.peek().is_some() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break 'ticks;
                }
                _ = interval.tick() => {}
            }
            let budget = self.config.rate_at(stats.ticks).floor() as usize;
            stats.ticks += 1;
            log::debug!("ramp: tick {} budget {budget}", stats.ticks);

            for _ in 0..budget {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'ticks;
                }
                if items.peek().is_none() {
                    break 'ticks;
                }
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break 'ticks;
                    }
                    permit = semaphore.clone().acquire_owned() => permit
                        .map_err(|_| FerryError::cancelled("dispatch permits closed"))?,
                };
                let Some(item) = items.next() else {
                    break 'ticks;
                };
                stats.dispatched += 1;
                workers.spawn(async move {
                    item.await;
                    drop(permit);
                });
                while let Some(joined) = workers.try_join_next() {
                    record_join(&mut stats, joined);
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            record_join(&mut stats, joined);
        }
        if cancelled || cancel.is_cancelled() {
            log::warn!(
                "ramp: cancelled after dispatching {} items ({} completed)",
                stats.dispatched,
                stats.completed
            );
            stats.cancelled = true;
            return Ok(stats);
        }
        log::debug!(
            "ramp: finished {} items over {} ticks",
            stats.completed,
            stats.ticks
        );
        Ok(stats)
    }
}

fn record_join(stats: &mut RampStats, joined: Result<(), JoinError>) {
    match joined {
        Ok(()) => stats.completed += 1,
        Err(err) => log::warn!("ramp: worker did not finish: {err}"),
    }
}
