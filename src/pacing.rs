//! Waiting and stopping.
//!
//! The driver never sleeps or reads the clock directly so tests can run the
//! whole measurement loop without real timers.

use async_trait::async_trait;
use std::time::{Duration, Instant};

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Cooperative stop signal, consulted only between attempts.
pub trait Cancellation: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

/// Cancels once a point in time has passed.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    pub fn after(budget: Duration) -> Self {
        Self::at(Instant::now() + budget)
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

impl Cancellation for Deadline {
    fn is_cancelled(&self) -> bool {
        Instant::now() >= self.at
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancel;

impl Cancellation for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}
