//! Forces cold starts on the function under test and samples them.
//!
//! Each attempt walks the function through
//! `Mutating -> (ConflictBackoff ->) Polling -> Ready`, invokes it once
//! expecting a cold start and then chains the warm invocations. An attempt
//! either yields one complete [`MeasurementSample`] or is thrown away as a
//! whole.

use crate::{
    classify::{classify, Classification, DiscardReason, SampleRole},
    config::MeasureConfig,
    lifecycle::{FunctionLifecycle, FunctionState, MutationStatus},
    outcome::{valid, MeasureError, Outcome, RetryReason},
    pacing::{Cancellation, Sleeper},
    report::{parse_report, ExecutionReport},
    state::MeasurementSample,
};
use log::{debug, info, warn};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSettings {
    pub warm_start_samples: usize,
    pub max_consecutive_failures: u32,
    pub conflict_backoff: Duration,
    pub poll_interval: Duration,
    pub max_ready_polls: u32,
}

impl From<&MeasureConfig> for DriverSettings {
    fn from(config: &MeasureConfig) -> Self {
        Self {
            warm_start_samples: config.warm_start_samples,
            max_consecutive_failures: config.max_consecutive_failures,
            conflict_backoff: config.conflict_backoff(),
            poll_interval: config.poll_interval(),
            max_ready_polls: config.max_ready_polls,
        }
    }
}

/// Where a cold-start trigger currently stands.
#[derive(Debug)]
enum Phase {
    Mutating,
    ConflictBackoff,
    Polling,
    Ready,
    Failed(MeasureError),
}

#[derive(Debug)]
pub enum StopReason {
    Completed,
    Cancelled,
    RateLimited,
    Fatal(MeasureError),
}

/// Samples gathered by [`ColdStartDriver::collect`] and why it stopped.
#[derive(Debug)]
pub struct DriverReport {
    pub samples: Vec<MeasurementSample>,
    pub stop: StopReason,
    /// Last marker handed to the function.
    pub marker: u64,
}

pub struct ColdStartDriver<'a, L: ?Sized, S: ?Sized> {
    lifecycle: &'a L,
    sleeper: &'a S,
    settings: DriverSettings,
    function: &'a str,
    payload: &'a str,
    marker: u64,
}

impl<'a, L, S> ColdStartDriver<'a, L, S>
where
    L: FunctionLifecycle + ?Sized,
    S: Sleeper + ?Sized,
{
    pub fn new(
        lifecycle: &'a L,
        sleeper: &'a S,
        settings: DriverSettings,
        function: &'a str,
        payload: &'a str,
    ) -> Self {
        Self {
            lifecycle,
            sleeper,
            settings,
            function,
            payload,
            marker: 0,
        }
    }

    /// Continue numbering configuration markers after `marker`.
    pub fn resume_after(mut self, marker: u64) -> Self {
        self.marker = marker;
        self
    }

    /// Collects up to `count` samples, numbering them from `first_index`.
    ///
    /// Transient failures are retried here; everything else ends collection
    /// and is reported through [`DriverReport::stop`] alongside the samples
    /// gathered so far.
    pub async fn collect(
        &mut self,
        count: usize,
        first_index: u32,
        cancel: &dyn Cancellation,
    ) -> DriverReport {
        let mut samples = Vec::with_capacity(count);
        let mut failures = 0;
        let stop = loop {
            if samples.len() >= count {
                break StopReason::Completed;
            }
            if cancel.is_cancelled() {
                info!(
                    "Out of time after {} samples; stopping measurement",
                    samples.len()
                );
                break StopReason::Cancelled;
            }
            let index = first_index + samples.len() as u32;
            match self.attempt(index).await {
                Outcome::Valid(sample) => {
                    samples.push(sample);
                    failures = 0;
                }
                Outcome::Retry(reason) => {
                    failures += 1;
                    info!("Attempt {index} discarded: {reason}. Trying again.");
                    if failures >= self.settings.max_consecutive_failures {
                        break StopReason::Fatal(MeasureError::TooManyFailures(failures));
                    }
                }
                Outcome::RateLimited => {
                    warn!("Configuration updates are being throttled; stopping measurement");
                    break StopReason::RateLimited;
                }
                Outcome::Fatal(e) => break StopReason::Fatal(e),
            }
        };
        DriverReport {
            samples,
            stop,
            marker: self.marker,
        }
    }

    async fn attempt(&mut self, index: u32) -> Outcome<MeasurementSample> {
        info!("Iteration {index}.0");
        valid!(self.force_cold_start().await);

        let (init_ms, cold_used_ms) = valid!(self.invoke_cold().await);
        info!(
            "Cold-Start: Iteration={index}.0, InitDuration={init_ms:.3}ms, UsedDuration={cold_used_ms:.3}ms"
        );

        let mut used_durations = Vec::with_capacity(self.settings.warm_start_samples + 1);
        used_durations.push(cold_used_ms);
        for warm_index in 1..=self.settings.warm_start_samples {
            info!("Iteration {index}.{warm_index}");
            // a single contaminated warm start invalidates the whole chain
            let used_ms = valid!(self.invoke_warm().await);
            info!("Warm-Start: Iteration={index}.{warm_index}, UsedDuration={used_ms:.3}ms");
            used_durations.push(used_ms);
        }

        Outcome::Valid(MeasurementSample {
            sample: index,
            init_duration: Some(init_ms),
            used_durations,
        })
    }

    async fn force_cold_start(&mut self) -> Outcome<()> {
        let mut phase = Phase::Mutating;
        loop {
            debug!("Cold-start trigger phase: {phase:?}");
            phase = match phase {
                Phase::Mutating => {
                    self.marker += 1;
                    match self.lifecycle.mutate_config(self.function, self.marker).await {
                        Ok(MutationStatus::Applied) => Phase::Polling,
                        Ok(MutationStatus::Conflict) => Phase::ConflictBackoff,
                        Ok(MutationStatus::Throttled) => return Outcome::RateLimited,
                        Err(e) => Phase::Failed(MeasureError::Provider(e)),
                    }
                }
                Phase::ConflictBackoff => {
                    info!("Function is not ready to be updated; waiting");
                    self.sleeper.sleep(self.settings.conflict_backoff).await;
                    valid!(self.wait_until_ready().await);
                    return Outcome::Retry(RetryReason::Conflict);
                }
                Phase::Polling => match self.wait_until_ready().await {
                    Outcome::Valid(()) => Phase::Ready,
                    Outcome::Fatal(e) => Phase::Failed(e),
                    other => return other,
                },
                Phase::Ready => return Outcome::Valid(()),
                Phase::Failed(e) => return Outcome::Fatal(e),
            };
        }
    }

    async fn wait_until_ready(&self) -> Outcome<()> {
        for _ in 0..self.settings.max_ready_polls {
            self.sleeper.sleep(self.settings.poll_interval).await;
            let state = match self.lifecycle.state(self.function).await {
                Ok(state) => state,
                Err(e) => return Outcome::Fatal(MeasureError::Provider(e)),
            };
            match state {
                FunctionState::Active | FunctionState::Inactive => return Outcome::Valid(()),
                FunctionState::Pending => continue,
                FunctionState::Failed => return Outcome::Fatal(MeasureError::FailedState),
                FunctionState::Other(name) => {
                    return Outcome::Fatal(MeasureError::UnexpectedState(name))
                }
            }
        }
        Outcome::Fatal(MeasureError::NotReady(self.settings.max_ready_polls))
    }

    async fn invoke_report(&self) -> Outcome<ExecutionReport> {
        let invocation = match self.lifecycle.invoke(self.function, self.payload).await {
            Ok(invocation) => invocation,
            Err(e) => return Outcome::Fatal(MeasureError::Provider(e)),
        };
        if let Some(error) = invocation.function_error {
            return Outcome::Fatal(MeasureError::FunctionError(error));
        }
        Outcome::Valid(parse_report(&invocation.log_tail))
    }

    async fn invoke_cold(&self) -> Outcome<(f64, f64)> {
        let report = valid!(self.invoke_report().await);
        match classify(&report, SampleRole::ExpectedCold) {
            Classification::Cold { init_ms, used_ms } => Outcome::Valid((init_ms, used_ms)),
            Classification::Discard(reason) => Outcome::Retry(RetryReason::Discarded(reason)),
            Classification::Warm { .. } => {
                Outcome::Retry(RetryReason::Discarded(DiscardReason::NotColdStart))
            }
        }
    }

    async fn invoke_warm(&self) -> Outcome<f64> {
        let report = valid!(self.invoke_report().await);
        match classify(&report, SampleRole::ExpectedWarm) {
            Classification::Warm { used_ms } => Outcome::Valid(used_ms),
            Classification::Discard(reason) => Outcome::Retry(RetryReason::Discarded(reason)),
            Classification::Cold { .. } => {
                Outcome::Retry(RetryReason::Discarded(DiscardReason::UnexpectedColdStart))
            }
        }
    }
}
