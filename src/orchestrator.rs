//! One time-boxed measurement invocation for one build.

use crate::{
    config::MeasureConfig,
    driver::{ColdStartDriver, DriverSettings, StopReason},
    lifecycle::FunctionLifecycle,
    outcome::MeasureError,
    pacing::{Cancellation, Deadline, Sleeper, TokioSleeper},
    run_spec::{RunSpec, ValidationError},
    state::{RunState, RunStateStore},
    store::BlobStore,
};
use chrono::Utc;
use log::{debug, info, warn};
use serde_derive::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

/// What to measure: a validated run-spec, the build it belongs to and the
/// deployed function to drive.
#[derive(Debug, Clone)]
pub struct MeasureRequest {
    build: String,
    function: String,
    spec: RunSpec,
}

impl MeasureRequest {
    pub fn new(
        build: impl Into<String>,
        function: impl Into<String>,
        spec: RunSpec,
    ) -> Result<Self, ValidationError> {
        let build = build.into();
        let function = function.into();
        if build.trim().is_empty() {
            return Err(ValidationError::MissingField("build"));
        }
        if function.trim().is_empty() {
            return Err(ValidationError::MissingField("function"));
        }
        Ok(Self {
            build,
            function,
            spec,
        })
    }

    pub fn build(&self) -> &str {
        &self.build
    }

    pub fn spec(&self) -> &RunSpec {
        &self.spec
    }
}

/// Whether the caller should invoke the orchestrator again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    #[serde(rename = "continue")]
    pub should_continue: bool,
    /// Set when the run ended early because of throttling; the caller should
    /// back off before invoking again.
    pub rate_limited: bool,
    /// Samples persisted for the build, including earlier invocations.
    pub samples: usize,
    /// Samples added by this invocation.
    pub collected: usize,
    pub target: usize,
}

/// Measures one build per call. Calls for the same build are serialized;
/// different builds may run concurrently.
pub struct Orchestrator<L, B, S = TokioSleeper> {
    lifecycle: L,
    states: RunStateStore<B>,
    sleeper: S,
    config: MeasureConfig,
    running: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<L, B> Orchestrator<L, B>
where
    L: FunctionLifecycle,
    B: BlobStore,
{
    pub fn with_tokio(lifecycle: L, store: B, config: MeasureConfig) -> Self {
        Orchestrator::new(lifecycle, store, TokioSleeper, config)
    }
}

impl<L, B, S> Orchestrator<L, B, S>
where
    L: FunctionLifecycle,
    B: BlobStore,
    S: Sleeper,
{
    pub fn new(lifecycle: L, store: B, sleeper: S, config: MeasureConfig) -> Self {
        let states = RunStateStore::new(store, config.state_prefix.clone());
        Self {
            lifecycle,
            states,
            sleeper,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MeasureConfig {
        &self.config
    }

    pub fn states(&self) -> &RunStateStore<B> {
        &self.states
    }

    async fn build_lock(&self, build: &str) -> Arc<Mutex<()>> {
        self.running
            .lock()
            .await
            .entry(build.to_string())
            .or_default()
            .clone()
    }

    /// Measures until the target is reached or the invocation budget
    /// (execution limit minus safety margin) runs out.
    pub async fn measure(&self, request: &MeasureRequest) -> Result<Verdict, MeasureError> {
        let deadline = Deadline::after(self.config.measurement_budget());
        self.measure_until(request, &deadline).await
    }

    pub async fn measure_until(
        &self,
        request: &MeasureRequest,
        cancel: &dyn Cancellation,
    ) -> Result<Verdict, MeasureError> {
        let lock = self.build_lock(&request.build).await;
        // held from load to save
        let _exclusive = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!("{} is already being measured; waiting for it", request.build);
                lock.lock().await
            }
        };

        let target = self.config.cold_start_samples;
        let mut state = match self
            .states
            .load(&request.build)
            .await
            .map_err(MeasureError::Store)?
        {
            Some(state) => state,
            None => {
                info!("Starting new measurement for {}", request.build);
                RunState::new(&request.build, &request.spec)
                    .with_origin(&self.config.region, Utc::now().date_naive())
            }
        };

        let remaining = state.remaining(target);
        let mut fatal = None;
        let mut rate_limited = false;
        let mut collected = 0;
        if remaining == 0 {
            info!(
                "Measurement for {} already has {} of {target} samples",
                request.build,
                state.samples.len()
            );
        } else {
            info!(
                "Measuring {} on {}: {remaining} of {target} samples remaining",
                request.build, request.function
            );
            let mut driver = ColdStartDriver::new(
                &self.lifecycle,
                &self.sleeper,
                DriverSettings::from(&self.config),
                &request.function,
                &request.spec.payload,
            )
            .resume_after(state.marker);
            let report = driver
                .collect(remaining, state.samples.len() as u32 + 1, cancel)
                .await;

            if report.marker != state.marker {
                // let the provider flush logs and settle in-flight updates
                self.sleeper.sleep(self.config.settle_delay()).await;
            }

            state.marker = report.marker;
            collected = state.append(report.samples);
            match report.stop {
                StopReason::Completed | StopReason::Cancelled => {}
                StopReason::RateLimited => rate_limited = true,
                StopReason::Fatal(e) => fatal = Some(e),
            }
        }

        if let Err(e) = self.states.save(&state).await {
            return Err(MeasureError::Store(match fatal {
                Some(fatal) => {
                    warn!("Measurement of {} failed: {fatal}", request.build);
                    e.context(format!("measurement had already failed: {fatal}"))
                }
                None => e,
            }));
        }
        debug!(
            "Saved {} samples to {}",
            state.samples.len(),
            self.states.key(&state.build)
        );

        if let Some(e) = fatal {
            warn!("Measurement of {} failed: {e}", request.build);
            return Err(e);
        }
        let verdict = Verdict {
            should_continue: !rate_limited && !state.is_complete(target),
            rate_limited,
            samples: state.samples.len(),
            collected,
            target,
        };
        info!(
            "Measurement of {}: {}/{} samples (+{collected}), continue={}, rate-limited={}",
            request.build, verdict.samples, target, verdict.should_continue, rate_limited
        );
        Ok(verdict)
    }
}
