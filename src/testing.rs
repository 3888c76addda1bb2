//! Test doubles for the function lifecycle, the sleeper and cancellation.

use crate::{
    lifecycle::{FunctionLifecycle, FunctionState, Invocation, MutationStatus},
    pacing::{Cancellation, Sleeper},
    run_spec::RunSpec,
};
use anyhow::Result;
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

pub(crate) fn spec() -> RunSpec {
    RunSpec {
        project: "Minimal".into(),
        handler: "Minimal::Minimal.Function::ProcessMessageAsync".into(),
        zip_file: "Build/1/Minimal.zip".into(),
        zip_size: 4096,
        runtime: "dotnet6".into(),
        architecture: "arm64".into(),
        memory_size: 256,
        payload: "{}".into(),
        tiered: Some("yes".into()),
        ready2_run: Some("no".into()),
        pre_jit: None,
    }
}

pub(crate) fn report(used_ms: f64, init_ms: Option<f64>) -> Invocation {
    let init = init_ms
        .map(|init| format!("\tInit Duration: {init:.2} ms"))
        .unwrap_or_default();
    Invocation {
        log_tail: format!(
            "START RequestId: 1f2e3d4c Version: $LATEST\nEND RequestId: 1f2e3d4c\n\
             REPORT RequestId: 1f2e3d4c\tDuration: {used_ms:.2} ms\tBilled Duration: {billed} ms\t\
             Memory Size: 256 MB\tMax Memory Used: 64 MB{init}\t\n",
            billed = used_ms.ceil()
        ),
        function_error: None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Mutate(u64),
    State,
    Invoke,
}

#[derive(Default)]
struct FakeInner {
    mutations: VecDeque<MutationStatus>,
    states: VecDeque<FunctionState>,
    invocations: VecDeque<Invocation>,
    fresh: bool,
    cold_invocations: usize,
    calls: Vec<Call>,
}

/// Simulated function: a successful configuration update discards the
/// execution environment, so the next invocation reports a cold start and
/// later ones are warm. Scripted responses take priority over the simulation.
#[derive(Default)]
pub(crate) struct FakeLifecycle {
    inner: Mutex<FakeInner>,
}

impl FakeLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_mutations(&self, statuses: impl IntoIterator<Item = MutationStatus>) {
        self.inner.lock().unwrap().mutations.extend(statuses);
    }

    pub fn script_states(&self, states: impl IntoIterator<Item = FunctionState>) {
        self.inner.lock().unwrap().states.extend(states);
    }

    pub fn script_invocations(&self, invocations: impl IntoIterator<Item = Invocation>) {
        self.inner.lock().unwrap().invocations.extend(invocations);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn markers(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Mutate(marker) => Some(marker),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Call) -> usize {
        self.calls()
            .iter()
            .filter(|call| std::mem::discriminant(*call) == std::mem::discriminant(wanted))
            .count()
    }
}

#[async_trait]
impl FunctionLifecycle for FakeLifecycle {
    async fn mutate_config(&self, _function: &str, marker: u64) -> Result<MutationStatus> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Mutate(marker));
        let status = inner
            .mutations
            .pop_front()
            .unwrap_or(MutationStatus::Applied);
        if status == MutationStatus::Applied {
            inner.fresh = true;
        }
        Ok(status)
    }

    async fn state(&self, _function: &str) -> Result<FunctionState> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::State);
        Ok(inner.states.pop_front().unwrap_or(FunctionState::Active))
    }

    async fn invoke(&self, _function: &str, _payload: &str) -> Result<Invocation> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Invoke);
        let was_fresh = std::mem::take(&mut inner.fresh);
        if let Some(scripted) = inner.invocations.pop_front() {
            return Ok(scripted);
        }
        if was_fresh {
            inner.cold_invocations += 1;
            let n = inner.cold_invocations as f64;
            Ok(report(50.0 + n, Some(100.0 + n)))
        } else {
            Ok(report(5.0, None))
        }
    }
}

/// Yields instead of sleeping, remembering what was asked for.
#[derive(Default)]
pub(crate) struct InstantSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl InstantSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

/// Allows a fixed number of attempt boundaries, then cancels.
pub(crate) struct CancelAfter {
    remaining: AtomicUsize,
}

impl CancelAfter {
    pub fn new(checks: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(checks),
        }
    }
}

impl Cancellation for CancelAfter {
    fn is_cancelled(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
    }
}
