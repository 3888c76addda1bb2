use crate::{run_spec::RunSpec, store::BlobStore};
use anyhow::{Context, Result};
use futures::{stream::FuturesUnordered, TryStreamExt};
use log::{debug, trace};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_STATE_PREFIX: &str = "measurements";

/// One cold start followed by its chain of warm starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MeasurementSample {
    /// 1-based position within the run.
    pub sample: u32,
    pub init_duration: Option<f64>,
    /// Element 0 is the cold invocation, the rest are warm invocations.
    pub used_durations: Vec<f64>,
}

impl MeasurementSample {
    pub fn is_valid(&self) -> bool {
        self.init_duration.is_some() && !self.used_durations.is_empty()
    }

    pub fn cold_used(&self) -> Option<f64> {
        self.used_durations.first().copied()
    }

    pub fn warm_used(&self) -> &[f64] {
        self.used_durations.get(1..).unwrap_or_default()
    }
}

/// Resumable measurement record for one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunState {
    pub project: String,
    pub build: String,
    pub runtime: String,
    pub architecture: String,
    pub memory_size: u32,
    pub tiered: Option<String>,
    pub ready2_run: Option<String>,
    #[serde(rename = "PreJIT")]
    pub pre_jit: Option<String>,
    pub zip_size: u64,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    /// Last configuration marker handed to the function. Markers must never be
    /// reused, otherwise the configuration update is a no-op.
    #[serde(default)]
    pub marker: u64,
    #[serde(default)]
    pub samples: Vec<MeasurementSample>,
}

impl RunState {
    pub fn new(build: &str, spec: &RunSpec) -> Self {
        Self {
            project: spec.project.clone(),
            build: build.to_string(),
            runtime: spec.runtime.clone(),
            architecture: spec.architecture.clone(),
            memory_size: spec.memory_size,
            tiered: spec.tiered.clone(),
            ready2_run: spec.ready2_run.clone(),
            pre_jit: spec.pre_jit.clone(),
            zip_size: spec.zip_size,
            region: None,
            date: None,
            marker: 0,
            samples: Vec::new(),
        }
    }

    pub fn with_origin(mut self, region: &str, date: chrono::NaiveDate) -> Self {
        self.region = Some(region.to_string());
        self.date = Some(date.format("%Y-%m-%d").to_string());
        self
    }

    pub fn is_complete(&self, target: usize) -> bool {
        self.samples.len() >= target
    }

    pub fn remaining(&self, target: usize) -> usize {
        target.saturating_sub(self.samples.len())
    }

    /// Appends valid samples, renumbering them to follow the existing ones.
    /// Invalid samples are dropped. Returns how many were stored.
    pub fn append(&mut self, samples: impl IntoIterator<Item = MeasurementSample>) -> usize {
        let before = self.samples.len();
        for mut sample in samples.into_iter().filter(MeasurementSample::is_valid) {
            sample.sample = self.samples.len() as u32 + 1;
            self.samples.push(sample);
        }
        self.samples.len() - before
    }
}

/// Loads and saves [`RunState`]s under `<prefix>:<build>`.
pub struct RunStateStore<B> {
    store: B,
    prefix: String,
}

impl<B: BlobStore> RunStateStore<B> {
    pub fn new(store: B, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn key(&self, build: &str) -> String {
        format!("{}:{build}", self.prefix)
    }

    pub fn blobs(&self) -> &B {
        &self.store
    }

    pub async fn load(&self, build: &str) -> Result<Option<RunState>> {
        let key = self.key(build);
        let Some(bytes) = self.store.get(&key).await? else {
            debug!("No measurement state at {key}");
            return Ok(None);
        };
        let state: RunState = serde_json::from_slice(&bytes)
            .with_context(|| format!("unable to deserialize measurement state at {key}"))?;
        debug!("Loaded {} samples from {key}", state.samples.len());
        Ok(Some(state))
    }

    pub async fn save(&self, state: &RunState) -> Result<()> {
        let key = self.key(&state.build);
        let bytes = serde_json::to_vec_pretty(state)?;
        trace!("Saving measurement state to {key}: {}", String::from_utf8_lossy(&bytes));
        self.store.put(&key, bytes).await
    }

    /// Fetches the states of several builds concurrently. Builds without
    /// persisted state are skipped. The result is ordered by build.
    pub async fn load_many(&self, builds: &[String]) -> Result<Vec<RunState>> {
        let states: Vec<Option<RunState>> = builds
            .iter()
            .map(|build| self.load(build))
            .collect::<FuturesUnordered<_>>()
            .try_collect()
            .await?;
        let mut states: Vec<RunState> = states.into_iter().flatten().collect();
        states.sort_by(|a, b| a.build.cmp(&b.build));
        Ok(states)
    }
}

/// Combines measurement files that belong to the same build into one state
/// per build, keeping sample order and renumbering.
pub fn merge_by_build(states: Vec<RunState>) -> Vec<RunState> {
    let mut merged: BTreeMap<String, RunState> = BTreeMap::new();
    for state in states {
        match merged.get_mut(&state.build) {
            Some(existing) => {
                existing.marker = existing.marker.max(state.marker);
                existing.append(state.samples);
            }
            None => {
                let build = state.build.clone();
                let mut fresh = RunState {
                    samples: Vec::new(),
                    ..state.clone()
                };
                fresh.append(state.samples);
                merged.insert(build, fresh);
            }
        }
    }
    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::MemoryBlobStore, testing::spec};

    fn sample(init: f64, used: &[f64]) -> MeasurementSample {
        MeasurementSample {
            sample: 0,
            init_duration: Some(init),
            used_durations: used.to_vec(),
        }
    }

    #[test]
    fn append_renumbers_and_drops_invalid() {
        let mut state = RunState::new("b1", &spec());
        let stored = state.append(vec![
            sample(100.0, &[50.0, 5.0]),
            MeasurementSample {
                sample: 7,
                init_duration: None,
                used_durations: vec![3.0],
            },
            MeasurementSample {
                sample: 8,
                init_duration: Some(1.0),
                used_durations: vec![],
            },
            sample(110.0, &[51.0, 6.0]),
        ]);
        assert_eq!(stored, 2);
        assert_eq!(
            state.samples.iter().map(|s| s.sample).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(!state.is_complete(3));
        assert_eq!(state.remaining(3), 1);
        assert_eq!(state.remaining(1), 0);
    }

    #[test]
    fn serializes_with_pascal_case_fields() {
        let mut state = RunState::new("b1", &spec());
        state.append(vec![sample(100.0, &[50.0])]);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["Project"], "Minimal");
        assert_eq!(json["PreJIT"], serde_json::Value::Null);
        assert_eq!(json["Ready2Run"], "no");
        assert_eq!(json["Samples"][0]["InitDuration"], 100.0);
        assert_eq!(json["Samples"][0]["UsedDurations"][0], 50.0);
    }

    #[tokio::test]
    async fn persisting_twice_is_idempotent() {
        let blobs = MemoryBlobStore::new();
        let store = RunStateStore::new(blobs.clone(), DEFAULT_STATE_PREFIX);
        let mut state = RunState::new("b1", &spec());
        state.append(vec![sample(100.0, &[50.0, 4.0]), sample(120.0, &[55.0, 4.5])]);

        store.save(&state).await.unwrap();
        let first = blobs.get("measurements:b1").await.unwrap().unwrap();
        store.save(&state).await.unwrap();
        let second = blobs.get("measurements:b1").await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(store.load("b1").await.unwrap(), Some(state));
        assert_eq!(store.load("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_state_is_an_error() {
        let blobs = MemoryBlobStore::new();
        blobs.put("measurements:b1", b"{".to_vec()).await.unwrap();
        let store = RunStateStore::new(blobs, DEFAULT_STATE_PREFIX);
        assert!(store.load("b1").await.is_err());
    }

    #[tokio::test]
    async fn load_many_skips_missing_and_orders_by_build() {
        let store = RunStateStore::new(MemoryBlobStore::new(), "m");
        for build in ["c", "a"] {
            store.save(&RunState::new(build, &spec())).await.unwrap();
        }
        let states = store
            .load_many(&["c".into(), "b".into(), "a".into()])
            .await
            .unwrap();
        assert_eq!(
            states.iter().map(|s| s.build.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
    }

    #[test]
    fn merge_concatenates_same_build() {
        let mut first = RunState::new("b1", &spec());
        first.marker = 3;
        first.append(vec![sample(100.0, &[50.0])]);
        let mut second = RunState::new("b1", &spec());
        second.marker = 5;
        second.append(vec![sample(120.0, &[55.0]), sample(110.0, &[52.0])]);
        let other = RunState::new("b2", &spec());

        let merged = merge_by_build(vec![first, other, second]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].build, "b1");
        assert_eq!(merged[0].marker, 5);
        assert_eq!(
            merged[0].samples.iter().map(|s| s.sample).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(merged[1].samples.is_empty());
    }
}
