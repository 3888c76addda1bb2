use serde_derive::{Deserialize, Serialize};
use std::{ops::RangeInclusive, path::Path};
use thiserror::Error;

pub const MEMORY_SIZE_RANGE: RangeInclusive<u32> = 128..=10240;

/// Run-spec document as written by the build planner. Every field is optional
/// here; [`RunSpec::try_from`] decides what is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpecDocument {
    pub project: Option<String>,
    pub handler: Option<String>,
    pub zip_file: Option<String>,
    #[serde(default)]
    pub zip_size: u64,
    pub runtime: Option<String>,
    pub architecture: Option<String>,
    #[serde(default)]
    pub memory_size: u32,
    pub payload: Option<String>,
    pub tiered: Option<String>,
    pub ready2_run: Option<String>,
    #[serde(rename = "preJIT")]
    pub pre_jit: Option<String>,
}

/// One validated configuration to measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    pub project: String,
    pub handler: String,
    pub zip_file: String,
    pub zip_size: u64,
    pub runtime: String,
    pub architecture: String,
    pub memory_size: u32,
    pub payload: String,
    pub tiered: Option<String>,
    pub ready2_run: Option<String>,
    #[serde(rename = "preJIT")]
    pub pre_jit: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed run-spec: {0}")]
    Malformed(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("memory size {0}MB is outside of 128MB..=10240MB")]
    MemorySize(u32),
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ValidationError::MissingField(field)),
    }
}

impl TryFrom<RunSpecDocument> for RunSpec {
    type Error = ValidationError;

    fn try_from(document: RunSpecDocument) -> Result<Self, Self::Error> {
        let spec = RunSpec {
            project: required(document.project, "project")?,
            handler: required(document.handler, "handler")?,
            zip_file: required(document.zip_file, "zipFile")?,
            zip_size: document.zip_size,
            runtime: required(document.runtime, "runtime")?,
            architecture: required(document.architecture, "architecture")?,
            memory_size: document.memory_size,
            // an empty payload is legitimate, only a missing one is not
            payload: document
                .payload
                .ok_or(ValidationError::MissingField("payload"))?,
            tiered: document.tiered,
            ready2_run: document.ready2_run,
            pre_jit: document.pre_jit,
        };
        if !MEMORY_SIZE_RANGE.contains(&spec.memory_size) {
            return Err(ValidationError::MemorySize(spec.memory_size));
        }
        Ok(spec)
    }
}

impl RunSpec {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ValidationError> {
        let document: RunSpecDocument = serde_json::from_slice(bytes)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        document.try_into()
    }
}

/// The build identity of a run-spec is the file stem of its key:
/// `Build/42/Minimal-arm64-256.json` measures build `Minimal-arm64-256`.
pub fn build_id_from_key(key: &str) -> Option<String> {
    Path::new(key)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
}
