//! Cold-start measurement for serverless functions.
//!
//! A [`RunSpec`] describes one deployed configuration. The [`Orchestrator`]
//! forces fresh execution environments on it, collects cold and warm
//! durations, and persists a resumable [`RunState`] so that measurement can
//! continue across time-limited invocations. The [`aggregate`] module turns
//! finished states into CSV reports.

pub mod aggregate;
pub mod classify;
pub mod config;
pub mod driver;
pub mod lifecycle;
pub mod orchestrator;
pub mod outcome;
pub mod pacing;
pub mod report;
pub mod run_spec;
pub mod state;
pub mod store;

#[cfg(test)]
mod testing;

pub use aggregate::{summarize, MeasurementSummary, PricingTable};
pub use config::MeasureConfig;
pub use lifecycle::{AwsCliLifecycle, FunctionLifecycle};
pub use orchestrator::{MeasureRequest, Orchestrator, Verdict};
pub use outcome::MeasureError;
pub use run_spec::RunSpec;
pub use state::{RunState, RunStateStore};
pub use store::{BlobStore, DirBlobStore, MemoryBlobStore, RedisBlobStore};
