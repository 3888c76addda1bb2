//! Summary statistics and CSV reports over completed measurements.

use crate::{
    state::{merge_by_build, RunState, RunStateStore},
    store::BlobStore,
};
use chrono::{NaiveDate, Utc};
use log::info;
use std::collections::HashMap;
use thiserror::Error;

/// Costs are displayed in millionths of the currency unit.
pub const COST_DISPLAY_MULTIPLIER: f64 = 1_000_000.0;

const FIXED_COLUMNS: [&str; 14] = [
    "Project",
    "Build",
    "Runtime",
    "Architecture",
    "Tiered",
    "Ready2Run",
    "PreJIT",
    "ZipSize",
    "MemorySize",
    "Runs",
    "Init",
    "Cold Used",
    "Total Warm Used",
    "Cost",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitPrice {
    /// Price of one millisecond of compute at one MB of memory.
    pub per_ms_mb: f64,
    pub per_invocation: f64,
}

impl UnitPrice {
    /// Converts the usual "per GB-second" list price.
    pub fn from_gb_second(per_gb_second: f64, per_million_requests: f64) -> Self {
        Self {
            per_ms_mb: per_gb_second / 1000.0 / 1024.0,
            per_invocation: per_million_requests / 1_000_000.0,
        }
    }
}

/// Unit prices keyed by CPU architecture.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    prices: HashMap<String, UnitPrice>,
}

impl PricingTable {
    pub fn with_price(mut self, architecture: impl Into<String>, price: UnitPrice) -> Self {
        self.prices.insert(architecture.into(), price);
        self
    }

    pub fn price(&self, architecture: &str) -> Option<&UnitPrice> {
        self.prices.get(architecture)
    }

    /// On-demand list prices of the us-east-1 region.
    pub fn us_east_1() -> Self {
        Self::default()
            .with_price("x86_64", UnitPrice::from_gb_second(0.000_016_666_7, 0.20))
            .with_price("arm64", UnitPrice::from_gb_second(0.000_013_333_4, 0.20))
    }
}

/// One report row.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSummary {
    pub project: String,
    pub build: String,
    pub runtime: String,
    pub architecture: String,
    pub tiered: Option<String>,
    pub ready2_run: Option<String>,
    pub pre_jit: Option<String>,
    pub zip_size: u64,
    pub memory_size: u32,
    pub runs: usize,
    pub init: Option<f64>,
    pub cold_used: Option<f64>,
    /// Average of each warm-chain position.
    pub warm_used: Vec<f64>,
    /// Sum of `warm_used`: what the whole warm chain costs in time.
    pub total_warm_used: f64,
    /// Price of one cold invocation plus its warm chain.
    pub cost: Option<f64>,
}

fn average(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

pub fn summarize(state: &RunState, pricing: &PricingTable) -> MeasurementSummary {
    let samples = &state.samples;
    let init = average(samples.iter().filter_map(|s| s.init_duration));
    let cold_used = average(samples.iter().filter_map(|s| s.cold_used()));
    let chain_length = samples.iter().map(|s| s.warm_used().len()).max().unwrap_or(0);
    let warm_used: Vec<f64> = (0..chain_length)
        .map(|position| {
            average(samples.iter().filter_map(|s| s.warm_used().get(position).copied()))
                .unwrap_or_default()
        })
        .collect();
    let total_warm_used = warm_used.iter().sum();

    let cost = match (cold_used, pricing.price(&state.architecture)) {
        (Some(cold_used), Some(price)) if state.memory_size > 0 => {
            let compute = (cold_used + total_warm_used) * state.memory_size as f64 * price.per_ms_mb;
            let requests = (1 + chain_length) as f64 * price.per_invocation;
            Some((compute + requests) * COST_DISPLAY_MULTIPLIER)
        }
        _ => None,
    };

    MeasurementSummary {
        project: state.project.clone(),
        build: state.build.clone(),
        runtime: state.runtime.clone(),
        architecture: state.architecture.clone(),
        tiered: state.tiered.clone(),
        ready2_run: state.ready2_run.clone(),
        pre_jit: state.pre_jit.clone(),
        zip_size: state.zip_size,
        memory_size: state.memory_size,
        runs: samples.len(),
        init,
        cold_used,
        warm_used,
        total_warm_used,
        cost,
    }
}

#[derive(Debug, Error)]
pub enum CombineError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("unable to write csv: {0}")]
    Write(String),
    #[error("header of file {file} does not match the combined header")]
    HeaderMismatch { file: usize },
}

fn number(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.3}")).unwrap_or_default()
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<String, CombineError> {
    let bytes = writer
        .into_inner()
        .map_err(|e| CombineError::Write(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| CombineError::Write(e.to_string()))
}

fn header(chain_length: usize) -> Vec<String> {
    FIXED_COLUMNS
        .iter()
        .map(|column| column.to_string())
        .chain((1..=chain_length).map(|i| format!("Used-{i:02}")))
        .collect()
}

/// Writes one header and one row per summary. The warm-chain columns follow
/// the longest chain; shorter chains leave their trailing cells empty.
pub fn summaries_to_csv(summaries: &[MeasurementSummary]) -> Result<String, CombineError> {
    let chain_length = summaries.iter().map(|s| s.warm_used.len()).max().unwrap_or(0);
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header(chain_length))?;
    for summary in summaries {
        let mut row = vec![
            summary.project.clone(),
            summary.build.clone(),
            summary.runtime.clone(),
            summary.architecture.clone(),
            summary.tiered.clone().unwrap_or_default(),
            summary.ready2_run.clone().unwrap_or_default(),
            summary.pre_jit.clone().unwrap_or_default(),
            summary.zip_size.to_string(),
            format!("{}MB", summary.memory_size),
            summary.runs.to_string(),
            number(summary.init),
            number(summary.cold_used),
            number(Some(summary.total_warm_used)),
            number(summary.cost),
        ];
        row.extend((0..chain_length).map(|i| number(summary.warm_used.get(i).copied())));
        writer.write_record(&row)?;
    }
    finish(writer)
}

/// Concatenates CSV reports, keeping a single header.
///
/// The header comes from the file with the most columns. Every other header
/// must be a prefix of it; their rows are padded with empty cells.
pub fn combine_csv<S: AsRef<str>>(files: &[S]) -> Result<String, CombineError> {
    let mut parsed = Vec::with_capacity(files.len());
    for file in files {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file.as_ref().as_bytes());
        let records = reader.records().collect::<Result<Vec<_>, _>>()?;
        parsed.push(records);
    }

    let Some(widest) = parsed
        .iter()
        .filter_map(|records| records.first())
        .max_by_key(|header| header.len())
        .cloned()
    else {
        return Ok(String::new());
    };
    for (file, records) in parsed.iter().enumerate() {
        if let Some(header) = records.first() {
            if !header.iter().zip(widest.iter()).all(|(a, b)| a == b) {
                return Err(CombineError::HeaderMismatch { file });
            }
        }
    }

    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    writer.write_record(&widest)?;
    for records in &parsed {
        for record in records.iter().skip(1) {
            let mut row: Vec<&str> = record.iter().collect();
            row.resize(widest.len().max(row.len()), "");
            writer.write_record(&row)?;
        }
    }
    finish(writer)
}

/// `<project> (<yyyy-mm-dd>) [<region>].csv`
pub fn report_filename(project: &str, region: &str, date: NaiveDate) -> String {
    format!("{project} ({}) [{region}].csv", date.format("%Y-%m-%d"))
}

/// A CSV report written to the blob store.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub key: String,
    pub csv: String,
    pub builds: usize,
}

/// Summarizes the persisted states of `builds` and stores the CSV under its
/// report filename. Returns `None` when none of the builds has state.
pub async fn write_report<B: BlobStore>(
    states: &RunStateStore<B>,
    builds: &[String],
    pricing: &PricingTable,
) -> anyhow::Result<Option<Report>> {
    let merged = merge_by_build(states.load_many(builds).await?);
    let Some(first) = merged.first() else {
        info!("No measurements found for {} builds", builds.len());
        return Ok(None);
    };

    let date = first
        .date
        .as_deref()
        .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
        .unwrap_or_else(|| Utc::now().date_naive());
    let region = first.region.as_deref().unwrap_or("unknown");
    let key = report_filename(&first.project, region, date);

    let summaries: Vec<_> = merged.iter().map(|state| summarize(state, pricing)).collect();
    let csv = summaries_to_csv(&summaries)?;
    states.blobs().put(&key, csv.clone().into_bytes()).await?;
    info!("Wrote report for {} builds to {key}", summaries.len());
    Ok(Some(Report {
        key,
        csv,
        builds: summaries.len(),
    }))
}
