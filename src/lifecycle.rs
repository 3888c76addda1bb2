use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64_STD, Engine as _};
use log::{debug, trace};
use serde_derive::Deserialize;
use std::{fmt, process::Stdio};

/// Environment variable rewritten on every attempt to force a fresh
/// execution environment.
pub const MARKER_VARIABLE: &str = "COLDSTART_RUN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Applied,
    /// Another update or invocation is still in flight.
    Conflict,
    /// The provider is rate limiting configuration updates.
    Throttled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionState {
    Active,
    Inactive,
    Pending,
    Failed,
    Other(String),
}

impl FunctionState {
    pub fn parse(name: &str) -> Self {
        match name.trim() {
            "Active" => FunctionState::Active,
            "Inactive" => FunctionState::Inactive,
            "Pending" => FunctionState::Pending,
            "Failed" => FunctionState::Failed,
            other => FunctionState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FunctionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionState::Active => write!(f, "Active"),
            FunctionState::Inactive => write!(f, "Inactive"),
            FunctionState::Pending => write!(f, "Pending"),
            FunctionState::Failed => write!(f, "Failed"),
            FunctionState::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Result of a single synchronous invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Decoded tail of the invocation log, containing the `REPORT` line.
    pub log_tail: String,
    /// Set when the function itself failed (`Unhandled`, `Handled`, ...).
    pub function_error: Option<String>,
}

/// Control plane of the function under test.
#[async_trait]
pub trait FunctionLifecycle: Send + Sync {
    async fn mutate_config(&self, function: &str, marker: u64) -> Result<MutationStatus>;
    async fn state(&self, function: &str) -> Result<FunctionState>;
    async fn invoke(&self, function: &str, payload: &str) -> Result<Invocation>;
}

/// Drives the `aws` command line tool.
#[derive(Debug, Clone)]
pub struct AwsCliLifecycle {
    program: String,
    region: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UpdateConfigurationOutput {
    last_update_status: Option<String>,
    last_update_status_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InvokeOutput {
    function_error: Option<String>,
    log_result: Option<String>,
}

struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl AwsCliLifecycle {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            program: "aws".to_string(),
            region: region.into(),
        }
    }

    async fn aws(&self, args: &[&str]) -> Result<CommandOutput> {
        trace!("{} lambda {}", self.program, args.join(" "));
        let output = tokio::process::Command::new(&self.program)
            .arg("lambda")
            .args(args)
            .args(["--region", self.region.as_str(), "--output", "json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("unable to run {}", self.program))?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn mutation_failure(stderr: &str) -> Option<MutationStatus> {
    if stderr.contains("ResourceConflictException") {
        Some(MutationStatus::Conflict)
    } else if stderr.contains("TooManyRequestsException") || stderr.contains("ThrottlingException")
    {
        Some(MutationStatus::Throttled)
    } else {
        None
    }
}

fn decode_invoke_output(stdout: &str) -> Result<Invocation> {
    let output: InvokeOutput =
        serde_json::from_str(stdout).context("unable to parse invoke response")?;
    let log_tail = match output.log_result {
        Some(encoded) => String::from_utf8_lossy(
            &B64_STD
                .decode(encoded.trim())
                .context("log result is not valid base64")?,
        )
        .into_owned(),
        None => String::new(),
    };
    Ok(Invocation {
        log_tail,
        function_error: output.function_error.filter(|e| !e.is_empty()),
    })
}

#[async_trait]
impl FunctionLifecycle for AwsCliLifecycle {
    async fn mutate_config(&self, function: &str, marker: u64) -> Result<MutationStatus> {
        let variables = format!("Variables={{{MARKER_VARIABLE}={marker}}}");
        let output = self
            .aws(&[
                "update-function-configuration",
                "--function-name",
                function,
                "--environment",
                variables.as_str(),
            ])
            .await?;
        if !output.success {
            return match mutation_failure(&output.stderr) {
                Some(status) => {
                    debug!("Configuration update of {function} rejected: {status:?}");
                    Ok(status)
                }
                None => anyhow::bail!(
                    "unable to update configuration of {function}: {}",
                    output.stderr.trim()
                ),
            };
        }
        let update: UpdateConfigurationOutput = serde_json::from_str(&output.stdout)
            .context("unable to parse update-function-configuration response")?;
        if update.last_update_status.as_deref() == Some("Failed") {
            anyhow::bail!(
                "configuration update of {function} failed: {}",
                update.last_update_status_reason.unwrap_or_default()
            );
        }
        Ok(MutationStatus::Applied)
    }

    async fn state(&self, function: &str) -> Result<FunctionState> {
        let output = self
            .aws(&[
                "get-function-configuration",
                "--function-name",
                function,
                "--query",
                "State",
            ])
            .await?;
        if !output.success {
            anyhow::bail!(
                "unable to fetch state of {function}: {}",
                output.stderr.trim()
            );
        }
        let state: String =
            serde_json::from_str(&output.stdout).context("unable to parse function state")?;
        Ok(FunctionState::parse(&state))
    }

    async fn invoke(&self, function: &str, payload: &str) -> Result<Invocation> {
        let output = self
            .aws(&[
                "invoke",
                "--function-name",
                function,
                "--invocation-type",
                "RequestResponse",
                "--log-type",
                "Tail",
                "--cli-binary-format",
                "raw-in-base64-out",
                "--payload",
                payload,
                "/dev/null",
            ])
            .await?;
        if !output.success {
            anyhow::bail!("unable to invoke {function}: {}", output.stderr.trim());
        }
        decode_invoke_output(&output.stdout)
    }
}
