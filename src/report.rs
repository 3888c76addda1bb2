use regex::Regex;
use std::sync::OnceLock;

/// Timing fields of one invocation, as printed on the `REPORT` line of the
/// function's log tail.
///
/// A report that could not be parsed has every field set to `None`. Callers
/// treat that as an unusable sample, never as an error.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExecutionReport {
    pub used_ms: Option<f64>,
    pub billed_ms: Option<f64>,
    pub memory_size_mb: Option<u32>,
    pub max_memory_used_mb: Option<u32>,
    /// Only present when the execution environment was freshly initialized.
    pub init_ms: Option<f64>,
}

impl ExecutionReport {
    pub fn is_cold_start(&self) -> bool {
        self.init_ms.is_some()
    }
}

fn report_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // digits are spelled out as [0-9] so unicode digits never sneak in
    PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r"REPORT RequestId:\s*(?P<request_id>[0-9a-fA-F\-]+)",
            r"\s+Duration:\s*(?P<used>[0-9.]+) ms",
            r"\s+Billed Duration:\s*(?P<billed>[0-9.]+) ms",
            r"\s+Memory Size:\s*(?P<memory>[0-9]+) MB",
            r"\s+Max Memory Used:\s*(?P<max_memory>[0-9]+) MB",
            r"(?:\s+Init Duration:\s*(?P<init>[0-9.]+) ms)?",
        ))
        .unwrap_or_else(|e| panic!("report pattern is invalid: {e}"))
    })
}

/// Parses lines that look something like:
///
/// ```text
/// REPORT RequestId: 7234b561-1e51-45f4-a031-a71b9836f038	Duration: 327.16 ms	Billed Duration: 328 ms	Memory Size: 256 MB	Max Memory Used: 61 MB	Init Duration: 243.54 ms
/// ```
///
/// The report line may be surrounded by other log output.
pub fn parse_report(log_tail: &str) -> ExecutionReport {
    let Some(captures) = report_pattern().captures(log_tail) else {
        return ExecutionReport::default();
    };
    let parsed = (|| {
        Some(ExecutionReport {
            used_ms: Some(captures.name("used")?.as_str().parse().ok()?),
            billed_ms: Some(captures.name("billed")?.as_str().parse().ok()?),
            memory_size_mb: Some(captures.name("memory")?.as_str().parse().ok()?),
            max_memory_used_mb: Some(captures.name("max_memory")?.as_str().parse().ok()?),
            init_ms: match captures.name("init") {
                Some(init) => Some(init.as_str().parse().ok()?),
                None => None,
            },
        })
    })();
    parsed.unwrap_or_default()
}
