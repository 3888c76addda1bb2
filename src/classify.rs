use crate::report::ExecutionReport;
use std::fmt;

/// What the driver expects an invocation to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRole {
    /// First invocation after a forced configuration change.
    ExpectedCold,
    /// Follow-up invocation against the same environment.
    ExpectedWarm,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Classification {
    Cold { init_ms: f64, used_ms: f64 },
    Warm { used_ms: f64 },
    Discard(DiscardReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The report line was missing or malformed.
    NoReport,
    /// Expected a cold start but the environment was reused.
    NotColdStart,
    /// Expected a warm start but the environment was re-initialized.
    UnexpectedColdStart,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscardReason::NoReport => write!(f, "no usable report"),
            DiscardReason::NotColdStart => write!(f, "invocation did not report a cold-start"),
            DiscardReason::UnexpectedColdStart => write!(f, "invocation reported a cold-start"),
        }
    }
}

impl Classification {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Classification::Discard(_))
    }
}

pub fn classify(report: &ExecutionReport, role: SampleRole) -> Classification {
    let Some(used_ms) = report.used_ms else {
        return Classification::Discard(DiscardReason::NoReport);
    };
    match (role, report.init_ms) {
        (SampleRole::ExpectedCold, Some(init_ms)) => Classification::Cold { init_ms, used_ms },
        (SampleRole::ExpectedCold, None) => Classification::Discard(DiscardReason::NotColdStart),
        (SampleRole::ExpectedWarm, None) => Classification::Warm { used_ms },
        (SampleRole::ExpectedWarm, Some(_)) => {
            Classification::Discard(DiscardReason::UnexpectedColdStart)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reports() -> Vec<ExecutionReport> {
        let mut reports = Vec::new();
        for used_ms in [None, Some(12.5)] {
            for init_ms in [None, Some(180.0)] {
                reports.push(ExecutionReport {
                    used_ms,
                    init_ms,
                    ..Default::default()
                });
            }
        }
        reports
    }

    #[test]
    fn cold_is_valid_iff_init_and_used_present() {
        for report in reports() {
            let valid = classify(&report, SampleRole::ExpectedCold).is_valid();
            assert_eq!(
                valid,
                report.init_ms.is_some() && report.used_ms.is_some(),
                "{report:?}"
            );
        }
    }

    #[test]
    fn warm_is_valid_iff_init_absent_and_used_present() {
        for report in reports() {
            let valid = classify(&report, SampleRole::ExpectedWarm).is_valid();
            assert_eq!(
                valid,
                report.init_ms.is_none() && report.used_ms.is_some(),
                "{report:?}"
            );
        }
    }

    #[test]
    fn discard_reasons() {
        let empty = ExecutionReport::default();
        assert_eq!(
            classify(&empty, SampleRole::ExpectedCold),
            Classification::Discard(DiscardReason::NoReport)
        );
        let warm = ExecutionReport {
            used_ms: Some(3.0),
            ..Default::default()
        };
        assert_eq!(
            classify(&warm, SampleRole::ExpectedCold),
            Classification::Discard(DiscardReason::NotColdStart)
        );
        let cold = ExecutionReport {
            used_ms: Some(30.0),
            init_ms: Some(200.0),
            ..Default::default()
        };
        assert_eq!(
            classify(&cold, SampleRole::ExpectedWarm),
            Classification::Discard(DiscardReason::UnexpectedColdStart)
        );
        assert_eq!(
            classify(&cold, SampleRole::ExpectedCold),
            Classification::Cold {
                init_ms: 200.0,
                used_ms: 30.0
            }
        );
    }
}
