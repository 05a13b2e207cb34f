//! Run report
//!
//! Aggregate of the outcomes of one orchestrated run, exportable as JSON or
//! markdown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::error::HarnessResult;
use crate::scenario::ScenarioOutcome;

/// Outcomes of one orchestrated run, in execution order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Endpoint base the scenarios ran against
    pub target: String,
    /// When the report was created
    pub generated_at: DateTime<Utc>,
    /// One outcome per executed entry
    pub outcomes: Vec<ScenarioOutcome>,
}

impl RunReport {
    /// Empty report for a run against `target`.
    pub fn new(target: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            target: target.to_string(),
            generated_at: Utc::now(),
            outcomes: Vec::new(),
        }
    }

    /// Append the next outcome.
    pub fn add_outcome(&mut self, outcome: ScenarioOutcome) {
        self.outcomes.push(outcome);
    }

    /// True when no scenario failed. An empty run passes.
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(ScenarioOutcome::is_success)
    }

    /// The failed outcome that ended the run, if any.
    pub fn first_failure(&self) -> Option<&ScenarioOutcome> {
        self.outcomes.iter().find(|outcome| !outcome.is_success())
    }

    /// Sum of the outcome durations.
    pub fn total_duration(&self) -> Duration {
        self.outcomes.iter().map(|outcome| outcome.duration).sum()
    }

    /// Export report as JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Export report as markdown
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();

        md.push_str(&format!(
            "# Verification Report\n\n**Run**: {}\n**Date**: {}\n**Target**: {}\n\n",
            self.run_id,
            self.generated_at.format("%Y-%m-%d %H:%M:%S"),
            self.target
        ));

        md.push_str("## Summary\n\n");
        md.push_str(&format!(
            "- **Result**: {}\n",
            if self.passed() { "SUCCESS" } else { "FAILURE" }
        ));
        md.push_str(&format!("- **Scenarios run**: {}\n", self.outcomes.len()));
        md.push_str(&format!(
            "- **Duration**: {}\n\n",
            format_duration(self.total_duration())
        ));

        if !self.outcomes.is_empty() {
            md.push_str("## Scenarios\n\n");
            for outcome in &self.outcomes {
                let status_indicator = if outcome.is_success() { "✓" } else { "✗" };
                md.push_str(&format!(
                    "{} **{}** - {} ({} cycles, {})\n",
                    status_indicator,
                    outcome.scenario,
                    outcome.status.as_str(),
                    outcome.cycles_completed,
                    format_duration(outcome.duration)
                ));
            }
            md.push('\n');
        }

        if let Some(failure) = self.first_failure() {
            md.push_str("## Failure\n\n");
            md.push_str(&format!("**Scenario**: {}\n\n", failure.scenario));
            if let Some(kind) = failure.error_kind {
                md.push_str(&format!("**Kind**: {}\n\n", kind.as_str()));
            }
            if let Some(cycle) = failure.failed_cycle {
                md.push_str(&format!("**Cycle**: {cycle}\n\n"));
            }
            if let Some(reason) = &failure.reason {
                md.push_str(&format!("**Reason**:\n```\n{reason}\n```\n"));
            }
        }

        md
    }

    /// Write the report to `path`: JSON for a `.json` extension, markdown
    /// otherwise.
    pub fn write_to(&self, path: &Path) -> HarnessResult<()> {
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let text = if is_json {
            self.to_json().map_err(std::io::Error::from)?
        } else {
            self.to_markdown()
        };
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// Helper function to format duration
fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}.{millis:03}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, HarnessError};

    fn failed(scenario: &str) -> ScenarioOutcome {
        let err = HarnessError::communication("BL99:Det:N1:Stop", "no such endpoint");
        ScenarioOutcome::new(scenario)
            .with_cycles_completed(3)
            .with_failure(&err, Some(3))
    }

    #[test]
    fn test_empty_report_passes() {
        let report = RunReport::new("BL99:Det:N1");
        assert!(report.passed());
        assert!(report.first_failure().is_none());
        assert!(report.to_markdown().contains("**Result**: SUCCESS"));
    }

    #[test]
    fn test_first_failure() {
        let mut report = RunReport::new("BL99:Det:N1");
        report.add_outcome(ScenarioOutcome::new("start_stop"));
        report.add_outcome(failed("counters"));

        assert!(!report.passed());
        let failure = report.first_failure().unwrap();
        assert_eq!(failure.scenario, "counters");
        assert_eq!(failure.error_kind, Some(ErrorKind::Communication));

        let md = report.to_markdown();
        assert!(md.contains("✓ **start_stop** - SUCCESS"));
        assert!(md.contains("✗ **counters** - FAILURE (3 cycles"));
        assert!(md.contains("**Cycle**: 3"));
    }

    #[test]
    fn test_json_export() {
        let mut report = RunReport::new("BL99:Det:N1");
        report.add_outcome(failed("counters"));
        let json = report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["target"], "BL99:Det:N1");
        assert_eq!(value["outcomes"][0]["status"], "FAILURE");
        assert_eq!(value["outcomes"][0]["error_kind"], "COMMUNICATION");
        assert_eq!(value["outcomes"][0]["failed_cycle"], 3);
    }

    #[test]
    fn test_write_chooses_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let report = RunReport::new("BL99:Det:N1");

        let json_path = dir.path().join("report.json");
        report.write_to(&json_path).unwrap();
        let text = std::fs::read_to_string(&json_path).unwrap();
        assert!(text.trim_start().starts_with('{'));

        let md_path = dir.path().join("report.md");
        report.write_to(&md_path).unwrap();
        let text = std::fs::read_to_string(&md_path).unwrap();
        assert!(text.starts_with("# Verification Report"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.500s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }
}
