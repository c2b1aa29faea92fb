//! Build states, outcomes and the per-method result record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Marker appended to the captured output of a build that hit its deadline.
pub const TIMEOUT_MARKER: &str = "pullci: build exceeded its time limit and was killed";

/// Lifecycle of a commit in the coordination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    /// Admitted and queued (or awaiting retry after a setup error).
    Pending,
    /// A result has been committed for at least one method.
    Complete,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Pending => "pending",
            BuildState::Complete => "complete",
        }
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BuildState::Pending),
            "complete" => Ok(BuildState::Complete),
            _ => Err(format!("Unknown build state: {}", s)),
        }
    }
}

/// The test/build entry point a worker pool runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestMethod {
    Binary,
    Test,
    TestIntegration,
    Cross,
}

impl TestMethod {
    pub const ALL: [TestMethod; 4] = [
        TestMethod::Binary,
        TestMethod::Test,
        TestMethod::TestIntegration,
        TestMethod::Cross,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestMethod::Binary => "binary",
            TestMethod::Test => "test",
            TestMethod::TestIntegration => "test-integration",
            TestMethod::Cross => "cross",
        }
    }
}

impl std::fmt::Display for TestMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TestMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" => Ok(TestMethod::Binary),
            "test" => Ok(TestMethod::Test),
            "test-integration" => Ok(TestMethod::TestIntegration),
            "cross" => Ok(TestMethod::Cross),
            _ => Err(format!(
                "Unknown test method: {} (expected binary, test, test-integration or cross)",
                s
            )),
        }
    }
}

/// Classified result of running a build command to completion or deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildOutcome {
    /// Command exited 0.
    Succeeded { output: String },
    /// Command exited nonzero. A normal CI outcome, not a system error.
    Failed { exit_code: Option<i32>, output: String },
    /// Deadline elapsed first; the job was killed.
    TimedOut { output: String },
}

impl BuildOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, BuildOutcome::Succeeded { .. })
    }

    pub fn output(&self) -> &str {
        match self {
            BuildOutcome::Succeeded { output }
            | BuildOutcome::Failed { output, .. }
            | BuildOutcome::TimedOut { output } => output,
        }
    }

    /// Value of the `<method>-outcome` field.
    pub fn label(&self) -> &'static str {
        match self {
            BuildOutcome::Succeeded { .. } => "succeeded",
            BuildOutcome::Failed { .. } => "failed",
            BuildOutcome::TimedOut { .. } => "timed-out",
        }
    }
}

/// The fields one method contributes to a commit's result hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodResult {
    pub method: TestMethod,
    pub outcome: BuildOutcome,
    pub finished_at: DateTime<Utc>,
}

impl MethodResult {
    pub fn new(method: TestMethod, outcome: BuildOutcome) -> Self {
        Self {
            method,
            outcome,
            finished_at: Utc::now(),
        }
    }

    /// Flatten into hash fields named by method, so results for different
    /// methods on the same commit never overwrite each other.
    pub fn fields(&self) -> Vec<(String, String)> {
        let m = self.method.as_str();
        let result = if self.outcome.passed() {
            "passed"
        } else {
            "failed"
        };
        vec![
            (format!("{}-result", m), result.to_string()),
            (format!("{}-output", m), self.outcome.output().to_string()),
            (format!("{}-outcome", m), self.outcome.label().to_string()),
            (format!("{}-finished-at", m), self.finished_at.to_rfc3339()),
        ]
    }
}

/// Everything committed for one commit, as read back from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub fields: BTreeMap<String, String>,
}

impl BuildResult {
    pub fn from_fields(fields: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// `passed` or `failed`, if the method has run.
    pub fn result_for(&self, method: TestMethod) -> Option<&str> {
        self.field(method, "result")
    }

    pub fn output_for(&self, method: TestMethod) -> Option<&str> {
        self.field(method, "output")
    }

    pub fn outcome_for(&self, method: TestMethod) -> Option<&str> {
        self.field(method, "outcome")
    }

    /// Methods with a recorded result, in a stable order.
    pub fn methods(&self) -> Vec<TestMethod> {
        TestMethod::ALL
            .into_iter()
            .filter(|m| self.result_for(*m).is_some())
            .collect()
    }

    fn field(&self, method: TestMethod, suffix: &str) -> Option<&str> {
        self.fields
            .get(&format!("{}-{}", method.as_str(), suffix))
            .map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names_match_worker_groups() {
        for method in TestMethod::ALL {
            let parsed: TestMethod = method.as_str().parse().unwrap();
            assert_eq!(parsed, method);
        }
        assert_eq!(TestMethod::TestIntegration.to_string(), "test-integration");
        assert!("lint".parse::<TestMethod>().is_err());
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(BuildState::Pending.as_str(), "pending");
        assert_eq!(
            "complete".parse::<BuildState>().unwrap(),
            BuildState::Complete
        );
        assert!("done".parse::<BuildState>().is_err());
    }

    #[test]
    fn test_failed_build_fields() {
        let result = MethodResult::new(
            TestMethod::Test,
            BuildOutcome::Failed {
                exit_code: Some(1),
                output: "--- FAIL: TestNetwork\n".to_string(),
            },
        );
        let fields: BTreeMap<_, _> = result.fields().into_iter().collect();

        assert_eq!(fields["test-result"], "failed");
        assert_eq!(fields["test-output"], "--- FAIL: TestNetwork\n");
        assert_eq!(fields["test-outcome"], "failed");
        assert!(fields.contains_key("test-finished-at"));
        assert_eq!(fields.len(), 4);
    }

    #[test]
    fn test_timeout_is_recorded_as_failed() {
        let result = MethodResult::new(
            TestMethod::Binary,
            BuildOutcome::TimedOut {
                output: TIMEOUT_MARKER.to_string(),
            },
        );
        let fields: BTreeMap<_, _> = result.fields().into_iter().collect();

        assert_eq!(fields["binary-result"], "failed");
        assert_eq!(fields["binary-outcome"], "timed-out");
    }

    #[test]
    fn test_success_is_passed() {
        let outcome = BuildOutcome::Succeeded {
            output: "ok".to_string(),
        };
        assert!(outcome.passed());
        assert_eq!(outcome.output(), "ok");
        let fields = MethodResult::new(TestMethod::Cross, outcome).fields();
        assert!(fields.contains(&("cross-result".to_string(), "passed".to_string())));
    }

    #[test]
    fn test_build_result_reads_per_method_fields() {
        let mut fields = MethodResult::new(
            TestMethod::Binary,
            BuildOutcome::Succeeded {
                output: "built".to_string(),
            },
        )
        .fields();
        fields.extend(
            MethodResult::new(
                TestMethod::TestIntegration,
                BuildOutcome::Failed {
                    exit_code: Some(2),
                    output: "boom".to_string(),
                },
            )
            .fields(),
        );

        let result = BuildResult::from_fields(fields);
        assert_eq!(result.result_for(TestMethod::Binary), Some("passed"));
        assert_eq!(result.output_for(TestMethod::TestIntegration), Some("boom"));
        assert_eq!(result.result_for(TestMethod::Cross), None);
        assert_eq!(
            result.methods(),
            vec![TestMethod::Binary, TestMethod::TestIntegration]
        );
    }
}
