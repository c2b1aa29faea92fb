//! Commit status command.

use anyhow::Result;
use pullci_config::DeploymentConfig;
use pullci_core::{BuildKey, BuildResult, BuildState};
use pullci_store::CoordinationStore;
use serde_json::json;

pub async fn show(
    config: &DeploymentConfig,
    repository: &str,
    sha: &str,
    with_output: bool,
    as_json: bool,
) -> Result<()> {
    let store = super::connect_store(config).await?;
    let key = BuildKey::new(repository, sha.to_ascii_lowercase());

    let state = store.fetch_state(&key).await?;
    let result = store.fetch_result(&key).await?;

    if as_json {
        println!("{}", render_json(&key, state, &result, with_output));
    } else {
        print!("{}", render_text(&key, state, &result, with_output));
    }
    Ok(())
}

fn render_json(
    key: &BuildKey,
    state: Option<BuildState>,
    result: &BuildResult,
    with_output: bool,
) -> serde_json::Value {
    let methods: serde_json::Map<String, serde_json::Value> = result
        .methods()
        .into_iter()
        .map(|method| {
            let mut entry = json!({
                "result": result.result_for(method),
                "outcome": result.outcome_for(method),
            });
            if with_output {
                entry["output"] = json!(result.output_for(method));
            }
            (method.to_string(), entry)
        })
        .collect();
    json!({
        "repository": key.repository,
        "sha": key.sha,
        "state": state.map(|s| s.as_str()),
        "methods": methods,
    })
}

fn render_text(
    key: &BuildKey,
    state: Option<BuildState>,
    result: &BuildResult,
    with_output: bool,
) -> String {
    let mut text = format!(
        "{}: {}\n",
        key,
        state.map(|s| s.as_str()).unwrap_or("not admitted")
    );
    for method in result.methods() {
        text.push_str(&format!(
            "  {:<18} {}",
            method.as_str(),
            result.result_for(method).unwrap_or("-")
        ));
        if let Some(outcome) = result.outcome_for(method) {
            text.push_str(&format!(" ({})", outcome));
        }
        text.push('\n');
        if with_output {
            for line in result.output_for(method).unwrap_or_default().lines() {
                text.push_str(&format!("    | {}\n", line));
            }
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use pullci_core::{BuildOutcome, MethodResult, TestMethod};

    fn failed_test_result() -> BuildResult {
        let result = MethodResult::new(
            TestMethod::Test,
            BuildOutcome::Failed {
                exit_code: Some(1),
                output: "--- FAIL: TestRace\n".to_string(),
            },
        );
        BuildResult::from_fields(result.fields())
    }

    #[test]
    fn test_text_lists_methods() {
        let key = BuildKey::new("moby/moby", "abc123");
        let text = render_text(
            &key,
            Some(BuildState::Complete),
            &failed_test_result(),
            true,
        );

        assert!(text.starts_with("moby/moby@abc123: complete\n"));
        assert!(text.contains("test"));
        assert!(text.contains("failed"));
        assert!(text.contains("    | --- FAIL: TestRace\n"));
    }

    #[test]
    fn test_unknown_commit() {
        let key = BuildKey::new("moby/moby", "abc123");
        let text = render_text(&key, None, &BuildResult::default(), false);
        assert_eq!(text, "moby/moby@abc123: not admitted\n");
    }

    #[test]
    fn test_json_includes_output_on_request() {
        let key = BuildKey::new("moby/moby", "abc123");
        let result = failed_test_result();

        let without = render_json(&key, Some(BuildState::Complete), &result, false);
        assert_eq!(without["state"], "complete");
        assert_eq!(without["methods"]["test"]["result"], "failed");
        assert!(without["methods"]["test"].get("output").is_none());

        let with = render_json(&key, Some(BuildState::Complete), &result, true);
        assert_eq!(with["methods"]["test"]["output"], "--- FAIL: TestRace\n");
    }
}
