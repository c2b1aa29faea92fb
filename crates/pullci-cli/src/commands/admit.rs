//! Admission and operator retry.

use anyhow::{Context, Result};
use pullci_config::DeploymentConfig;
use pullci_core::{BuildKey, PullRequestEvent};
use pullci_scheduler::{AdmitOutcome, PipelineCoordinator};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

async fn coordinator(config: &DeploymentConfig) -> Result<PipelineCoordinator> {
    let store = super::connect_store(config).await?;
    let queue = super::connect_queue(config).await?;
    Ok(PipelineCoordinator::new(
        Arc::new(store),
        Arc::new(queue),
        &config.nats.topic,
    ))
}

/// Read the raw event from a file, or stdin for `None` and `-`.
pub fn read_event(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) if path != Path::new("-") => std::fs::read(path)
            .with_context(|| format!("Failed to read event file: {}", path.display())),
        _ => {
            let mut raw = Vec::new();
            std::io::stdin()
                .read_to_end(&mut raw)
                .context("Failed to read event from stdin")?;
            Ok(raw)
        }
    }
}

pub async fn admit(config: &DeploymentConfig, path: Option<&Path>) -> Result<()> {
    let raw = read_event(path)?;
    let event = PullRequestEvent::decode(&raw).context("Invalid pull request event")?;
    let coordinator = coordinator(config).await?;

    match coordinator.admit(&event, Some(&raw)).await? {
        AdmitOutcome::Enqueued => {
            println!("Enqueued {}#{} at {}", event.repository, event.number, event.head_sha);
        }
        AdmitOutcome::Duplicate => {
            println!("Already admitted: {}@{}", event.repository, event.head_sha);
        }
    }
    Ok(())
}

pub async fn retry(config: &DeploymentConfig, repository: &str, sha: &str) -> Result<()> {
    let key = BuildKey::new(repository, sha.to_ascii_lowercase());
    let coordinator = coordinator(config).await?;
    coordinator
        .retry(&key)
        .await
        .with_context(|| format!("Failed to retry {}", key))?;
    println!("Re-enqueued {}", key);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_event_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(&path, b"{\"repository\":\"moby/moby\"}").unwrap();

        let raw = read_event(Some(&path)).unwrap();
        assert_eq!(raw, b"{\"repository\":\"moby/moby\"}");
    }

    #[test]
    fn test_missing_event_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_event(Some(&dir.path().join("missing.json"))).is_err());
    }
}
