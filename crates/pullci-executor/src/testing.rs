//! Fixtures shared by the executor tests.

use pullci_core::{BranchRef, PullRequestEvent};
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use url::Url;

/// Run git with a fixed identity, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=test", "-c", "user.email=test@localhost"])
        .args(["-c", "init.defaultBranch=master", "-c", "commit.gpgsign=false"])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git should run");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

pub fn commit_file(dir: &Path, name: &str, contents: &str, message: &str) -> String {
    std::fs::write(dir.join(name), contents).unwrap();
    git(dir, &["add", name]);
    git(dir, &["commit", "-q", "-m", message]);
    git(dir, &["rev-parse", "HEAD"])
}

/// An upstream repository on `master` and a fork with one extra commit on
/// `feature`. Returns the event for that pull request.
pub fn upstream_and_fork(root: &Path) -> PullRequestEvent {
    let upstream = root.join("upstream");
    std::fs::create_dir_all(&upstream).unwrap();
    git(&upstream, &["init", "-q"]);
    commit_file(&upstream, "README", "upstream\n", "initial");

    let fork = root.join("fork");
    git(
        root,
        &["clone", "-q", upstream.to_str().unwrap(), fork.to_str().unwrap()],
    );
    git(&fork, &["checkout", "-q", "-b", "feature"]);
    let sha = commit_file(&fork, "feature.txt", "from the fork\n", "add feature");

    PullRequestEvent {
        repository: "moby/moby".to_string(),
        number: 42,
        base: BranchRef {
            ref_name: "master".to_string(),
            clone_url: Url::from_file_path(&upstream).unwrap(),
        },
        head: BranchRef {
            ref_name: "feature".to_string(),
            clone_url: Url::from_file_path(&fork).unwrap(),
        },
        head_sha: sha,
    }
}

/// An event whose checkout is never performed; for tests with a fake
/// checkout.
pub fn event() -> PullRequestEvent {
    PullRequestEvent {
        repository: "moby/moby".to_string(),
        number: 42,
        base: BranchRef {
            ref_name: "master".to_string(),
            clone_url: Url::parse("https://github.com/moby/moby.git").unwrap(),
        },
        head: BranchRef {
            ref_name: "feature".to_string(),
            clone_url: Url::parse("https://github.com/someone/moby.git").unwrap(),
        },
        head_sha: "abc1234def5678".to_string(),
    }
}

/// Poll until a test command has written a pid to `path`.
#[cfg(target_os = "linux")]
pub async fn read_pid(path: &Path) -> i32 {
    for _ in 0..100 {
        if let Ok(raw) = std::fs::read_to_string(path) {
            if let Ok(pid) = raw.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no pid written to {}", path.display());
}

/// Whether `pid` exists and is not a zombie.
#[cfg(target_os = "linux")]
pub fn is_running(pid: i32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The state follows the parenthesised command name.
    stat.rsplit_once(')')
        .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
        .unwrap_or(false)
}

/// Wait up to two seconds for `pid` to go away.
#[cfg(target_os = "linux")]
pub async fn exits_soon(pid: i32) -> bool {
    for _ in 0..100 {
        if !is_running(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
