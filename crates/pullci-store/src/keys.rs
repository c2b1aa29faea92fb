//! Key layout of the coordination store.
//!
//! Every key is derived here, from the namespace plus repository and commit
//! identifiers, so several repositories can share one store and operators can
//! find a commit's state by hand:
//!
//! ```text
//! <ns>/<repo>/commit/<sha>/state       pending | complete
//! <ns>/<repo>/commit/<sha>/result      hash of <method>-* fields
//! <ns>/<repo>/commit/<sha>/payload     raw inbound payload
//! <ns>/<repo>/commit/<sha>/event       encoded event, replayed by retry
//! <ns>/<repo>/pullrequests/<number>    set of head commits
//! <ns>/stats/<action>/count            counter
//! <ns>/message-duration/<queue>        list of seconds
//! ```

use pullci_core::BuildKey;

pub const DEFAULT_NAMESPACE: &str = "/pullci";

/// Per-commit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitField {
    State,
    Result,
    Payload,
    Event,
}

impl CommitField {
    fn as_str(&self) -> &'static str {
        match self {
            CommitField::State => "state",
            CommitField::Result => "result",
            CommitField::Payload => "payload",
            CommitField::Event => "event",
        }
    }
}

/// Derive the key of one per-commit record.
pub fn commit_key(namespace: &str, key: &BuildKey, field: CommitField) -> String {
    join(&[namespace, &key.repository, "commit", &key.sha, field.as_str()])
}

/// Joins segments with `/`, collapsing empty segments and duplicate
/// separators.
fn join(segments: &[&str]) -> String {
    let mut out = String::new();
    for segment in segments {
        for part in segment.split('/').filter(|p| !p.is_empty()) {
            out.push('/');
            out.push_str(part);
        }
    }
    out
}

/// The namespace all keys of one deployment live under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl KeySpace {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: join(&[namespace]),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn state(&self, key: &BuildKey) -> String {
        commit_key(&self.namespace, key, CommitField::State)
    }

    pub fn result(&self, key: &BuildKey) -> String {
        commit_key(&self.namespace, key, CommitField::Result)
    }

    pub fn payload(&self, key: &BuildKey) -> String {
        commit_key(&self.namespace, key, CommitField::Payload)
    }

    pub fn event(&self, key: &BuildKey) -> String {
        commit_key(&self.namespace, key, CommitField::Event)
    }

    pub fn pull_request(&self, repository: &str, number: u64) -> String {
        join(&[
            &self.namespace,
            repository,
            "pullrequests",
            &number.to_string(),
        ])
    }

    pub fn counter(&self, action: &str) -> String {
        join(&[&self.namespace, "stats", action, "count"])
    }

    pub fn message_duration(&self, queue: &str) -> String {
        join(&[&self.namespace, "message-duration", queue])
    }
}
