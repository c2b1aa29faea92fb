//! Variable interpolation for build command templates.
//!
//! Supports variables like:
//! - `${method}` - Test method being run (`binary`, `test`, ...)
//! - `${git.sha}` - Head commit SHA
//! - `${git.short_sha}` - Short (7 char) head commit SHA
//! - `${git.base_ref}` - Base branch the pull request targets
//! - `${git.head_ref}` - Head branch of the pull request
//! - `${repo.name}` - Repository (`owner/name`)
//! - `${pr.number}` - Pull request number
//! - `${workspace}` - Checkout directory on the worker
//! - `${job.name}` - Unique job name
//! - `${env.VAR_NAME}` - Configured environment variable

use pullci_core::{PullRequestEvent, TestMethod};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    /// Test method of the consumer group
    pub method: String,
    /// Git-related variables
    pub git: GitContext,
    /// Repository and pull request
    pub pull_request: PullRequestContext,
    /// Job-related variables
    pub job: JobContext,
    /// Environment variables
    pub env: HashMap<String, String>,
}

/// Git context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub base_ref: String,
    pub head_ref: String,
}

#[derive(Debug, Clone, Default)]
pub struct PullRequestContext {
    pub repository: String,
    pub number: u64,
}

/// Job context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub name: String,
    pub workspace: String,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

impl VariableContext {
    /// Create a new empty variable context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["method"] => Some(self.method.clone()),
            ["workspace"] => Some(self.job.workspace.clone()),

            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "base_ref"] => Some(self.git.base_ref.clone()),
            ["git", "head_ref"] => Some(self.git.head_ref.clone()),

            ["repo", "name"] => Some(self.pull_request.repository.clone()),
            ["pr", "number"] => Some(self.pull_request.number.to_string()),

            ["job", "name"] => Some(self.job.name.clone()),

            ["env", name] => self.env.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    /// Unknown variables are left as written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Interpolate variables in a list of strings, one argv entry each.
    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    /// Interpolate variables in map values.
    pub fn interpolate_map<'a>(
        &self,
        map: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> HashMap<String, String> {
        map.into_iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Names of every `${...}` variable referenced in a template that this
    /// context cannot resolve. Used to reject bad templates at load time.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    /// Populate method, git and pull request variables from an event.
    pub fn for_event(event: &PullRequestEvent, method: TestMethod) -> Self {
        Self::new()
            .with_method(method)
            .with_git_sha(&event.head_sha)
            .with_refs(&event.base.ref_name, &event.head.ref_name)
            .with_pull_request(&event.repository, event.number)
    }

    pub fn with_method(mut self, method: TestMethod) -> Self {
        self.ctx.method = method.as_str().to_string();
        self
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.ctx.git.short_sha = sha.chars().take(7).collect();
        self.ctx.git.sha = sha;
        self
    }

    pub fn with_refs(mut self, base: impl Into<String>, head: impl Into<String>) -> Self {
        self.ctx.git.base_ref = base.into();
        self.ctx.git.head_ref = head.into();
        self
    }

    pub fn with_pull_request(mut self, repository: impl Into<String>, number: u64) -> Self {
        self.ctx.pull_request.repository = repository.into();
        self.ctx.pull_request.number = number;
        self
    }

    pub fn with_job(mut self, name: impl Into<String>, workspace: impl Into<String>) -> Self {
        self.ctx.job.name = name.into();
        self.ctx.job.workspace = workspace.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> PullRequestEvent {
        PullRequestEvent::decode(
            br#"{
                "repository": "moby/moby",
                "number": 4242,
                "base": {"ref": "master", "clone_url": "https://github.com/moby/moby.git"},
                "head": {"ref": "fix-race", "clone_url": "https://github.com/someone/moby.git"},
                "head_sha": "abc1234567890"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_event_variables() {
        let ctx = VariableContextBuilder::for_event(&event(), TestMethod::TestIntegration).build();

        let result = ctx.interpolate("${repo.name}#${pr.number} ${git.base_ref}..${git.head_ref}");
        assert_eq!(result, "moby/moby#4242 master..fix-race");
        assert_eq!(ctx.interpolate("${method}"), "test-integration");
        assert_eq!(ctx.interpolate("${git.short_sha}"), "abc1234");
    }

    #[test]
    fn test_job_variables() {
        let ctx = VariableContextBuilder::new()
            .with_job("pr-4242-0a1b2c3d4e5f", "/work/pr-4242/src")
            .build();

        assert_eq!(
            ctx.interpolate("cd ${workspace} && echo ${job.name}"),
            "cd /work/pr-4242/src && echo pr-4242-0a1b2c3d4e5f"
        );
    }

    #[test]
    fn test_env_variables() {
        let ctx = VariableContextBuilder::new()
            .with_env("DOCKER_GRAPHDRIVER", "vfs")
            .build();

        assert_eq!(ctx.interpolate("driver=${env.DOCKER_GRAPHDRIVER}"), "driver=vfs");
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let ctx = VariableContext::new();
        let result = ctx.interpolate("Unknown: ${unknown.var}");
        assert_eq!(result, "Unknown: ${unknown.var}");
    }

    #[test]
    fn test_interpolate_vec_keeps_arguments_separate() {
        let ctx = VariableContextBuilder::new()
            .with_method(TestMethod::Binary)
            .build();

        let inputs = vec!["hack/make.sh".to_string(), "${method}".to_string()];
        assert_eq!(ctx.interpolate_vec(&inputs), vec!["hack/make.sh", "binary"]);
    }

    #[test]
    fn test_unresolved_names() {
        let ctx = VariableContextBuilder::new()
            .with_method(TestMethod::Test)
            .build();

        assert_eq!(
            ctx.unresolved("${method} ${git.branch} ${env.MISSING}"),
            vec!["git.branch".to_string(), "env.MISSING".to_string()]
        );
    }

    #[test]
    fn test_nested_braces() {
        let ctx = VariableContextBuilder::new().with_git_sha("abc123").build();

        let result = ctx.interpolate(r#"{"sha": "${git.sha}"}"#);
        assert_eq!(result, r#"{"sha": "abc123"}"#);
    }
}
