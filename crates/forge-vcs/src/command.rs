//! Git command execution abstraction

use async_trait::async_trait;
use forge_core::{ForgeError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Output;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Output from a git command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl GitOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
        }
    }

    /// Failed output with the given stderr
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
        }
    }
}

impl From<Output> for GitOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }
}

/// Trait for executing git commands (allows scripting in tests)
#[async_trait]
pub trait GitExecutor: Send + Sync {
    /// Execute a git command with the given arguments
    async fn exec(&self, args: &[&str]) -> Result<GitOutput>;

    /// Get the repository root
    fn repo_root(&self) -> &PathBuf;
}

/// Real git command executor
#[derive(Debug, Clone)]
pub struct GitCommand {
    repo_root: PathBuf,
}

impl GitCommand {
    /// Create a new git command executor for the given repository
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// Auto-detect repository root from a directory inside it
    pub async fn detect(start: impl Into<PathBuf>) -> Result<Self> {
        let start = start.into();
        let output = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(&start)
            .output()
            .await
            .map_err(|e| ForgeError::GitCommand(format!("Failed to run git rev-parse: {}", e)))?;

        if !output.status.success() {
            return Err(ForgeError::GitCommand(format!(
                "Not in a git repository: {}",
                start.display()
            )));
        }

        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Self::new(root))
    }
}

#[async_trait]
impl GitExecutor for GitCommand {
    #[instrument(skip(self), fields(repo = %self.repo_root.display()))]
    async fn exec(&self, args: &[&str]) -> Result<GitOutput> {
        debug!("Executing git {:?}", args);

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .map_err(|e| ForgeError::GitCommand(format!("Failed to execute git: {}", e)))?;

        let git_output = GitOutput::from(output);

        if !git_output.success {
            debug!("git command failed: {}", git_output.stderr.trim());
        }

        Ok(git_output)
    }

    fn repo_root(&self) -> &PathBuf {
        &self.repo_root
    }
}

/// Scripted git executor for tests
///
/// Tracks the checked-out branch so `checkout` and
/// `rev-parse --abbrev-ref HEAD` behave like a repository would. Every
/// other command answers from the scripted responses, or succeeds with
/// empty output. Commands matching a failure prefix fail.
#[derive(Clone)]
pub struct MockGitExecutor {
    repo_root: PathBuf,
    state: Arc<Mutex<MockState>>,
}

struct MockState {
    responses: HashMap<String, GitOutput>,
    failures: Vec<String>,
    current_branch: String,
    calls: Vec<String>,
}

impl Default for MockGitExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGitExecutor {
    pub fn new() -> Self {
        Self {
            repo_root: PathBuf::from("/mock/repo"),
            state: Arc::new(Mutex::new(MockState {
                responses: HashMap::new(),
                failures: Vec::new(),
                current_branch: "main".to_string(),
                calls: Vec::new(),
            })),
        }
    }

    pub fn with_response(self, command: &str, output: GitOutput) -> Self {
        self.state().responses.insert(command.to_string(), output);
        self
    }

    /// Fail every command that starts with `prefix`
    pub fn with_failure(self, prefix: &str) -> Self {
        self.state().failures.push(prefix.to_string());
        self
    }

    pub fn on_branch(self, branch: &str) -> Self {
        self.state().current_branch = branch.to_string();
        self
    }

    /// Commands executed so far, space-joined
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn current_branch(&self) -> String {
        self.state().current_branch.clone()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl GitExecutor for MockGitExecutor {
    async fn exec(&self, args: &[&str]) -> Result<GitOutput> {
        let key = args.join(" ");
        let mut state = self.state();
        state.calls.push(key.clone());

        if state.failures.iter().any(|prefix| key.starts_with(prefix.as_str())) {
            return Ok(GitOutput::failed(format!("mock failure: {}", key)));
        }

        if key == "rev-parse --abbrev-ref HEAD" {
            return Ok(GitOutput::ok(format!("{}\n", state.current_branch)));
        }

        if args.len() == 2 && args[0] == "checkout" {
            state.current_branch = args[1].to_string();
            return Ok(GitOutput::ok(""));
        }

        Ok(state
            .responses
            .get(&key)
            .cloned()
            .unwrap_or_else(|| GitOutput::ok("")))
    }

    fn repo_root(&self) -> &PathBuf {
        &self.repo_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_tracks_checkout() {
        let git = MockGitExecutor::new().on_branch("develop");

        let head = git.exec(&["rev-parse", "--abbrev-ref", "HEAD"]).await.unwrap();
        assert_eq!(head.stdout.trim(), "develop");

        git.exec(&["checkout", "feature"]).await.unwrap();
        assert_eq!(git.current_branch(), "feature");
        assert_eq!(git.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_scripted_response_and_failure() {
        let git = MockGitExecutor::new()
            .with_response("status --short", GitOutput::ok(" M src/lib.rs\n"))
            .with_failure("push");

        let status = git.exec(&["status", "--short"]).await.unwrap();
        assert!(status.stdout.contains("src/lib.rs"));

        let push = git.exec(&["push", "-u", "origin", "x"]).await.unwrap();
        assert!(!push.success);
    }

    #[tokio::test]
    async fn test_git_command_outside_repo() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        // Either git is missing or the directory is not a repository
        let result = GitCommand::detect(temp_dir.path()).await;
        assert!(result.is_err());
    }
}
