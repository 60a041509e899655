//! Per-execution branch, commit and pull request workflow
//!
//! Branches follow the convention `forge/{ticket-identifier}/{slug}`. Branch
//! and pull request state lives in the caller's [`ToolContext`] so a retried
//! session picks up where the previous one stopped instead of opening
//! duplicates.

use forge_core::{ForgeError, Result, ToolContext};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::command::GitExecutor;
use crate::hosting::{CodeHost, NewPullRequest, PullRequest};

const MAX_SLUG_LEN: usize = 40;

/// Result of a create-branch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchOutcome {
    /// A new branch was created from HEAD
    Created(String),
    /// Git reported the branch already existed
    AlreadyExists(String),
    /// The context already carried a branch from an earlier session
    Reused(String),
}

impl BranchOutcome {
    pub fn name(&self) -> &str {
        match self {
            Self::Created(name) | Self::AlreadyExists(name) | Self::Reused(name) => name,
        }
    }
}

/// Result of a commit request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed {
        branch: String,
        sha: String,
        files: Vec<String>,
    },
    NothingToCommit,
}

/// Lowercase, dash-separated slug of at most 40 characters
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut last_dash = true;

    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }

    let mut slug: String = slug.chars().take(MAX_SLUG_LEN).collect();
    while slug.ends_with('-') {
        slug.pop();
    }

    if slug.is_empty() {
        "work".to_string()
    } else {
        slug
    }
}

/// Deterministic branch name for a ticket and a short description
pub fn branch_name(ticket_identifier: &str, slug: &str) -> String {
    format!(
        "forge/{}/{}",
        ticket_identifier.trim().to_lowercase(),
        slugify(slug)
    )
}

/// Git workflow bound to one repository and one code host
#[derive(Clone)]
pub struct VcsWorkflow {
    git: Arc<dyn GitExecutor>,
    host: Arc<dyn CodeHost>,
    base_branch: String,
    remote: String,
}

impl VcsWorkflow {
    pub fn new(git: Arc<dyn GitExecutor>, host: Arc<dyn CodeHost>) -> Self {
        Self {
            git,
            host,
            base_branch: "main".to_string(),
            remote: "origin".to_string(),
        }
    }

    pub fn with_base_branch(mut self, base: impl Into<String>) -> Self {
        self.base_branch = base.into();
        self
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    /// Create the working branch for this execution from HEAD without switching to it
    #[instrument(skip(self, ctx), fields(execution = %ctx.execution_id))]
    pub async fn create_branch(&self, ctx: &mut ToolContext, slug: &str) -> Result<BranchOutcome> {
        if let Some(existing) = &ctx.branch_name {
            debug!("Reusing branch {} from earlier session", existing);
            return Ok(BranchOutcome::Reused(existing.clone()));
        }

        let name = branch_name(&ctx.ticket_identifier, slug);
        let output = self.git.exec(&["branch", &name]).await?;

        let outcome = if output.success {
            info!("Created branch {}", name);
            BranchOutcome::Created(name.clone())
        } else if output.stderr.contains("already exists") {
            debug!("Branch {} already exists", name);
            BranchOutcome::AlreadyExists(name.clone())
        } else {
            return Err(ForgeError::GitCommand(format!(
                "Failed to create branch {}: {}",
                name,
                output.stderr.trim()
            )));
        };

        ctx.branch_name = Some(name);
        Ok(outcome)
    }

    /// Stage everything and commit it to the target branch
    ///
    /// The target is `target`, else the context's branch, else whatever is
    /// checked out. When the target is not the current branch, the staged
    /// work is stashed, applied on the target, committed there, and the
    /// original branch is checked out again whether or not the commit
    /// succeeded.
    #[instrument(skip(self, ctx, message), fields(execution = %ctx.execution_id))]
    pub async fn commit(
        &self,
        ctx: &ToolContext,
        message: &str,
        target: Option<&str>,
    ) -> Result<CommitOutcome> {
        let current = self.current_branch().await?;
        let target = target
            .map(str::to_string)
            .or_else(|| ctx.branch_name.clone())
            .unwrap_or_else(|| current.clone());

        self.run(&["add", "-A"], "stage changes").await?;

        let staged = self
            .run(&["diff", "--cached", "--name-only"], "list staged files")
            .await?;
        let files: Vec<String> = staged
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        if files.is_empty() {
            debug!("Nothing staged; skipping commit");
            return Ok(CommitOutcome::NothingToCommit);
        }

        if target == current {
            let sha = self.commit_staged(message).await?;
            info!("Committed {} files to {} ({})", files.len(), target, sha);
            return Ok(CommitOutcome::Committed {
                branch: target,
                sha,
                files,
            });
        }

        let stash_message = format!("forge-{}", ctx.execution_id);
        self.run(&["stash", "push", "-m", &stash_message], "stash changes")
            .await?;

        let mut stash_applied = false;
        let result = self
            .commit_on_branch(&target, message, &mut stash_applied)
            .await;

        self.restore(&current, stash_applied).await;

        let sha = result?;
        info!(
            "Committed {} files to {} ({}) and returned to {}",
            files.len(),
            target,
            sha,
            current
        );
        Ok(CommitOutcome::Committed {
            branch: target,
            sha,
            files,
        })
    }

    /// Push the session branch and open a pull request for it
    #[instrument(skip(self, ctx, body), fields(execution = %ctx.execution_id))]
    pub async fn create_pull_request(
        &self,
        ctx: &mut ToolContext,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        let branch = ctx.branch_name.clone().ok_or_else(|| {
            ForgeError::Tool(
                "No branch has been created in this session; call create_branch first"
                    .to_string(),
            )
        })?;

        if let (Some(url), Some(number)) = (&ctx.pr_url, ctx.pr_number) {
            debug!("Pull request #{} already open for {}", number, branch);
            return Ok(PullRequest {
                number,
                url: url.clone(),
            });
        }

        self.run(&["push", "-u", &self.remote, &branch], "push branch")
            .await?;

        let pr = self
            .host
            .create_pull_request(&NewPullRequest {
                title: title.to_string(),
                head: branch,
                base: self.base_branch.clone(),
                body: body.to_string(),
            })
            .await?;

        ctx.pr_url = Some(pr.url.clone());
        ctx.pr_number = Some(pr.number);
        Ok(pr)
    }

    async fn current_branch(&self) -> Result<String> {
        let head = self
            .run(&["rev-parse", "--abbrev-ref", "HEAD"], "read current branch")
            .await?;
        Ok(head.trim().to_string())
    }

    async fn commit_staged(&self, message: &str) -> Result<String> {
        self.run(&["commit", "-m", message], "commit").await?;
        let sha = self.run(&["rev-parse", "HEAD"], "read commit").await?;
        Ok(sha.trim().to_string())
    }

    async fn commit_on_branch(
        &self,
        target: &str,
        message: &str,
        stash_applied: &mut bool,
    ) -> Result<String> {
        self.run(&["checkout", target], "check out target branch")
            .await?;
        self.run(&["stash", "pop"], "apply stashed changes").await?;
        *stash_applied = true;
        self.run(&["add", "-A"], "stage changes").await?;
        self.commit_staged(message).await
    }

    /// Return to the original branch, recovering stashed work if it never landed
    async fn restore(&self, original: &str, stash_applied: bool) {
        match self.git.exec(&["checkout", original]).await {
            Ok(output) if output.success => {}
            Ok(output) => warn!(
                "Failed to return to {}: {}",
                original,
                output.stderr.trim()
            ),
            Err(e) => warn!("Failed to return to {}: {}", original, e),
        }

        if !stash_applied {
            match self.git.exec(&["stash", "pop"]).await {
                Ok(output) if output.success => {}
                Ok(output) => warn!("Failed to restore stash: {}", output.stderr.trim()),
                Err(e) => warn!("Failed to restore stash: {}", e),
            }
        }
    }

    async fn run(&self, args: &[&str], action: &str) -> Result<String> {
        let output = self.git.exec(args).await?;
        if !output.success {
            return Err(ForgeError::GitCommand(format!(
                "Failed to {}: {}",
                action,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}
