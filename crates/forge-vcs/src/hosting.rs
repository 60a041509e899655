//! Code hosting client for pull requests
//!
//! The workflow only needs three remote operations: open a pull request,
//! read its status, and merge it. `GitHubHost` talks to the GitHub REST API;
//! `MockCodeHost` records calls for tests.

use async_trait::async_trait;
use forge_core::{ForgeError, HostingConfig, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Request to open a pull request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewPullRequest {
    pub title: String,
    pub head: String,
    pub base: String,
    pub body: String,
}

/// An opened pull request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

/// Lifecycle state of a pull request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestState {
    Open,
    Closed,
    Merged,
}

/// Remote status of a pull request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestStatus {
    pub number: u64,
    pub state: PullRequestState,
    pub mergeable: Option<bool>,
}

/// Remote code-hosting operations
#[async_trait]
pub trait CodeHost: Send + Sync {
    /// Open a pull request for an already-pushed branch
    async fn create_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest>;

    /// Read the current state of a pull request
    async fn pull_request_status(&self, number: u64) -> Result<PullRequestStatus>;

    /// Merge a pull request
    async fn merge_pull_request(&self, number: u64) -> Result<()>;
}

/// GitHub REST API client
#[derive(Debug, Clone)]
pub struct GitHubHost {
    http: reqwest::Client,
    api_url: String,
    owner: String,
    repo: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubPull {
    number: u64,
    html_url: String,
    state: String,
    #[serde(default)]
    merged: bool,
    #[serde(default)]
    mergeable: Option<bool>,
}

impl GitHubHost {
    pub fn new(
        api_url: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            owner: owner.into(),
            repo: repo.into(),
            token,
        }
    }

    /// Build a client from hosting config, reading the token from the environment
    pub fn from_config(config: &HostingConfig) -> Result<Self> {
        if config.owner.is_empty() || config.repo.is_empty() {
            return Err(ForgeError::Config(
                "hosting.owner and hosting.repo must be set to open pull requests".to_string(),
            ));
        }
        let token = std::env::var(&config.token_env).ok();
        if token.is_none() {
            warn!(
                "{} is not set; pull request calls will be unauthenticated",
                config.token_env
            );
        }
        Ok(Self::new(&config.api_url, &config.owner, &config.repo, token))
    }

    fn pulls_url(&self) -> String {
        format!("{}/repos/{}/{}/pulls", self.api_url, self.owner, self.repo)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header("accept", "application/vnd.github+json")
            .header("user-agent", "forge-orchestrator")
            .header("x-github-api-version", "2022-11-28");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Look up an open pull request whose head is `branch`
    async fn find_open_pull(&self, branch: &str) -> Result<Option<PullRequest>> {
        let url = format!(
            "{}?state=open&head={}:{}",
            self.pulls_url(),
            self.owner,
            branch
        );
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| ForgeError::Hosting(format!("Failed to list pull requests: {}", e)))?;

        if !response.status().is_success() {
            return Err(ForgeError::Hosting(format!(
                "Listing pull requests failed with {}",
                response.status()
            )));
        }

        let pulls: Vec<GitHubPull> = response
            .json()
            .await
            .map_err(|e| ForgeError::Hosting(format!("Failed to parse pull list: {}", e)))?;

        Ok(pulls.into_iter().next().map(|pull| PullRequest {
            number: pull.number,
            url: pull.html_url,
        }))
    }
}

#[async_trait]
impl CodeHost for GitHubHost {
    async fn create_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest> {
        debug!("Opening pull request {} -> {}", request.head, request.base);

        let response = self
            .request(reqwest::Method::POST, &self.pulls_url())
            .json(request)
            .send()
            .await
            .map_err(|e| ForgeError::Hosting(format!("Failed to send request: {}", e)))?;

        let status = response.status();

        // 422 is returned when a pull request for the head already exists
        if status.as_u16() == 422 {
            let error_text = response.text().await.unwrap_or_default();
            if error_text.contains("already exists") {
                if let Some(existing) = self.find_open_pull(&request.head).await? {
                    info!("Reusing existing pull request #{}", existing.number);
                    return Ok(existing);
                }
            }
            return Err(ForgeError::Hosting(format!(
                "Pull request rejected: {}",
                error_text
            )));
        }

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown".to_string());
            return Err(ForgeError::Hosting(format!(
                "GitHub API error {}: {}",
                status, error_text
            )));
        }

        let pull: GitHubPull = response
            .json()
            .await
            .map_err(|e| ForgeError::Hosting(format!("Failed to parse response: {}", e)))?;

        info!("Opened pull request #{}: {}", pull.number, pull.html_url);

        Ok(PullRequest {
            number: pull.number,
            url: pull.html_url,
        })
    }

    async fn pull_request_status(&self, number: u64) -> Result<PullRequestStatus> {
        let url = format!("{}/{}", self.pulls_url(), number);
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| ForgeError::Hosting(format!("Failed to send request: {}", e)))?;

        if !response.status().is_success() {
            return Err(ForgeError::Hosting(format!(
                "Fetching pull request #{} failed with {}",
                number,
                response.status()
            )));
        }

        let pull: GitHubPull = response
            .json()
            .await
            .map_err(|e| ForgeError::Hosting(format!("Failed to parse response: {}", e)))?;

        let state = if pull.merged {
            PullRequestState::Merged
        } else if pull.state == "closed" {
            PullRequestState::Closed
        } else {
            PullRequestState::Open
        };

        Ok(PullRequestStatus {
            number: pull.number,
            state,
            mergeable: pull.mergeable,
        })
    }

    async fn merge_pull_request(&self, number: u64) -> Result<()> {
        let url = format!("{}/{}/merge", self.pulls_url(), number);
        let response = self
            .request(reqwest::Method::PUT, &url)
            .json(&serde_json::json!({ "merge_method": "squash" }))
            .send()
            .await
            .map_err(|e| ForgeError::Hosting(format!("Failed to send request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ForgeError::Hosting(format!(
                "Merging pull request #{} failed with {}: {}",
                number, status, error_text
            )));
        }

        info!("Merged pull request #{}", number);
        Ok(())
    }
}

/// Recording code host for tests
#[derive(Clone, Default)]
pub struct MockCodeHost {
    state: Arc<Mutex<MockHostState>>,
}

#[derive(Default)]
struct MockHostState {
    created: Vec<NewPullRequest>,
    merged: Vec<u64>,
    fail: bool,
}

impl MockCodeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a hosting error
    pub fn failing() -> Self {
        let host = Self::default();
        host.state().fail = true;
        host
    }

    /// Pull requests opened so far
    pub fn created(&self) -> Vec<NewPullRequest> {
        self.state().created.clone()
    }

    fn state(&self) -> MutexGuard<'_, MockHostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CodeHost for MockCodeHost {
    async fn create_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest> {
        let mut state = self.state();
        if state.fail {
            return Err(ForgeError::Hosting("mock host unavailable".to_string()));
        }
        state.created.push(request.clone());
        let number = state.created.len() as u64;
        Ok(PullRequest {
            number,
            url: format!("https://example.test/pulls/{}", number),
        })
    }

    async fn pull_request_status(&self, number: u64) -> Result<PullRequestStatus> {
        let state = self.state();
        if state.fail || number == 0 || number > state.created.len() as u64 {
            return Err(ForgeError::Hosting(format!("Unknown pull request #{}", number)));
        }
        let pr_state = if state.merged.contains(&number) {
            PullRequestState::Merged
        } else {
            PullRequestState::Open
        };
        Ok(PullRequestStatus {
            number,
            state: pr_state,
            mergeable: Some(true),
        })
    }

    async fn merge_pull_request(&self, number: u64) -> Result<()> {
        let mut state = self.state();
        if state.fail {
            return Err(ForgeError::Hosting("mock host unavailable".to_string()));
        }
        state.merged.push(number);
        Ok(())
    }
}
