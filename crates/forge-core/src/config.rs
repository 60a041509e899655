//! Configuration management for Forge
//!
//! Repository-level settings for the LLM client, admission control, context
//! window, sandbox, orchestrator and code hosting. Loaded from
//! `.forge/config.toml`; every field has a default so a partial file works.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{ForgeError, Result};

/// Repository-level Forge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeConfig {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorSettings,

    #[serde(default)]
    pub hosting: HostingConfig,
}

/// LLM API client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Environment variable containing the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,

    /// Retries on 429/5xx before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Token rate limiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Provider quota in tokens per minute
    #[serde(default = "default_tokens_per_minute")]
    pub tokens_per_minute: u64,

    /// Fraction of the quota held back (0.15 keeps 85%)
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer: f64,

    /// Minimum gap between two admissions
    #[serde(default = "default_min_gap_ms")]
    pub min_gap_ms: u64,

    /// Pause after each release before the next slot is considered
    #[serde(default = "default_release_gap_ms")]
    pub release_gap_ms: u64,

    /// Waiters beyond this are rejected with a queue-full error
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Request size used for the illustrative cooldown in status reports
    #[serde(default = "default_nominal_estimate")]
    pub nominal_estimate: u64,
}

/// Context window manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Hard ceiling on estimated tokens sent per request
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,

    /// Estimated size above which tool results get compressed
    #[serde(default = "default_summarize_threshold")]
    pub summarize_threshold: usize,

    /// Tool results longer than this are compressed
    #[serde(default = "default_max_tool_result_chars")]
    pub max_tool_result_chars: usize,

    /// Most recent messages kept verbatim when the middle is collapsed
    #[serde(default = "default_keep_recent_messages")]
    pub keep_recent_messages: usize,

    /// Line cap for structural summaries
    #[serde(default = "default_max_summary_lines")]
    pub max_summary_lines: usize,

    #[serde(default = "default_true")]
    pub summarization_enabled: bool,
}

/// Tool sandbox settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Root every file operation is confined to
    #[serde(default = "default_repo_root")]
    pub repo_root: PathBuf,

    /// Glob patterns matched against each path component
    #[serde(default = "default_forbidden_paths")]
    pub forbidden_paths: Vec<String>,

    /// Programs a `run_command` call may start
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Command output beyond this is truncated
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Upper bound on tool-use loop iterations for task execution
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Persist a checkpoint every N iterations
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,

    /// Token budget for the ticket description in the initial message
    #[serde(default = "default_description_token_budget")]
    pub description_token_budget: usize,

    /// Token budget for the supplied prompt in the initial message
    #[serde(default = "default_prompt_token_budget")]
    pub prompt_token_budget: usize,

    /// Prior decisions injected into the initial message
    #[serde(default = "default_max_decisions")]
    pub max_decisions: usize,
}

/// Code hosting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostingConfig {
    #[serde(default = "default_hosting_api_url")]
    pub api_url: String,

    #[serde(default)]
    pub owner: String,

    #[serde(default)]
    pub repo: String,

    /// Environment variable containing the hosting token
    #[serde(default = "default_hosting_token_env")]
    pub token_env: String,

    /// Branch pull requests target
    #[serde(default = "default_base_branch")]
    pub base_branch: String,

    /// Git remote branches are pushed to
    #[serde(default = "default_remote")]
    pub remote: String,
}

// Default value providers
fn default_api_url() -> String {
    "https://api.anthropic.com/v1/messages".to_string()
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_anthropic_version() -> String {
    "2023-06-01".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_tokens_per_minute() -> u64 {
    30_000
}

fn default_safety_buffer() -> f64 {
    0.15
}

fn default_min_gap_ms() -> u64 {
    2_000
}

fn default_release_gap_ms() -> u64 {
    250
}

fn default_max_queue_size() -> usize {
    10
}

fn default_nominal_estimate() -> u64 {
    10_000
}

fn default_max_context_tokens() -> usize {
    100_000
}

fn default_summarize_threshold() -> usize {
    60_000
}

fn default_max_tool_result_chars() -> usize {
    12_000
}

fn default_keep_recent_messages() -> usize {
    6
}

fn default_max_summary_lines() -> usize {
    80
}

fn default_true() -> bool {
    true
}

fn default_repo_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_forbidden_paths() -> Vec<String> {
    vec![
        ".env".to_string(),
        ".env.*".to_string(),
        "*.pem".to_string(),
        "*.key".to_string(),
        "id_rsa*".to_string(),
        ".secrets".to_string(),
        "node_modules".to_string(),
        ".git".to_string(),
    ]
}

fn default_allowed_commands() -> Vec<String> {
    [
        "git", "ls", "cat", "head", "tail", "wc", "grep", "find", "pwd", "echo", "diff",
        "npm", "npx", "node", "pnpm", "yarn", "tsc", "jest", "vitest", "eslint", "prettier",
        "cargo", "rustc", "python", "python3", "pytest", "go", "make",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_command_timeout_secs() -> u64 {
    120
}

fn default_max_output_chars() -> usize {
    20_000
}

fn default_max_iterations() -> usize {
    30
}

fn default_checkpoint_interval() -> usize {
    5
}

fn default_description_token_budget() -> usize {
    2_000
}

fn default_prompt_token_budget() -> usize {
    4_000
}

fn default_max_decisions() -> usize {
    5
}

fn default_hosting_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_hosting_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

impl ForgeConfig {
    /// Load configuration from `.forge/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".forge/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ForgeError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `.forge/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<PathBuf> {
        let config_dir = repo_root.join(".forge");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| ForgeError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    /// Reject settings the components cannot work with
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.rate_limit.safety_buffer) {
            return Err(ForgeError::Config(format!(
                "rate_limit.safety_buffer must be in [0, 1), got {}",
                self.rate_limit.safety_buffer
            )));
        }
        if self.rate_limit.max_queue_size == 0 {
            return Err(ForgeError::Config(
                "rate_limit.max_queue_size must be at least 1".to_string(),
            ));
        }
        if self.context.summarize_threshold > self.context.max_context_tokens {
            return Err(ForgeError::Config(format!(
                "context.summarize_threshold ({}) exceeds context.max_context_tokens ({})",
                self.context.summarize_threshold, self.context.max_context_tokens
            )));
        }
        if self.orchestrator.checkpoint_interval == 0 {
            return Err(ForgeError::Config(
                "orchestrator.checkpoint_interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl RateLimitConfig {
    /// Quota reduced by the safety buffer
    pub fn effective_limit(&self) -> u64 {
        (self.tokens_per_minute as f64 * (1.0 - self.safety_buffer)).floor() as u64
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key_env: default_api_key_env(),
            anthropic_version: default_anthropic_version(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_minute: default_tokens_per_minute(),
            safety_buffer: default_safety_buffer(),
            min_gap_ms: default_min_gap_ms(),
            release_gap_ms: default_release_gap_ms(),
            max_queue_size: default_max_queue_size(),
            nominal_estimate: default_nominal_estimate(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            summarize_threshold: default_summarize_threshold(),
            max_tool_result_chars: default_max_tool_result_chars(),
            keep_recent_messages: default_keep_recent_messages(),
            max_summary_lines: default_max_summary_lines(),
            summarization_enabled: true,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            repo_root: default_repo_root(),
            forbidden_paths: default_forbidden_paths(),
            allowed_commands: default_allowed_commands(),
            command_timeout_secs: default_command_timeout_secs(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            checkpoint_interval: default_checkpoint_interval(),
            description_token_budget: default_description_token_budget(),
            prompt_token_budget: default_prompt_token_budget(),
            max_decisions: default_max_decisions(),
        }
    }
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            api_url: default_hosting_api_url(),
            owner: String::new(),
            repo: String::new(),
            token_env: default_hosting_token_env(),
            base_branch: default_base_branch(),
            remote: default_remote(),
        }
    }
}
