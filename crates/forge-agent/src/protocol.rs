//! Protocol registry
//!
//! A protocol names a model, an output budget, a system prompt and the tool
//! set a session may use. Lookups never fail: unknown names resolve to the
//! `standard` protocol.

use crate::types::{Model, ToolDefinition};
use std::collections::BTreeMap;

/// Protocol used when a name is not registered
pub const DEFAULT_PROTOCOL: &str = "standard";

/// Which tools a protocol exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSet {
    /// Every tool, including writes, commands and VCS operations
    Full,
    /// Only tools that cannot change the working tree
    ReadOnly,
}

impl ToolSet {
    const READ_ONLY_TOOLS: &'static [&'static str] =
        &["read_file", "list_directory", "search_code"];

    pub fn allows(&self, tool_name: &str) -> bool {
        match self {
            ToolSet::Full => true,
            ToolSet::ReadOnly => Self::READ_ONLY_TOOLS.contains(&tool_name),
        }
    }

    /// Keep only the definitions this set allows
    pub fn filter(&self, definitions: Vec<ToolDefinition>) -> Vec<ToolDefinition> {
        definitions
            .into_iter()
            .filter(|def| self.allows(&def.name))
            .collect()
    }
}

/// Immutable per-protocol settings
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolConfig {
    pub name: String,
    pub model: Model,
    pub max_output_tokens: usize,
    pub system_prompt: String,
    pub tools: ToolSet,
    /// Pre-flight token estimate handed to the rate limiter
    pub estimated_tokens: u64,
    pub max_iterations: usize,
}

const BASE_PROMPT: &str = "You are an autonomous software engineer working on a single ticket \
in a git repository. Use the tools to inspect the code, make focused changes, and verify them. \
Work on the ticket branch: call create_branch once, commit with commit_changes, and finish with \
create_pull_request. Never modify secrets or dependency caches.";

const REVIEW_PROMPT: &str = "You are reviewing code for a ticket. Use the read-only tools to \
inspect the repository and report findings, risks, and concrete suggestions. Do not attempt \
to modify files.";

/// Static mapping from protocol name to configuration
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    protocols: BTreeMap<String, ProtocolConfig>,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolRegistry {
    /// Registry with the built-in protocols
    pub fn new() -> Self {
        let builtins = [
            ProtocolConfig {
                name: DEFAULT_PROTOCOL.to_string(),
                model: Model::Sonnet,
                max_output_tokens: 8192,
                system_prompt: BASE_PROMPT.to_string(),
                tools: ToolSet::Full,
                estimated_tokens: 12_000,
                max_iterations: 30,
            },
            ProtocolConfig {
                name: "fast".to_string(),
                model: Model::Haiku,
                max_output_tokens: 4096,
                system_prompt: format!(
                    "{} Prefer the smallest change that solves the ticket.",
                    BASE_PROMPT
                ),
                tools: ToolSet::Full,
                estimated_tokens: 6_000,
                max_iterations: 15,
            },
            ProtocolConfig {
                name: "thorough".to_string(),
                model: Model::Opus,
                max_output_tokens: 16_000,
                system_prompt: format!(
                    "{} Read related code and tests before editing, and run the test suite before committing.",
                    BASE_PROMPT
                ),
                tools: ToolSet::Full,
                estimated_tokens: 20_000,
                max_iterations: 30,
            },
            ProtocolConfig {
                name: "review".to_string(),
                model: Model::Sonnet,
                max_output_tokens: 8192,
                system_prompt: REVIEW_PROMPT.to_string(),
                tools: ToolSet::ReadOnly,
                estimated_tokens: 10_000,
                max_iterations: 20,
            },
        ];

        Self {
            protocols: builtins
                .into_iter()
                .map(|config| (config.name.clone(), config))
                .collect(),
        }
    }

    /// Add or replace a protocol
    pub fn register(&mut self, config: ProtocolConfig) {
        self.protocols
            .insert(config.name.trim().to_lowercase(), config);
    }

    /// Look up a protocol, falling back to the default for unknown names
    pub fn resolve(&self, name: &str) -> &ProtocolConfig {
        let key = name.trim().to_lowercase();
        match self.protocols.get(&key) {
            Some(config) => config,
            None => {
                tracing::warn!("Unknown protocol '{}', using '{}'", name, DEFAULT_PROTOCOL);
                self.default_protocol()
            }
        }
    }

    /// Registered protocol names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.protocols.keys().map(String::as_str).collect()
    }

    fn default_protocol(&self) -> &ProtocolConfig {
        // The default is inserted by `new` and `register` cannot remove it
        &self.protocols[DEFAULT_PROTOCOL]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known() {
        let registry = ProtocolRegistry::new();
        let fast = registry.resolve("fast");
        assert_eq!(fast.model, Model::Haiku);
        assert_eq!(registry.resolve("REVIEW").tools, ToolSet::ReadOnly);
    }

    #[test]
    fn test_resolve_unknown_falls_back() {
        let registry = ProtocolRegistry::new();
        let config = registry.resolve("does-not-exist");
        assert_eq!(config.name, DEFAULT_PROTOCOL);
        assert_eq!(config.model, Model::Sonnet);
    }

    #[test]
    fn test_names() {
        let registry = ProtocolRegistry::new();
        assert_eq!(registry.names(), vec!["fast", "review", "standard", "thorough"]);
    }

    #[test]
    fn test_register_override() {
        let mut registry = ProtocolRegistry::new();
        let mut custom = registry.resolve("standard").clone();
        custom.max_iterations = 3;
        registry.register(custom);
        assert_eq!(registry.resolve("standard").max_iterations, 3);
    }

    #[test]
    fn test_read_only_tool_set() {
        assert!(ToolSet::ReadOnly.allows("read_file"));
        assert!(!ToolSet::ReadOnly.allows("run_command"));
        assert!(ToolSet::Full.allows("create_pull_request"));
    }
}
