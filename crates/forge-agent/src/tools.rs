//! Tool definitions and dispatch
//!
//! Tool failures never abort the loop. Sandbox violations and execution
//! errors come back to the model as error results so it can correct course.

use crate::protocol::ToolSet;
use crate::sandbox::Sandbox;
use crate::summary::{self, preview};
use crate::tool_loop::ToolHandler;
use crate::types::ToolDefinition;
use async_trait::async_trait;
use forge_core::{ForgeError, Result, ToolContext};
use forge_vcs::{BranchOutcome, CommitOutcome, VcsWorkflow};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Files up to this size are returned verbatim
const SMALL_FILE_CHARS: usize = 8_000;
/// Files above this size switch to a structural summary
const LARGE_FILE_CHARS: usize = 40_000;
const MAX_SUMMARY_LINES: usize = 120;
const MAX_LIST_ENTRIES: usize = 500;
const MAX_SEARCH_RESULTS: usize = 100;
const LOG_PREVIEW_CHARS: usize = 200;

/// Result of one tool call, as handed back to the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Definitions for every tool the executor understands
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "read_file".to_string(),
            description: "Read a file from the repository. Small files are returned in full; \
                large files are summarized. Use mode \"range\" with start_line/end_line to read \
                a specific section, or mode \"summary\" for imports and signatures only."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the repository root"},
                    "mode": {"type": "string", "enum": ["full", "range", "summary"]},
                    "start_line": {"type": "integer", "minimum": 1},
                    "end_line": {"type": "integer", "minimum": 1}
                },
                "required": ["path"]
            }),
        },
        ToolDefinition {
            name: "write_file".to_string(),
            description: "Create or overwrite a file with the complete new content. Parent \
                directories are created automatically."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        },
        ToolDefinition {
            name: "list_directory".to_string(),
            description: "List files and directories. Directories end with '/'.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory to list (default: repository root)"},
                    "recursive": {"type": "boolean"}
                }
            }),
        },
        ToolDefinition {
            name: "search_code".to_string(),
            description: "Search file contents with a regular expression. Results are \
                path:line: text."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string"},
                    "file_pattern": {"type": "string", "description": "Glob on file names, e.g. *.ts"}
                },
                "required": ["pattern"]
            }),
        },
        ToolDefinition {
            name: "run_command".to_string(),
            description: "Run a single allow-listed command (tests, linters, read-only git) in \
                the repository root. Shell operators are not supported."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"}
                },
                "required": ["command"]
            }),
        },
        ToolDefinition {
            name: "create_branch".to_string(),
            description: "Create the working branch for this ticket from the current HEAD. \
                Call once per session before committing."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "slug": {"type": "string", "description": "Short description, e.g. fix-login-redirect"}
                },
                "required": ["slug"]
            }),
        },
        ToolDefinition {
            name: "commit_changes".to_string(),
            description: "Stage all changes and commit them to the ticket branch.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string"},
                    "branch": {"type": "string", "description": "Target branch (default: the ticket branch)"}
                },
                "required": ["message"]
            }),
        },
        ToolDefinition {
            name: "create_pull_request".to_string(),
            description: "Push the ticket branch and open a pull request.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "body": {"type": "string"}
                },
                "required": ["title", "body"]
            }),
        },
    ]
}

/// Executes tool calls against the sandbox and VCS workflow
#[derive(Clone)]
pub struct ToolExecutor {
    sandbox: Arc<Sandbox>,
    vcs: VcsWorkflow,
    tools: ToolSet,
}

impl ToolExecutor {
    pub fn new(sandbox: Arc<Sandbox>, vcs: VcsWorkflow) -> Self {
        Self {
            sandbox,
            vcs,
            tools: ToolSet::Full,
        }
    }

    /// Restrict the executor to a protocol's tool set
    pub fn with_tool_set(mut self, tools: ToolSet) -> Self {
        self.tools = tools;
        self
    }

    /// Definitions offered to the model for this executor's tool set
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.filter(tool_definitions())
    }

    async fn dispatch(&self, ctx: &mut ToolContext, name: &str, input: &Value) -> Result<String> {
        if !self.tools.allows(name) {
            return Err(ForgeError::Tool(format!(
                "Tool '{}' is not available in this protocol",
                name
            )));
        }

        match name {
            "read_file" => self.read_file(input),
            "write_file" => {
                let path = required_str(input, "path")?;
                let content = required_str(input, "content")?;
                let created = self.sandbox.write_file(path, content)?;
                Ok(format!(
                    "{} {} ({} bytes)",
                    if created { "Created" } else { "Updated" },
                    path,
                    content.len()
                ))
            }
            "list_directory" => {
                let path = optional_str(input, "path").unwrap_or(".").to_string();
                let recursive = input.get("recursive").and_then(Value::as_bool).unwrap_or(false);
                let sandbox = self.sandbox.clone();
                let (entries, truncated) = tokio::task::spawn_blocking(move || {
                    sandbox.list_directory(&path, recursive, MAX_LIST_ENTRIES)
                })
                .await
                .map_err(|e| ForgeError::Tool(format!("Directory listing failed: {}", e)))??;

                let mut out = if entries.is_empty() {
                    "(empty directory)".to_string()
                } else {
                    entries.join("\n")
                };
                if truncated {
                    out.push_str(&format!("\n[listing truncated at {} entries]", MAX_LIST_ENTRIES));
                }
                Ok(out)
            }
            "search_code" => {
                let pattern = required_str(input, "pattern")?.to_string();
                let path = optional_str(input, "path").unwrap_or(".").to_string();
                let file_pattern = optional_str(input, "file_pattern").map(str::to_string);
                let sandbox = self.sandbox.clone();
                let (matches, truncated) = tokio::task::spawn_blocking(move || {
                    sandbox.search_code(
                        &pattern,
                        &path,
                        file_pattern.as_deref(),
                        MAX_SEARCH_RESULTS,
                    )
                })
                .await
                .map_err(|e| ForgeError::Tool(format!("Search failed: {}", e)))??;

                let mut out = if matches.is_empty() {
                    "No matches".to_string()
                } else {
                    matches.join("\n")
                };
                if truncated {
                    out.push_str(&format!(
                        "\n[results truncated at {} matches; narrow the pattern or path]",
                        MAX_SEARCH_RESULTS
                    ));
                }
                Ok(out)
            }
            "run_command" => {
                let command = required_str(input, "command")?;
                let output = self.sandbox.run_command(command).await?;
                Ok(output.render())
            }
            "create_branch" => {
                let slug = required_str(input, "slug")?;
                let outcome = self.vcs.create_branch(ctx, slug).await?;
                Ok(match outcome {
                    BranchOutcome::Created(name) => format!("Created branch {}", name),
                    BranchOutcome::AlreadyExists(name) => {
                        format!("Branch {} already exists; using it", name)
                    }
                    BranchOutcome::Reused(name) => {
                        format!("Branch {} was created in an earlier session; using it", name)
                    }
                })
            }
            "commit_changes" => {
                let message = required_str(input, "message")?;
                let branch = optional_str(input, "branch");
                match self.vcs.commit(ctx, message, branch).await? {
                    CommitOutcome::Committed { branch, sha, files } => Ok(format!(
                        "Committed {} file(s) to {} ({})\n{}",
                        files.len(),
                        branch,
                        sha,
                        files.join("\n")
                    )),
                    CommitOutcome::NothingToCommit => Ok("Nothing to commit".to_string()),
                }
            }
            "create_pull_request" => {
                let title = required_str(input, "title")?;
                let body = optional_str(input, "body").unwrap_or("");
                let pr = self.vcs.create_pull_request(ctx, title, body).await?;
                Ok(format!("Pull request #{}: {}", pr.number, pr.url))
            }
            other => Err(ForgeError::Tool(format!("Unknown tool: {}", other))),
        }
    }

    fn read_file(&self, input: &Value) -> Result<String> {
        let path = required_str(input, "path")?;
        let content = self.sandbox.read_file(path)?;
        let mode = optional_str(input, "mode").unwrap_or("full");

        match mode {
            "range" => {
                let start = input
                    .get("start_line")
                    .and_then(Value::as_u64)
                    .unwrap_or(1)
                    .max(1) as usize;
                let end = input
                    .get("end_line")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(usize::MAX);
                if end < start {
                    return Err(ForgeError::Tool(format!(
                        "end_line ({}) is before start_line ({})",
                        end, start
                    )));
                }
                let total = content.lines().count();
                let mut out = String::new();
                for (number, line) in content
                    .lines()
                    .enumerate()
                    .skip(start - 1)
                    .take(end - start + 1)
                {
                    out.push_str(&format!("{:>5}: {}\n", number + 1, line));
                }
                if out.is_empty() {
                    return Err(ForgeError::Tool(format!(
                        "{} has {} lines; start_line {} is past the end",
                        path, total, start
                    )));
                }
                Ok(out)
            }
            "summary" => Ok(summary::structural_summary(&content, MAX_SUMMARY_LINES)),
            "full" => {
                let chars = content.chars().count();
                let total_lines = content.lines().count();
                if chars <= SMALL_FILE_CHARS {
                    Ok(content)
                } else if chars <= LARGE_FILE_CHARS {
                    let mut out = summary::truncate_with_marker(&content, SMALL_FILE_CHARS);
                    out.push_str(&format!(
                        "\n[{} has {} lines; use mode \"range\" with start_line/end_line to read the rest]",
                        path, total_lines
                    ));
                    Ok(out)
                } else {
                    let mut out = summary::structural_summary(&content, MAX_SUMMARY_LINES);
                    out.push_str(&format!(
                        "\n[{} is large ({} lines); showing structure only. Use mode \"range\" to read sections]",
                        path, total_lines
                    ));
                    Ok(out)
                }
            }
            other => Err(ForgeError::Tool(format!(
                "Unknown read mode '{}'; use full, range, or summary",
                other
            ))),
        }
    }
}

#[async_trait]
impl ToolHandler for ToolExecutor {
    async fn handle(&self, ctx: &mut ToolContext, name: &str, input: &Value) -> ToolOutcome {
        info!(
            "[{}] tool {} {}",
            ctx.execution_id,
            name,
            preview(&input.to_string(), LOG_PREVIEW_CHARS)
        );

        match self.dispatch(ctx, name, input).await {
            Ok(content) => ToolOutcome::ok(content),
            Err(e) => {
                warn!("[{}] tool {} failed: {}", ctx.execution_id, name, e);
                ToolOutcome::error(e.to_string())
            }
        }
    }
}

fn required_str<'a>(input: &'a Value, key: &str) -> Result<&'a str> {
    input
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ForgeError::Tool(format!("Missing required parameter '{}'", key)))
}

fn optional_str<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::SandboxConfig;
    use forge_vcs::{GitOutput, MockCodeHost, MockGitExecutor};
    use tempfile::TempDir;

    fn executor(git: MockGitExecutor) -> (TempDir, ToolExecutor) {
        let temp_dir = TempDir::new().unwrap();
        let sandbox = Sandbox::new(&SandboxConfig {
            repo_root: temp_dir.path().to_path_buf(),
            ..SandboxConfig::default()
        })
        .unwrap();
        let vcs = VcsWorkflow::new(Arc::new(git), Arc::new(MockCodeHost::new()));
        (temp_dir, ToolExecutor::new(Arc::new(sandbox), vcs))
    }

    fn context() -> ToolContext {
        ToolContext::new("exec-1", "ticket-1", "T-1")
    }

    #[test]
    fn test_definitions_have_required_fields() {
        let defs = tool_definitions();
        assert_eq!(defs.len(), 8);
        for def in &defs {
            assert_eq!(def.input_schema["type"], "object");
        }
        let read = defs.iter().find(|d| d.name == "read_file").unwrap();
        assert_eq!(read.input_schema["required"], json!(["path"]));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_dir, executor) = executor(MockGitExecutor::new());
        let mut ctx = context();

        let out = executor
            .handle(
                &mut ctx,
                "write_file",
                &json!({"path": "src/a.txt", "content": "one\ntwo\nthree"}),
            )
            .await;
        assert!(!out.is_error, "{}", out.content);

        let out = executor.handle(&mut ctx, "read_file", &json!({"path": "src/a.txt"})).await;
        assert_eq!(out, ToolOutcome::ok("one\ntwo\nthree"));

        let out = executor
            .handle(
                &mut ctx,
                "read_file",
                &json!({"path": "src/a.txt", "mode": "range", "start_line": 2, "end_line": 3}),
            )
            .await;
        assert_eq!(out.content, "    2: two\n    3: three\n");
    }

    #[tokio::test]
    async fn test_read_large_file_is_summarized() {
        let (dir, executor) = executor(MockGitExecutor::new());
        let body = "pub fn item() -> u32 {\n    42\n}\n".repeat(2_000);
        std::fs::write(dir.path().join("big.rs"), &body).unwrap();

        let out = executor
            .handle(&mut context(), "read_file", &json!({"path": "big.rs"}))
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("structural summary"));
        assert!(out.content.len() < body.len());
    }

    #[tokio::test]
    async fn test_violations_become_error_results() {
        let (_dir, executor) = executor(MockGitExecutor::new());
        let mut ctx = context();

        let out = executor.handle(&mut ctx, "read_file", &json!({"path": "../etc/passwd"})).await;
        assert!(out.is_error);

        let out = executor
            .handle(&mut ctx, "run_command", &json!({"command": "git reset --hard"}))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("not allowed"));

        let out = executor.handle(&mut ctx, "write_file", &json!({"path": "x"})).await;
        assert!(out.is_error);
        assert!(out.content.contains("content"));

        let out = executor.handle(&mut ctx, "teleport", &json!({})).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn test_read_only_tool_set() {
        let (_dir, executor) = executor(MockGitExecutor::new());
        let executor = executor.with_tool_set(ToolSet::ReadOnly);
        assert_eq!(executor.definitions().len(), 3);

        let out = executor
            .handle(&mut context(), "write_file", &json!({"path": "a", "content": "b"}))
            .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn test_vcs_tools_update_context() {
        let git = MockGitExecutor::new()
            .with_response("diff --cached --name-only", GitOutput::ok("a.txt\n"))
            .with_response("rev-parse HEAD", GitOutput::ok("deadbeef\n"));
        let (_dir, executor) = executor(git.clone());
        let mut ctx = context();

        let out = executor
            .handle(&mut ctx, "create_pull_request", &json!({"title": "t", "body": "b"}))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("create_branch"));

        let out = executor.handle(&mut ctx, "create_branch", &json!({"slug": "fix login"})).await;
        assert_eq!(out.content, "Created branch forge/t-1/fix-login");

        let out = executor
            .handle(&mut ctx, "commit_changes", &json!({"message": "Fix login"}))
            .await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("forge/t-1/fix-login"));
        assert_eq!(git.current_branch(), "main");

        let out = executor
            .handle(&mut ctx, "create_pull_request", &json!({"title": "Fix login", "body": "Done"}))
            .await;
        assert!(!out.is_error);
        assert_eq!(ctx.pr_number, Some(1));
    }
}
