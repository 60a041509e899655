//! Sandbox for agent-issued file and process operations
//!
//! Every path is resolved against the repository root and checked against
//! the forbidden list, including the file arguments of allow-listed shell
//! commands. Raw git is limited to read-only subcommands; anything that
//! rewrites history, moves HEAD or touches remotes goes through the
//! dedicated VCS tools.

use crate::summary::truncate_with_marker;
use forge_core::{ForgeError, Result, SandboxConfig};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Git subcommands reserved for the branch/commit/PR tools
const BLOCKED_GIT_SUBCOMMANDS: &[&str] = &[
    "revert",
    "restore",
    "reset",
    "checkout",
    "switch",
    "clean",
    "stash",
    "rebase",
    "merge",
    "cherry-pick",
    "push",
    "pull",
    "fetch",
];

/// Read-only git subcommands the agent may run directly
const ALLOWED_GIT_SUBCOMMANDS: &[&str] = &[
    "status",
    "log",
    "diff",
    "show",
    "branch",
    "blame",
    "grep",
    "rev-parse",
    "ls-files",
    "shortlog",
];

/// Global options accepted before the git subcommand
const ALLOWED_GIT_GLOBAL_OPTIONS: &[&str] = &["--no-pager", "-P"];

/// Git options that relocate the repository, override config or write files
const BLOCKED_GIT_OPTIONS: &[&str] = &[
    "-C",
    "-c",
    "--git-dir",
    "--work-tree",
    "--exec-path",
    "--namespace",
    "--super-prefix",
    "--config-env",
    "--output",
    "--open-files-in-pager",
    "-O",
];

/// `git branch` flags that only list
const BRANCH_LIST_FLAGS: &[&str] = &[
    "-a",
    "--all",
    "-r",
    "--remotes",
    "-v",
    "-vv",
    "--verbose",
    "--show-current",
    "-l",
    "--list",
    "--merged",
    "--no-merged",
    "--contains",
    "--no-color",
];

/// Programs whose positional arguments are file paths
const PATH_ARG_COMMANDS: &[&str] = &["cat", "head", "tail", "wc", "grep", "diff", "find", "ls"];

/// `find` primaries that run programs, delete files or write output
const FIND_ACTIONS: &[&str] = &[
    "-exec", "-execdir", "-ok", "-okdir", "-delete", "-fprint", "-fprint0", "-fprintf", "-fls",
];

const SHELL_METACHARACTERS: &[&str] = &[";", "&", "|", ">", "<", "`", "$(", "\n", "\r"];

/// Output of an allow-listed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Text handed back to the model
    pub fn render(&self) -> String {
        let mut out = match self.exit_code {
            Some(code) => format!("exit code: {}\n", code),
            None => "exit code: none (terminated by signal)\n".to_string(),
        };
        if !self.stdout.is_empty() {
            out.push_str("stdout:\n");
            out.push_str(&self.stdout);
            if !self.stdout.ends_with('\n') {
                out.push('\n');
            }
        }
        if !self.stderr.is_empty() {
            out.push_str("stderr:\n");
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Path and command policy bound to one repository root
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    forbidden: Vec<glob::Pattern>,
    allowed_commands: Vec<String>,
    timeout: Duration,
    max_output_chars: usize,
}

impl Sandbox {
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let root = config.repo_root.canonicalize().map_err(|e| {
            ForgeError::Config(format!(
                "Sandbox root {} is not accessible: {}",
                config.repo_root.display(),
                e
            ))
        })?;

        let forbidden = config
            .forbidden_paths
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| {
                    ForgeError::Config(format!("Invalid forbidden path pattern '{}': {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root,
            forbidden,
            allowed_commands: config.allowed_commands.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
            max_output_chars: config.max_output_chars,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a requested path inside the root, rejecting escapes and forbidden files
    pub fn safe_path(&self, requested: &str) -> Result<PathBuf> {
        let requested = requested.trim();
        let candidate = if requested.is_empty() {
            self.root.clone()
        } else if Path::new(requested).is_absolute() {
            PathBuf::from(requested)
        } else {
            self.root.join(requested)
        };

        let resolved = normalize(&candidate);
        if !resolved.starts_with(&self.root) {
            return Err(ForgeError::PathValidation(format!(
                "Path escapes the repository: {}",
                requested
            )));
        }

        let relative = resolved.strip_prefix(&self.root).unwrap_or(Path::new(""));
        if self.is_forbidden(relative) {
            return Err(ForgeError::PathValidation(format!(
                "Access to protected path is not allowed: {}",
                requested
            )));
        }

        // Symlinks inside the tree may still point outside it
        if let Ok(real) = resolved.canonicalize() {
            if !real.starts_with(&self.root) {
                return Err(ForgeError::PathValidation(format!(
                    "Path resolves outside the repository: {}",
                    requested
                )));
            }
        }

        Ok(resolved)
    }

    /// Path relative to the root, for display
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    fn is_forbidden(&self, relative: &Path) -> bool {
        let whole = relative.to_string_lossy();
        if self.forbidden.iter().any(|p| p.matches(&whole)) {
            return true;
        }

        relative.components().any(|component| match component {
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                self.forbidden.iter().any(|p| p.matches(&name))
            }
            _ => false,
        })
    }

    /// Validate a shell command and split it into program and arguments
    pub fn check_command(&self, command: &str) -> Result<Vec<String>> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ForgeError::CommandRejected("Empty command".to_string()));
        }

        if let Some(meta) = SHELL_METACHARACTERS.iter().find(|m| command.contains(*m)) {
            return Err(ForgeError::CommandRejected(format!(
                "Shell operator '{}' is not allowed; run one command at a time",
                meta.escape_default()
            )));
        }

        let args = split_args(command)?;
        let program = args[0].as_str();

        if program.contains('/') || !self.allowed_commands.iter().any(|c| c == program) {
            return Err(ForgeError::CommandRejected(format!(
                "'{}' is not an allowed command. Allowed: {}",
                program,
                self.allowed_commands.join(", ")
            )));
        }

        if program == "git" {
            check_git_args(&args[1..])?;
        }
        if PATH_ARG_COMMANDS.contains(&program) {
            self.check_path_args(program, &args[1..])?;
        }

        Ok(args)
    }

    /// Run every file argument of a path-taking command through `safe_path`
    fn check_path_args(&self, program: &str, args: &[String]) -> Result<()> {
        if program == "find" {
            if let Some(action) = args.iter().find(|a| FIND_ACTIONS.contains(&a.as_str())) {
                return Err(ForgeError::CommandRejected(format!(
                    "find action '{}' is not allowed",
                    action
                )));
            }
        }

        // grep takes its pattern as the first positional unless -e/-f supply it
        let mut pattern_pending = program == "grep"
            && !args.iter().any(|a| {
                matches!(a.as_str(), "-e" | "-f" | "--regexp" | "--file")
                    || a.starts_with("--regexp=")
                    || a.starts_with("--file=")
            });
        let mut next_is_pattern = false;
        let mut options_done = false;

        for arg in args {
            if next_is_pattern {
                next_is_pattern = false;
                continue;
            }
            if !options_done && arg == "--" {
                options_done = true;
                continue;
            }
            if !options_done && arg.starts_with('-') && arg.len() > 1 {
                if program == "grep" {
                    if matches!(arg.as_str(), "-e" | "--regexp") {
                        next_is_pattern = true;
                        continue;
                    }
                    if arg.starts_with("--regexp=") {
                        continue;
                    }
                    if let Some(file) = arg.strip_prefix("-f").filter(|f| !f.is_empty()) {
                        self.safe_path(file)?;
                        continue;
                    }
                }
                if let Some((_, value)) = arg.split_once('=') {
                    self.safe_path(value)?;
                }
                continue;
            }
            if pattern_pending {
                pattern_pending = false;
                continue;
            }
            self.safe_path(arg)?;
        }

        Ok(())
    }

    /// Run an allow-listed command in the repository root
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn run_command(&self, command: &str) -> Result<CommandOutput> {
        let args = self.check_command(command)?;
        debug!("Running {:?}", args);

        let child = Command::new(&args[0])
            .args(&args[1..])
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(result) => result.map_err(|e| {
                ForgeError::Tool(format!("Failed to run '{}': {}", args[0], e))
            })?,
            Err(_) => {
                warn!("Command timed out after {:?}: {}", self.timeout, command);
                return Err(ForgeError::Tool(format!(
                    "Command timed out after {} seconds: {}",
                    self.timeout.as_secs(),
                    command
                )));
            }
        };

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: truncate_with_marker(
                &String::from_utf8_lossy(&output.stdout),
                self.max_output_chars,
            ),
            stderr: truncate_with_marker(
                &String::from_utf8_lossy(&output.stderr),
                self.max_output_chars,
            ),
        })
    }

    /// Write a file, creating parent directories. Returns true if the file was created.
    pub fn write_file(&self, requested: &str, content: &str) -> Result<bool> {
        let path = self.safe_path(requested)?;
        if path == self.root || path.is_dir() {
            return Err(ForgeError::Tool(format!("{} is a directory", requested)));
        }
        let created = !path.exists();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                info!("Created directory: {}", self.relative(parent).display());
            }
        }

        fs::write(&path, content)?;

        if created {
            info!("Created file: {}", self.relative(&path).display());
        } else {
            info!("Modified file: {}", self.relative(&path).display());
        }

        Ok(created)
    }

    /// Read a UTF-8 file inside the root
    pub fn read_file(&self, requested: &str) -> Result<String> {
        let path = self.safe_path(requested)?;
        if !path.is_file() {
            return Err(ForgeError::Tool(format!("File not found: {}", requested)));
        }
        Ok(fs::read_to_string(&path)?)
    }

    /// Entries under a directory, skipping protected paths
    ///
    /// Directories are suffixed with `/`. Returns the entries and whether
    /// the listing was cut at `max_entries`.
    pub fn list_directory(
        &self,
        requested: &str,
        recursive: bool,
        max_entries: usize,
    ) -> Result<(Vec<String>, bool)> {
        let dir = self.safe_path(requested)?;
        if !dir.is_dir() {
            return Err(ForgeError::Tool(format!("Not a directory: {}", requested)));
        }

        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut entries = Vec::new();
        let mut truncated = false;

        let walker = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.is_forbidden(self.relative(entry.path())));

        for entry in walker.filter_map(|e| e.ok()) {
            if entries.len() >= max_entries {
                truncated = true;
                break;
            }
            let display = self.relative(entry.path()).display().to_string();
            if entry.file_type().is_dir() {
                entries.push(format!("{}/", display));
            } else {
                entries.push(display);
            }
        }

        Ok((entries, truncated))
    }

    /// Regex search over files under `requested`, as `path:line: text`
    ///
    /// `file_glob` filters by file name (for example `*.rs`). Binary and
    /// unreadable files are skipped.
    pub fn search_code(
        &self,
        pattern: &str,
        requested: &str,
        file_glob: Option<&str>,
        max_results: usize,
    ) -> Result<(Vec<String>, bool)> {
        let regex = regex::Regex::new(pattern)
            .map_err(|e| ForgeError::Tool(format!("Invalid search pattern: {}", e)))?;
        let file_filter = file_glob
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| ForgeError::Tool(format!("Invalid file pattern: {}", e)))?;
        let start = self.safe_path(requested)?;

        let mut matches = Vec::new();
        let walker = WalkDir::new(&start)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.is_forbidden(self.relative(entry.path())));

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(filter) = &file_filter {
                if !filter.matches(&entry.file_name().to_string_lossy()) {
                    continue;
                }
            }
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };

            let display = self.relative(entry.path()).display().to_string();
            for (number, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    if matches.len() >= max_results {
                        return Ok((matches, true));
                    }
                    matches.push(format!("{}:{}: {}", display, number + 1, line.trim()));
                }
            }
        }

        Ok((matches, false))
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Split a command line on whitespace, honouring single and double quotes
fn split_args(command: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_arg = false;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_arg = true;
            }
            None if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            None => {
                current.push(c);
                in_arg = true;
            }
        }
    }

    if quote.is_some() {
        return Err(ForgeError::CommandRejected("Unbalanced quotes in command".to_string()));
    }
    if in_arg {
        args.push(current);
    }
    if args.is_empty() {
        return Err(ForgeError::CommandRejected("Empty command".to_string()));
    }
    Ok(args)
}

fn check_git_args(args: &[String]) -> Result<()> {
    for arg in args {
        let option = arg.split('=').next().unwrap_or(arg);
        // -O takes its pager program attached, as in -Ovim
        if BLOCKED_GIT_OPTIONS.contains(&option) || arg.starts_with("-O") {
            return Err(ForgeError::CommandRejected(format!(
                "git option '{}' is not allowed",
                option
            )));
        }
    }

    let mut rest = args.iter();
    let subcommand = loop {
        match rest.next() {
            Some(arg) if ALLOWED_GIT_GLOBAL_OPTIONS.contains(&arg.as_str()) => continue,
            Some(arg) if arg.starts_with('-') => {
                return Err(ForgeError::CommandRejected(format!(
                    "git global option '{}' is not allowed",
                    arg
                )));
            }
            Some(arg) => break arg.as_str(),
            None => return Err(ForgeError::CommandRejected("git needs a subcommand".to_string())),
        }
    };

    if BLOCKED_GIT_SUBCOMMANDS.contains(&subcommand) {
        return Err(ForgeError::CommandRejected(format!(
            "'git {}' is not allowed; use the create_branch, commit_changes and \
             create_pull_request tools for version control",
            subcommand
        )));
    }
    if !ALLOWED_GIT_SUBCOMMANDS.contains(&subcommand) {
        return Err(ForgeError::CommandRejected(format!(
            "'git {}' is not allowed. Allowed: {}",
            subcommand,
            ALLOWED_GIT_SUBCOMMANDS.join(", ")
        )));
    }

    if subcommand == "branch" {
        let lists_only = rest.all(|a| {
            let flag = a.split('=').next().unwrap_or(a);
            BRANCH_LIST_FLAGS.contains(&flag)
        });
        if !lists_only {
            return Err(ForgeError::CommandRejected(
                "'git branch' may only list branches; use the create_branch tool".to_string(),
            ));
        }
    }

    Ok(())
}
