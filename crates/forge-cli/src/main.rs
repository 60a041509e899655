//! Forge CLI - run autonomous coding-agent sessions against tickets
//!
//! Usage:
//!   forge init                          Write a default .forge/config.toml
//!   forge run --ticket <file.json>      Run one execution for a ticket
//!   forge status                        Show credentials and rate-limit status
//!   forge protocols                     List the available protocols

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use forge_agent::{AnthropicClient, LlmClient, ProtocolRegistry, Sandbox, DEFAULT_PROTOCOL};
use forge_core::{Execution, ExecutionStatus, ForgeConfig, Ticket};
use forge_orchestrator::{
    DecisionMatcher, KeywordDecisionMatcher, MemoryStore, NoDecisions, Orchestrator, Store,
    TokenRateLimiter,
};
use forge_vcs::{GitCommand, GitHubHost, VcsWorkflow};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "forge")]
#[command(author, version, about = "Autonomous coding-agent executions against tickets")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Repository path
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default .forge/config.toml
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Run one execution for a ticket
    Run {
        /// Ticket JSON file
        #[arg(long, value_name = "FILE")]
        ticket: PathBuf,

        /// Protocol name
        #[arg(long, default_value = DEFAULT_PROTOCOL)]
        protocol: String,

        /// Extra instructions for the agent
        #[arg(long)]
        prompt: Option<String>,

        /// JSON file with prior decisions to match against the ticket
        #[arg(long, value_name = "FILE")]
        decisions: Option<PathBuf>,
    },

    /// Show credentials and rate-limit status
    Status,

    /// List the available protocols
    Protocols,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { force } => cmd_init(&cli.repo, force),
        Commands::Run {
            ticket,
            protocol,
            prompt,
            decisions,
        } => cmd_run(&cli.repo, ticket, protocol, prompt, decisions).await,
        Commands::Status => cmd_status(&cli.repo),
        Commands::Protocols => cmd_protocols(),
    }
}

fn cmd_init(repo: &Path, force: bool) -> Result<()> {
    let config_path = repo.join(".forge/config.toml");
    if config_path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", config_path.display());
        return Ok(());
    }

    let written = ForgeConfig::write_default(repo).context("Failed to write config")?;
    println!("Initialized Forge in {}", repo.display());
    println!("Created:");
    println!("  {}", written.display());
    println!("\nSet [hosting] owner and repo before running executions that open pull requests.");
    Ok(())
}

fn load_config(repo: &Path) -> Result<ForgeConfig> {
    let mut config = ForgeConfig::load_or_default(repo)
        .with_context(|| format!("Failed to load config from {}", repo.display()))?;
    if config.sandbox.repo_root.is_relative() {
        config.sandbox.repo_root = repo.join(&config.sandbox.repo_root);
    }
    Ok(config)
}

async fn cmd_run(
    repo: &Path,
    ticket_path: PathBuf,
    protocol: String,
    prompt: Option<String>,
    decisions_path: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(repo)?;

    let content = tokio::fs::read_to_string(&ticket_path)
        .await
        .with_context(|| format!("Failed to read ticket file {}", ticket_path.display()))?;
    let ticket: Ticket = serde_json::from_str(&content).context("Failed to parse ticket JSON")?;

    let git = GitCommand::detect(&config.sandbox.repo_root)
        .await
        .context("Forge must run inside a git repository")?;
    let host = GitHubHost::from_config(&config.hosting)
        .context("Configure [hosting] in .forge/config.toml")?;
    let vcs = VcsWorkflow::new(Arc::new(git), Arc::new(host))
        .with_base_branch(&config.hosting.base_branch)
        .with_remote(&config.hosting.remote);
    let sandbox = Sandbox::new(&config.sandbox).context("Failed to set up sandbox")?;

    let decisions: Arc<dyn DecisionMatcher> = match &decisions_path {
        Some(path) => Arc::new(
            KeywordDecisionMatcher::from_json_file(path)
                .with_context(|| format!("Failed to load decisions from {}", path.display()))?,
        ),
        None => Arc::new(NoDecisions),
    };

    let execution_id = uuid::Uuid::new_v4().to_string();
    let mut execution = Execution::new(&execution_id, &ticket.id, &protocol);
    execution.prompt = prompt;

    let store = Arc::new(MemoryStore::new());
    store.insert_ticket(ticket.clone()).await;
    store.insert_execution(execution).await;

    let client = Arc::new(AnthropicClient::from_config(&config.llm));
    let orchestrator = Orchestrator::new(config, store.clone(), client, Arc::new(sandbox), vcs)
        .with_decisions(decisions);

    info!("Running execution {} for {}", execution_id, ticket.identifier);
    let mut handle = orchestrator
        .start_execution(&execution_id)
        .context("Failed to start execution")?;

    let finished = tokio::select! {
        joined = &mut handle => Some(joined),
        _ = tokio::signal::ctrl_c() => None,
    };
    let joined = match finished {
        Some(joined) => joined,
        None => {
            warn!("Interrupted; cancelling execution {}", execution_id);
            orchestrator
                .cancel(&execution_id)
                .await
                .context("Failed to cancel execution")?;
            handle.await
        }
    };
    let result = joined.context("Execution task panicked")?;

    let execution = store.get_execution(&execution_id).await?;
    let ticket = store.get_ticket(&ticket.id).await?;

    println!("Execution {}: {}", execution.id, execution.status);
    println!(
        "Tokens: {} input, {} output (${:.4})",
        execution.input_tokens, execution.output_tokens, execution.cost_usd
    );
    if let Some(branch) = &ticket.branch_name {
        println!("Branch: {}", branch);
    }
    if let Some(url) = &ticket.pr_url {
        println!("Pull request: {}", url);
    }
    println!("Ticket status: {}", ticket.status);
    println!("\n{}", execution.execution_log);

    result.context("Execution failed")?;
    if execution.status != ExecutionStatus::Completed {
        warn!("Execution finished in status {}", execution.status);
    }
    Ok(())
}

fn cmd_status(repo: &Path) -> Result<()> {
    let config = load_config(repo)?;
    let client = AnthropicClient::from_config(&config.llm);
    let limiter = TokenRateLimiter::spawn(&config.rate_limit);

    println!("Repository: {}", config.sandbox.repo_root.display());
    println!(
        "LLM credentials ({}): {}",
        config.llm.api_key_env,
        if client.is_configured() {
            "configured"
        } else {
            "missing"
        }
    );
    if config.hosting.owner.is_empty() || config.hosting.repo.is_empty() {
        println!("Code host: not configured");
    } else {
        println!(
            "Code host: {}/{} via {} (base {})",
            config.hosting.owner,
            config.hosting.repo,
            config.hosting.api_url,
            config.hosting.base_branch
        );
    }

    println!("\nRate limiter:");
    println!("{}", serde_json::to_string_pretty(&limiter.status())?);
    Ok(())
}

fn cmd_protocols() -> Result<()> {
    let registry = ProtocolRegistry::new();
    println!("Protocols:");
    for name in registry.names() {
        let protocol = registry.resolve(name);
        println!(
            "  {:<10} {:<30} tools: {:?}, ~{} tokens, up to {} iterations",
            protocol.name,
            protocol.model.api_name(),
            protocol.tools,
            protocol.estimated_tokens,
            protocol.max_iterations
        );
    }
    Ok(())
}
