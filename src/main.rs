//! m365-mcp command line host.
//!
//! Runs the tool registry from a terminal: sign in, inspect the session,
//! list tools and call them with JSON arguments.

#![deny(clippy::all)]

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use is_terminal::IsTerminal;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use m365_mcp::auth::{
    AzureAdProvider, CredentialBroker, FlowKind, PendingFlow, SessionSnapshot, UserPrompt,
};
use m365_mcp::config::Config;
use m365_mcp::graph::GraphClient;
use m365_mcp::settings;
use m365_mcp::store::{FileTokenStore, MemoryTokenStore, TokenStore};
use m365_mcp::tools::ToolRegistry;

#[derive(Debug, Parser)]
#[command(name = "m365-mcp", version, about = "Microsoft 365 Graph tools with a managed Azure AD session")]
struct Cli {
    /// Refuse POST, PUT, PATCH and DELETE requests.
    #[arg(long, global = true)]
    read_only: bool,

    /// Log to stderr instead of the log file.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Keep credentials in memory only.
    #[arg(long, global = true)]
    no_token_cache: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in interactively.
    Login {
        /// Use the browser redirect flow instead of a device code.
        #[arg(long)]
        browser: bool,
        /// Sign out first.
        #[arg(long)]
        force: bool,
    },
    /// Sign out and delete cached credentials.
    Logout,
    /// Show the session state.
    Status,
    /// List available tools.
    Tools,
    /// Call a tool.
    Call {
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

/// Prints sign-in instructions for a person at the terminal.
struct TerminalPrompt;

impl UserPrompt for TerminalPrompt {
    fn present(&self, flow: &PendingFlow) {
        eprintln!("\n{}\n", flow.message);
    }
}

/// `call` is the only command that requests tokens implicitly.
fn prompts_for_sign_in(command: &Command, interactive: bool) -> bool {
    interactive && matches!(command, Command::Call { .. })
}

fn main() -> ExitCode {
    // .env is optional
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let cli = Cli::parse();

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            eprintln!("\nPlease set the following environment variables:");
            eprintln!("  MS365_MCP_CLIENT_ID=<your-azure-ad-client-id>");
            eprintln!("  MS365_MCP_TENANT_ID=<your-tenant-id or 'common'>");
            return ExitCode::FAILURE;
        }
    };
    if cli.read_only {
        config.api.read_only = true;
    }

    let log_file = init_logging(cli.verbose, &config);
    info!("Starting {} v{}", config.app.name, env!("CARGO_PKG_VERSION"));

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli, config)) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            if let Some(path) = log_file {
                eprintln!("See {} for details.", path.display());
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: Config) -> Result<ExitCode> {
    let store: Arc<dyn TokenStore> = if cli.no_token_cache {
        Arc::new(MemoryTokenStore::new())
    } else {
        Arc::new(FileTokenStore::new(config.token_cache_dir()))
    };
    let provider =
        Arc::new(AzureAdProvider::from_config(&config).context("Failed to create OAuth client")?);

    let mut broker = CredentialBroker::new(provider, store, config.broker_config());
    if prompts_for_sign_in(&cli.command, std::io::stderr().is_terminal()) {
        broker = broker.with_prompt(Arc::new(TerminalPrompt));
    }
    let broker = Arc::new(broker);

    let graph = GraphClient::new(Arc::clone(&broker), config.graph_config())
        .context("Failed to create Graph client")?;
    let registry = ToolRegistry::new(graph);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Command::Login { browser, force } => {
            if force {
                broker.sign_out().await;
            }
            let kind = if browser {
                FlowKind::AuthorizationCode
            } else {
                FlowKind::DeviceCode
            };
            let pending = broker.start_interactive_flow(kind, &cancel).await?;
            TerminalPrompt.present(&pending);
            let record = broker
                .complete_interactive_flow(pending.handle, &cancel)
                .await?;
            println!(
                "Signed in as {}",
                record.username.as_deref().unwrap_or("unknown user")
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Logout => {
            broker.sign_out().await;
            println!("Signed out.");
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            print_status(&broker.snapshot().await);
            Ok(ExitCode::SUCCESS)
        }
        Command::Tools => {
            for tool in registry.definitions() {
                let marker = if tool.read_only { " " } else { "*" };
                println!("{} {:<28} {}", marker, tool.name, tool.description);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Call { tool, args } => {
            let arguments: Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            let response = registry.call(&tool, arguments, &cancel).await;
            println!("{}", response.text);
            Ok(if response.is_error {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}

fn print_status(snapshot: &SessionSnapshot) {
    println!("Account:  {}", snapshot.account);
    println!("Status:   {}", snapshot.status);
    if let Some(username) = &snapshot.username {
        println!("User:     {}", username);
    }
    if let Some(tenant) = &snapshot.tenant_id {
        println!("Tenant:   {}", tenant);
    }
    if let Some(expires_at) = snapshot.expires_at {
        let remaining = expires_at - Utc::now();
        if remaining > Duration::zero() {
            println!("Token:    expires in {}", format_duration(remaining));
        } else {
            let renewal = if snapshot.has_refresh_token {
                "renewed on next use"
            } else {
                "sign-in required"
            };
            println!("Token:    expired, {}", renewal);
        }
    }
    if let Some(flow) = &snapshot.pending_flow {
        println!("Pending:  {}", flow.message);
    }
}

/// Format a duration for display (e.g., "45 min", "1h 30m").
fn format_duration(duration: Duration) -> String {
    let total_minutes = duration.num_minutes();

    if total_minutes < 1 {
        "< 1 min".to_string()
    } else if total_minutes < 60 {
        format!("{} min", total_minutes)
    } else {
        let hours = total_minutes / 60;
        let mins = total_minutes % 60;
        if mins == 0 {
            format!("{} hour{}", hours, if hours == 1 { "" } else { "s" })
        } else {
            format!("{}h {}m", hours, mins)
        }
    }
}

/// Set up tracing. Returns the log file path when logging to a file.
fn init_logging(verbose: bool, config: &Config) -> Option<PathBuf> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if verbose {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
        return None;
    }

    let log_dir = match settings::init_log_directory() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Warning: Could not create log directory: {:#}", e);
            return None;
        }
    };
    let path = log_dir.join(&config.logging.log_file);
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
            Some(path)
        }
        Err(e) => {
            eprintln!("Warning: Could not open log file {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_call_parsing() {
        let cli = Cli::parse_from([
            "m365-mcp",
            "--read-only",
            "call",
            "list-mail-messages",
            "--args",
            "{\"top\": 5}",
        ]);
        assert!(cli.read_only);
        match cli.command {
            Command::Call { tool, args } => {
                assert_eq!(tool, "list-mail-messages");
                assert_eq!(args, "{\"top\": 5}");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_prompt_only_for_interactive_calls() {
        let call = Cli::parse_from(["m365-mcp", "call", "get-current-user"]).command;
        let status = Cli::parse_from(["m365-mcp", "status"]).command;

        assert!(prompts_for_sign_in(&call, true));
        assert!(!prompts_for_sign_in(&call, false));
        assert!(!prompts_for_sign_in(&status, true));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::seconds(30)), "< 1 min");
        assert_eq!(format_duration(Duration::minutes(5)), "5 min");
        assert_eq!(format_duration(Duration::minutes(60)), "1 hour");
        assert_eq!(format_duration(Duration::minutes(120)), "2 hours");
        assert_eq!(format_duration(Duration::minutes(90)), "1h 30m");
    }
}
