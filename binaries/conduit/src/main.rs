mod agent;
mod commands;
mod config;
mod engine;
mod worker;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::deploy::DeployOptions;
use crate::config::Config;

/// Remote command execution through broker-held mailboxes: deploy scripts to
/// fleets of workers and collect their responses.
#[derive(Parser)]
#[command(name = "conduit", version)]
struct Cli {
    /// Config file path.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print debug information.
    #[arg(short, long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in client mode, executing scripts as they arrive.
    #[command(alias = "client")]
    Run {
        /// Process a single message and exit.
        #[arg(short = '1', long)]
        one: bool,
    },
    /// Run the message broker, or manage its local database.
    Server {
        #[command(subcommand)]
        action: Option<ServerAction>,
    },
    /// Run the agent listener for peer-to-peer script fragments.
    Agent,
    /// Send a script to be executed, or inspect past deployments.
    #[command(alias = "send")]
    Deploy(DeployArgs),
    /// Register a new mailbox on the remote broker.
    Register { mailbox: String },
    /// Remove a mailbox, its access keys, and its messages.
    Deregister { mailbox: String },
    /// Purge all pending messages for a mailbox on the local server.
    Purge { mailbox: String },
    /// Execute a script file locally.
    #[command(alias = "exec")]
    Execute { script: PathBuf },
    /// Broker statistics.
    Info {
        #[command(subcommand)]
        action: Option<InfoAction>,
    },
}

#[derive(Args)]
#[command(args_conflicts_with_subcommands = true)]
struct DeployArgs {
    #[command(subcommand)]
    action: Option<DeployAction>,
    /// Script file to deploy.
    script: Option<PathBuf>,
    /// Target mailboxes.
    mailboxes: Vec<String>,
    /// Wildcard search for mailboxes.
    #[arg(short, long, default_value = "")]
    pattern: String,
    /// A custom name for this deployment.
    #[arg(short, long, default_value = "")]
    name: String,
    /// Attach a file asset to this deployment.
    #[arg(short, long)]
    attach: Option<PathBuf>,
    /// Don't poll for responses.
    #[arg(short = 'x', long)]
    no_results: bool,
    /// Response polling timeout in seconds.
    #[arg(short, long, default_value_t = 20)]
    timeout: u64,
    /// Expand results instead of consolidating identical responses.
    #[arg(short, long)]
    expand: bool,
}

#[derive(Subcommand)]
enum DeployAction {
    /// Get responses and statistics for one deployment.
    Get {
        deployment: String,
        #[arg(short, long)]
        expand: bool,
    },
    /// List past deployments.
    List {
        /// Maximum number of deployments to return.
        #[arg(short, long, default_value_t = 10)]
        count: i64,
        /// Search pattern over deployment names.
        #[arg(short, long, default_value = "")]
        name: String,
        /// Include deployments made with other access keys.
        #[arg(short, long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum ServerAction {
    /// Generate or manage full-access API keys for the local server.
    Access(AccessArgs),
    /// Register a new mailbox directly in the local database.
    Register { mailbox: String },
}

#[derive(Args)]
#[command(args_conflicts_with_subcommands = true)]
struct AccessArgs {
    #[command(subcommand)]
    action: Option<AccessAction>,
    /// Name for the new key; random when omitted.
    name: Option<String>,
}

#[derive(Subcommand)]
enum AccessAction {
    /// List all access keys.
    List,
    /// Revoke an access key by name.
    Revoke { name: String },
}

#[derive(Subcommand)]
enum InfoAction {
    /// Connection status of every mailbox.
    Clients {
        /// Show only offline clients.
        #[arg(short = 'x', long)]
        offline: bool,
        /// Show additional client information.
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { one } => worker::run(&config, one).await,
        Command::Agent => agent::run(&config).await,
        Command::Server { action: None } => commands::server::run(&config).await,
        Command::Server {
            action: Some(ServerAction::Access(args)),
        } => match args.action {
            None => commands::server::access_create(&config, args.name).await,
            Some(AccessAction::List) => commands::server::access_list(&config).await,
            Some(AccessAction::Revoke { name }) => {
                commands::server::access_revoke(&config, &name).await
            }
        },
        Command::Server {
            action: Some(ServerAction::Register { mailbox }),
        } => commands::server::register_local(&config, &mailbox).await,
        Command::Deploy(args) => match args.action {
            Some(DeployAction::Get { deployment, expand }) => {
                commands::deploy::get(&config, &deployment, expand).await
            }
            Some(DeployAction::List { count, name, all }) => {
                commands::deploy::list(&config, count, &name, all).await
            }
            None => {
                let script = args.script.context("no script specified")?;
                commands::deploy::deploy(
                    &config,
                    DeployOptions {
                        script,
                        mailboxes: args.mailboxes,
                        pattern: args.pattern,
                        name: args.name,
                        attach: args.attach,
                        no_results: args.no_results,
                        timeout: args.timeout,
                        expand: args.expand,
                    },
                )
                .await
            }
        },
        Command::Register { mailbox } => commands::admin::register(&config, &mailbox).await,
        Command::Deregister { mailbox } => commands::admin::deregister(&config, &mailbox).await,
        Command::Purge { mailbox } => commands::server::purge(&config, &mailbox).await,
        Command::Execute { script } => commands::execute(&config, &script).await,
        Command::Info { action: None } => commands::info::system(&config).await,
        Command::Info {
            action: Some(InfoAction::Clients { offline, verbose }),
        } => commands::info::clients(&config, offline, verbose).await,
    }
}
