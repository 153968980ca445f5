mod cli;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::error;

/// Loom: a module runtime with hot-reloadable plugins
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Configuration file (JSON, TOML or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start every module and run until Ctrl-C
    Run {
        /// Shut down as soon as start-up completes
        #[arg(long)]
        once: bool,
    },
    /// Print the initialization order
    Order,
    /// List registered modules and their dependencies
    Modules,
    /// Inspect the plugins directory
    Plugins {
        #[command(subcommand)]
        command: PluginCommand,
    },
    /// Start the kernel and dispatch a single request
    Call {
        /// HTTP method, e.g. GET
        method: String,
        /// Request path, e.g. /core-health/health
        path: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
        /// Bearer token sent with the request
        #[arg(long)]
        token: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum PluginCommand {
    /// List plugin libraries that would be loaded
    Scan,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let env = env_logger::Env::default().default_filter_or(level);
    if let Err(e) = env_logger::Builder::from_env(env).try_init() {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_logging(args.verbose);

    let config = match cli::load_config(args.config.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("Initializing kernel...");
    let kernel = match cli::assemble(config).await {
        Ok(kernel) => kernel,
        Err(e) => {
            eprintln!("Failed to initialize kernel: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = match args.command.unwrap_or(Commands::Run { once: false }) {
        Commands::Run { once } => cli::run(&kernel, once).await,
        Commands::Order => cli::order(&kernel).await,
        Commands::Modules => cli::modules(&kernel).await,
        Commands::Plugins {
            command: PluginCommand::Scan,
        } => cli::scan(kernel.config()).await,
        Commands::Call {
            method,
            path,
            body,
            token,
        } => {
            let (body, token) = (body.as_deref(), token.as_deref());
            cli::call(&kernel, &method, &path, body, token).await
        }
    };

    println!("Shutting down...");
    kernel.shutdown().await;
    report(outcome)
}

fn report(outcome: loom_core::kernel::error::Result<ExitCode>) -> ExitCode {
    outcome.unwrap_or_else(|e| {
        error!("{}", e);
        eprintln!("Error: {}", e);
        ExitCode::FAILURE
    })
}
