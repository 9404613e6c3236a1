//! inkwell CLI: the main entry point.
//!
//! Commands:
//! - `config`    Show, validate or initialise configuration
//! - `job`       Submit a plugin job and follow it to completion
//! - `generate`  Generate a chapter into a document
//! - `write`     Run the multi-chapter AgentWriter
//! - `stream`    Stream one AI completion into a session step
//! - `ask`       Run the function-calling loop

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod runtime;

#[derive(Parser)]
#[command(
    name = "inkwell",
    about = "inkwell: async jobs, streaming generation and agent workflows",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Config file (defaults to ~/.inkwell/config.toml)
    #[arg(short, long, global = true, env = "INKWELL_CONFIG")]
    config: Option<PathBuf>,

    /// Acting user id
    #[arg(long, global = true, default_value_t = 1)]
    user: i64,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Submit a plugin job and print its events until it finishes
    Job {
        /// Owning session; a new one is created when omitted
        #[arg(long)]
        session: Option<i64>,
        #[arg(long, default_value_t = 1)]
        project: i64,
        #[arg(long)]
        plugin: i64,
        #[arg(long)]
        method: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Credential forwarded to the plugin
        #[arg(long, env = "INKWELL_PLUGIN_AUTH")]
        auth: Option<String>,
    },

    /// Generate a chapter with one AI call
    Generate {
        #[arg(long)]
        project: i64,
        #[arg(long)]
        title: Option<String>,
        /// Existing document to overwrite
        #[arg(long)]
        document: Option<i64>,
        #[arg(long)]
        session: Option<i64>,
        #[arg(long)]
        provider: String,
        #[arg(long)]
        path: String,
        /// Request body, or `@file` to read it from disk
        #[arg(long)]
        body: String,
    },

    /// Write a whole outline chapter by chapter
    Write {
        #[arg(long)]
        project: i64,
        #[arg(long)]
        document: i64,
        #[arg(long)]
        prompt: String,
        /// JSON file holding `[{"title": ..., "outline": ...}]`
        #[arg(long)]
        outline: PathBuf,
        #[arg(long)]
        provider: String,
        #[arg(long, default_value = "chat/completions")]
        path: String,
        #[arg(long)]
        model: Option<String>,
        /// Resume this session instead of starting a new run
        #[arg(long)]
        resume: Option<i64>,
    },

    /// Stream one AI completion into a session step
    Stream {
        #[arg(long)]
        session: Option<i64>,
        #[arg(long, default_value_t = 1)]
        project: i64,
        #[arg(long)]
        provider: String,
        #[arg(long, default_value = "chat/completions")]
        path: String,
        /// Request body, or `@file` to read it from disk
        #[arg(long)]
        body: String,
        /// Deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Ask a question the model may answer using configured tools
    Ask {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        session: Option<i64>,
        #[arg(long, default_value_t = 1)]
        project: i64,
        /// Provider used for the tool-calling model
        #[arg(long)]
        provider: String,
        #[arg(long)]
        max_turns: Option<usize>,
        #[arg(long, env = "INKWELL_PLUGIN_AUTH")]
        auth: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Validate the configuration
    Validate,
    /// Print the config file path
    Path,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config_path = cli.config.as_deref();
    let user = cli.user;

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(config_path).await?,
            ConfigAction::Validate => commands::config_cmd::validate(config_path).await?,
            ConfigAction::Path => commands::config_cmd::path(config_path).await?,
            ConfigAction::Init { force } => commands::config_cmd::init(config_path, force).await?,
        },
        Commands::Job {
            session,
            project,
            plugin,
            method,
            payload,
            auth,
        } => {
            let args = commands::job::JobArgs {
                user,
                session,
                project,
                plugin,
                method,
                payload,
                auth,
            };
            commands::job::run(config_path, args).await?
        }
        Commands::Generate {
            project,
            title,
            document,
            session,
            provider,
            path,
            body,
        } => {
            let args = commands::generate::GenerateArgs {
                user,
                project,
                title,
                document,
                session,
                provider,
                path,
                body,
            };
            commands::generate::run(config_path, args).await?
        }
        Commands::Write {
            project,
            document,
            prompt,
            outline,
            provider,
            path,
            model,
            resume,
        } => {
            let args = commands::write::WriteArgs {
                user,
                project,
                document,
                prompt,
                outline,
                provider,
                path,
                model,
                resume,
            };
            commands::write::run(config_path, args).await?
        }
        Commands::Stream {
            session,
            project,
            provider,
            path,
            body,
            timeout,
        } => {
            let args = commands::stream::StreamArgs {
                user,
                session,
                project,
                provider,
                path,
                body,
                timeout,
            };
            commands::stream::run(config_path, args).await?
        }
        Commands::Ask {
            prompt,
            session,
            project,
            provider,
            max_turns,
            auth,
        } => {
            let args = commands::ask::AskArgs {
                user,
                prompt,
                session,
                project,
                provider,
                max_turns,
                auth,
            };
            commands::ask::run(config_path, args).await?
        }
    }

    Ok(())
}
