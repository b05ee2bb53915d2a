mod call;
mod jobs;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "aion", about = "Scheduled agent jobs: gateway and client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Gateway WebSocket server and the job scheduler
    Gateway {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Directory holding the database (overrides config)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
    /// List stored jobs straight from the database
    Jobs {
        /// Only show jobs of this conversation
        #[arg(short, long)]
        conversation: Option<String>,

        /// Directory holding the database (overrides config)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
    /// Call a JSON-RPC method on a running Gateway
    Call {
        /// Method name (e.g. "cron.listJobs")
        method: String,

        /// Params as a JSON document
        #[arg(short, long, default_value = "{}")]
        params: String,

        /// Gateway WebSocket URL
        #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
        url: String,

        /// Bearer token for authentication
        #[arg(long)]
        token: Option<String>,

        /// Keep the connection open and print pushed events
        #[arg(short, long)]
        watch: bool,
    },
    /// Show the effective configuration
    Health,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Gateway { port, data_dir } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let mut config = load_config();
                if data_dir.is_some() {
                    config.data_dir = data_dir;
                }
                aion_gateway::start_gateway(config, port)
                    .await
                    .map_err(|e| anyhow::anyhow!("{e}"))
            })?;
        }
        Commands::Jobs {
            conversation,
            data_dir,
        } => {
            let mut config = load_config();
            if data_dir.is_some() {
                config.data_dir = data_dir;
            }
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(jobs::run_jobs(config, conversation))?;
        }
        Commands::Call {
            method,
            params,
            url,
            token,
            watch,
        } => {
            let params: serde_json::Value = serde_json::from_str(&params)
                .map_err(|e| anyhow::anyhow!("--params is not valid JSON: {e}"))?;
            let token = token.or_else(|| load_config().gateway.auth_token);
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(call::run_call(method, params, url, token, watch))?;
        }
        Commands::Health => {
            let config = load_config();
            println!("aion is healthy");
            println!("  gateway: {}:{}", config.gateway.host, config.gateway.port);
            println!("  auth: {}", if config.gateway.auth_token.is_some() { "token" } else { "none" });
            match config.database_path() {
                Ok(path) => println!("  database: {}", path.display()),
                Err(e) => println!("  database: unavailable ({e})"),
            }
            println!(
                "  jobs per conversation: {}",
                match config.cron.max_jobs_per_conversation {
                    0 => "unlimited".to_string(),
                    n => n.to_string(),
                }
            );
            println!(
                "  busy retries: {} every {}ms",
                config.cron.max_retries, config.cron.busy_retry_delay_ms
            );
        }
    }

    Ok(())
}

fn load_config() -> aion_config::AionConfig {
    aion_config::load_config().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {e}");
        aion_config::AionConfig::default()
    })
}
