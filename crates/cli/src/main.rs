use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Courier: queue-mediated agent session orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config.json, workspace/AGENTS.md).
    Init {
        /// Config file path (default: COURIER_CONFIG_PATH or ~/.courier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Consume the inbound queue and publish replies until SIGINT/SIGTERM.
    Run {
        /// Config file path (default: COURIER_CONFIG_PATH or ~/.courier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Global cap on concurrent agent invocations (default from config or 10)
        #[arg(long, value_name = "N")]
        max_concurrent: Option<usize>,
    },

    /// Read inbound envelopes (one JSON per line) from stdin and write replies to stdout.
    Pipe {
        /// Config file path (default: COURIER_CONFIG_PATH or ~/.courier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("courier {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run {
            config,
            max_concurrent,
        }) => {
            if let Err(e) = run(config, max_concurrent).await {
                log::error!("run failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Pipe { config }) => {
            if let Err(e) = run_pipe(config).await {
                log::error!("pipe failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(courier::config::default_config_path);
    let dir = courier::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run(config_path: Option<PathBuf>, max_concurrent: Option<usize>) -> anyhow::Result<()> {
    let (mut config, path) = courier::config::load_config(config_path)?;
    if let Some(n) = max_concurrent {
        config.limits.max_concurrent = n;
        config.validate()?;
    }
    log::info!(
        "starting courier on queue {} (config {})",
        config.broker.inbound_queue,
        path.display()
    );
    courier::service::run_service(config, &path).await
}

async fn run_pipe(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = courier::config::load_config(config_path)?;
    let runtime = courier::service::ollama_runtime(&config, &path);
    let shutdown = courier::service::cancel_on_signal();
    let input = tokio::io::BufReader::new(tokio::io::stdin());
    let stats =
        courier::service::run_pipe(&config, runtime, input, tokio::io::stdout(), shutdown).await?;
    log::info!(
        "pipe: {} received, {} acked, {} dropped, {} dead-lettered",
        stats.received,
        stats.acked,
        stats.dropped,
        stats.dead_lettered
    );
    Ok(())
}
