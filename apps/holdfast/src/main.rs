use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser};
use tracing::info;

use holdfast::config::Config;
use holdfast::identity::Identity;
use holdfast::proxy;
use holdfast::supervisor::Supervisor;
use holdfast::telemetry::logging::{self, LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "holdfast",
    about = "Keep long-lived WebSocket sessions anchored through outbound proxies",
    version
)]
struct Cli {
    #[arg(
        long,
        value_name = "PATH",
        env = "HOLDFAST_IDENTITY_FILE",
        default_value = "uid.txt",
        help = "File whose first non-empty line is the identity id"
    )]
    identity_file: PathBuf,

    #[arg(
        long,
        value_name = "PATH",
        env = "HOLDFAST_PROXY_FILE",
        help = "Line-delimited proxy list; omit to run a single direct session"
    )]
    proxy_file: Option<PathBuf>,

    #[arg(
        long,
        env = "HOLDFAST_USER_AGENT",
        help = "Override the negotiated client fingerprint"
    )]
    user_agent: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "HOLDFAST_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "HOLDFAST_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("initialising logging")?;

    let config = Config::from_env().context("loading configuration")?;
    let identity = Identity::load(&cli.identity_file, cli.user_agent.clone())
        .with_context(|| format!("loading identity from {}", cli.identity_file.display()))?;
    let proxies = match &cli.proxy_file {
        Some(path) => proxy::load_proxies(path)
            .with_context(|| format!("loading proxy list from {}", path.display()))?,
        None => Vec::new(),
    };

    info!(
        user = %identity.user_id,
        proxies = proxies.len(),
        endpoints = config.endpoints.len(),
        "starting holdfast"
    );

    let supervisor = Supervisor::new(identity, proxies, config);
    tokio::select! {
        _ = supervisor.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for interrupt")?;
            info!("interrupt received, shutting down");
        }
    }
    Ok(())
}
