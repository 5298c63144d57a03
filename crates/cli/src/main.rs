use clap::{Parser, Subcommand};
use lib::client::TelegramConnector;
use lib::service::{ForwarderService, RunOutcome};
use lib::session::SessionStore;

#[derive(Parser)]
#[command(name = "tgforward")]
#[command(about = "Forward new messages from one Telegram chat to another", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config.json.
    Init {
        /// Config file path (default: TGFORWARD_CONFIG_PATH or ~/.tgforward/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Validate a bot token and store it in the session store. The bot must be an admin of the source channel and allowed to post in the target.
    Login {
        /// Config file path (default: TGFORWARD_CONFIG_PATH or ~/.tgforward/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Bot token from BotFather (default: TELEGRAM_BOT_TOKEN env)
        #[arg(long, value_name = "TOKEN")]
        token: Option<String>,
    },

    /// Listen on the source chat and forward every new message to the target until disconnected.
    Run {
        /// Config file path (default: TGFORWARD_CONFIG_PATH or ~/.tgforward/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("tgforward {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Login { config, token }) => {
            if let Err(e) = run_login(config, token).await {
                log::error!("login failed: {:#}", e);
                eprintln!("login failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run { config }) => match run_forwarder(config).await {
            Ok(outcome) => log::info!("forwarder stopped: {:?}", outcome),
            Err(e) => {
                log::error!("forwarder failed to start: {:#}", e);
                eprintln!("forwarder failed to start: {:#}", e);
                std::process::exit(1);
            }
        },
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_login(
    config_path: Option<std::path::PathBuf>,
    token: Option<String>,
) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;
    let identity = lib::config::resolve_identity(&config)?;
    let token = token
        .or_else(|| std::env::var("TELEGRAM_BOT_TOKEN").ok())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| anyhow::anyhow!("no bot token given (use --token or TELEGRAM_BOT_TOKEN)"))?;
    let session = SessionStore::open(lib::config::resolve_session_path(&config, &path))?;
    let api_base = lib::config::resolve_api_base(&config);
    let bot = lib::client::login(&api_base, &identity, &session, &token).await?;
    println!("authorized as {}; session stored at {}", bot, session.path().display());
    Ok(())
}

/// Returns `Err` only when the config cannot be turned into settings (already written to the
/// activity log by `prepare`); once the service starts, every failure is reported as an outcome.
async fn run_forwarder(config_path: Option<std::path::PathBuf>) -> anyhow::Result<RunOutcome> {
    let settings = lib::service::prepare(config_path)?;
    log::info!(
        "forwarding {} -> {} (log: {})",
        settings.source,
        settings.target,
        settings.log_file.display()
    );
    let connector = TelegramConnector::new(settings.api_base.clone());
    let service = ForwarderService::new(connector, settings);
    Ok(service.run().await)
}
