use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use chrono::Utc;
use tracing::Level;

use chaos_core::ids::UserId;
use chaos_engine::UserService;
use chaos_server::{JwtAuth, ServerConfig};
use chaos_store::Database;
use chaos_telemetry::{init_telemetry, LogFilter, SqliteLogSink, TelemetryConfig};

#[derive(Parser)]
#[command(name = "chaos", version, about = "Real-time chat and call signaling server")]
struct Cli {
    /// JSON config file, deep-merged over the defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path.
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// HS256 token secret. Prefer CHAOS_JWT_SECRET over this flag.
    #[arg(long, global = true)]
    jwt_secret: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP and WebSocket server.
    Serve {
        /// Listen address, e.g. 127.0.0.1:9999.
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Create a user and print it as JSON.
    CreateUser {
        #[arg(long)]
        name: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
    },
    /// Print a bearer token for an existing user.
    IssueToken {
        #[arg(long)]
        user_id: String,
        #[arg(long, default_value_t = 24)]
        ttl_hours: u64,
    },
    /// Print persisted warnings and errors as JSON lines, newest first.
    Logs {
        /// Only errors instead of warnings and errors.
        #[arg(long)]
        errors_only: bool,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        call_id: Option<String>,
        /// Only records from the last N minutes.
        #[arg(long)]
        since_minutes: Option<i64>,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref()).context("loading config")?;
    if let Some(path) = cli.database {
        config.database_path = path;
    }
    if let Some(secret) = cli.jwt_secret {
        config.jwt_secret = Some(SecretString::from(secret));
    }

    match cli.command {
        Command::Serve { bind } => {
            if let Some(addr) = bind {
                config.host = addr.ip().to_string();
                config.port = addr.port();
            }
            serve(config).await
        }
        Command::CreateUser { name, username, email } => {
            quiet_telemetry();
            let db = open_db(&config)?;
            let user = UserService::new(db).create(&name, &username, &email)?;
            println!("{}", serde_json::to_string_pretty(&user)?);
            Ok(())
        }
        Command::IssueToken { user_id, ttl_hours } => {
            quiet_telemetry();
            let Some(secret) = config.jwt_secret.as_ref() else {
                bail!("no JWT secret configured (set CHAOS_JWT_SECRET or --jwt-secret)");
            };
            let db = open_db(&config)?;
            let user_id = UserId::from_raw(user_id);
            if !UserService::new(db).exists(&user_id)? {
                bail!("unknown user {user_id}");
            }
            let auth = JwtAuth::new(secret, config.jwt_audience.clone());
            let token = auth.issue(&user_id, Duration::from_secs(ttl_hours.saturating_mul(3600)))?;
            println!("{token}");
            Ok(())
        }
        Command::Logs {
            errors_only,
            user_id,
            call_id,
            since_minutes,
            limit,
        } => {
            let path = &config.logging.path;
            if !path.exists() {
                bail!("no log database at {}", path.display());
            }
            let sink = SqliteLogSink::open(path)
                .with_context(|| format!("opening log database at {}", path.display()))?;
            let filter = LogFilter {
                min_level: if errors_only { Level::ERROR } else { Level::WARN },
                user_id,
                call_id,
                since: since_minutes.map(|m| Utc::now() - chrono::Duration::minutes(m)),
                limit,
            };
            for record in sink.recent(&filter)? {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let telemetry = init_telemetry(config.logging.telemetry_config());
    tracing::info!(
        log_db = ?telemetry.log_db,
        pruned = telemetry.pruned,
        "starting chaos server"
    );

    let db = open_db(&config)?;
    let handle = chaos_server::start(&config, db).await?;
    tracing::info!(port = handle.port, "chaos server ready");

    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown();
    Ok(())
}

/// One-shot commands print to stdout; keep the log out of the way.
fn quiet_telemetry() {
    init_telemetry(TelemetryConfig {
        log_level: Level::WARN,
        json: false,
        log_to_sqlite: false,
        ..Default::default()
    });
}

fn open_db(config: &ServerConfig) -> anyhow::Result<Database> {
    Database::open(&config.database_path)
        .with_context(|| format!("opening database at {}", config.database_path.display()))
}
