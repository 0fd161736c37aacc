use std::{net::IpAddr, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use confique::Config;
use sqlx::SqlitePool;
use tokio::{net::TcpListener, signal, sync::RwLock};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{hub::Hub, token::TokenIssuer};

mod admin;
mod hub;
mod route;
mod store;
mod token;

const DEVELOPMENT_JWT_SECRET: &str = "your_development_secret_key_123";

#[derive(Debug, Parser)]
#[command(name = "quantum-chat-server")]
struct Cli {
    #[arg(short, long, value_name = "FILE", help = "Path to config file")]
    config_path: Option<String>,
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the server
    Serve,

    /// Administrative commands
    #[command(subcommand)]
    Admin(admin::AdminCommands),
}

#[derive(Config, Debug)]
struct Conf {
    /// Port to listen on
    #[config(env = "PORT", default = 8080)]
    port: u16,

    /// Bind address
    #[config(env = "BIND_ADDRESS", default = "127.0.0.1")]
    address: IpAddr,

    /// Database URL
    #[config(env = "DATABASE_URL", default = "sqlite://chat.sqlite")]
    database_url: String,

    /// HS256 signing secret for access and refresh tokens
    #[config(env = "JWT_SECRET", default = "your_development_secret_key_123")]
    jwt_secret: String,

    /// Deployment environment, `production` refuses the development secret
    #[config(env = "ENV", default = "development")]
    environment: String,
}

impl Conf {
    fn check(&self) -> anyhow::Result<()> {
        if self.environment == "production" && self.jwt_secret == DEVELOPMENT_JWT_SECRET {
            anyhow::bail!("refusing to run in production with the development JWT secret");
        }
        Ok(())
    }
}

fn config(path: &str) -> anyhow::Result<Conf> {
    Conf::builder()
        .env()
        .file(path)
        .load()
        .map_err(|e| e.into())
}

#[derive(Clone, Debug)]
pub(crate) struct AppState {
    pub hub: Arc<RwLock<Hub>>,
    pub pool: SqlitePool,
    pub tokens: Arc<TokenIssuer>,
    pub heartbeat: route::Heartbeat,
    pub ws_graceful_shutdown: WebsocketGraceful,
}

impl AppState {
    fn new(pool: SqlitePool, tokens: Arc<TokenIssuer>) -> Self {
        AppState {
            hub: Arc::new(RwLock::new(Hub::new())),
            pool,
            tokens,
            heartbeat: route::Heartbeat::default(),
            ws_graceful_shutdown: WebsocketGraceful {
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
            },
        }
    }
}

/// Cancelling `token` closes every chat socket, `tracker` counts the ones
/// still winding down.
#[derive(Clone, Debug)]
pub(crate) struct WebsocketGraceful {
    pub token: CancellationToken,
    pub tracker: TaskTracker,
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(route::root))
        .route("/health", get(route::health))
        .route("/ws", get(route::chat_ws))
        .nest(
            "/api",
            Router::new()
                .route("/auth/register", post(route::register))
                .route("/auth/login", post(route::login))
                .route("/auth/refresh", post(route::refresh))
                .route("/auth/logout", post(route::logout))
                .route("/users/{id}", get(route::user_profile))
                .route("/messages", get(route::message_history)),
        )
        .layer((
            TraceLayer::new_for_http(),
            // Prevent requests to hang forever
            TimeoutLayer::new(Duration::from_secs(60)),
        ))
        .with_state(state)
}

async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("chat server listening on {}", listener.local_addr()?);

    let WebsocketGraceful { token, tracker } = state.ws_graceful_shutdown.clone();
    let hub = state.hub.clone();

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal(token))
        .await?;

    tracker.close();
    trace!(
        sockets = tracker.len(),
        online = hub.read().await.len(),
        "waiting for chat sockets to close"
    );
    tracker.wait().await;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    trace!("using command line arguments {:?}", cli);

    let config = config(&cli.config_path.unwrap_or("config.toml".to_owned()))?;
    trace!(
        port = config.port,
        address = %config.address,
        database_url = %config.database_url,
        environment = %config.environment,
        "using config"
    );
    config.check()?;

    let pool = store::connect(&config.database_url).await?;
    let tokens = Arc::new(TokenIssuer::new(&config.jwt_secret));

    match cli.commands {
        Commands::Serve => {
            let addr = SocketAddr::from((config.address, config.port));
            serve(addr, AppState::new(pool.clone(), tokens)).await?;
        }
        Commands::Admin(command) => admin::admin(command, &pool, &tokens).await?,
    }

    trace!("closing database connection");
    pool.close().await;

    Ok(())
}

/// `RUST_LOG` wins, otherwise the chat crate logs verbosely in debug builds.
fn init_tracing() {
    const FALLBACK_FILTER: &str = if cfg!(debug_assertions) {
        "quantum_chat_server=debug,tower_http=debug,axum=trace"
    } else {
        "quantum_chat_server=info,tower_http=info,axum=info"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(FALLBACK_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();
}

/// Resolves on Ctrl-C or SIGTERM, then tells every chat socket to close.
async fn shutdown_signal(sockets: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(%e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let reason = tokio::select! {
        res = signal::ctrl_c() => match res {
            Ok(()) => "ctrl-c",
            Err(e) => {
                warn!(%e, "Ctrl-C handler unavailable, shutting down");
                "ctrl-c handler failure"
            }
        },
        _ = terminate => "SIGTERM",
    };

    info!(reason, "shutting down, closing chat sockets");
    sockets.cancel();
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) async fn test_state() -> AppState {
        AppState::new(
            store::memory_pool().await,
            Arc::new(TokenIssuer::new("test-secret")),
        )
    }
}
