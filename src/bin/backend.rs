use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use mlwio_catalog::{
    alist::AlistResolver,
    api::{AppState, router},
    auth::SessionStore,
    catalog::CatalogStore,
    config::{DEFAULT_CONFIG_PATH, load_server_config_from},
};
use tokio::{signal, time};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const SESSION_PRUNE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the MLWIO catalog API.")]
struct Args {
    #[arg(
        long = "config",
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_PATH,
        help = "Path to the env file"
    )]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mlwio_catalog=info,backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_server_config_from(&args.config, std::env::vars())
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    let store = CatalogStore::open(&config.database_path)
        .with_context(|| format!("opening catalog at {}", config.database_path.display()))?;
    if let Some((username, password)) = &config.admin {
        let store = store.clone();
        let (username, password) = (username.clone(), password.clone());
        let created = tokio::task::spawn_blocking(move || store.ensure_user(&username, &password))
            .await
            .context("admin bootstrap task")??;
        if created {
            info!("admin user created from ADMIN_USERNAME");
        }
    }
    let user_count = {
        let store = store.clone();
        tokio::task::spawn_blocking(move || store.count_users())
            .await
            .context("user count task")??
    };
    if user_count == 0 {
        warn!("no users exist; set ADMIN_USERNAME/ADMIN_PASSWORD or run `catalog_admin add-user`");
    }

    if config.alist.token.is_none() {
        warn!("ALIST_TOKEN not set, Alist links will be served unsigned");
    }
    let resolver = AlistResolver::new(config.alist.clone()).context("building Alist client")?;
    let sessions = Arc::new(SessionStore::new(config.session_ttl));
    tokio::spawn(prune_sessions(sessions.clone()));

    let app = router(AppState::new(store, resolver, sessions, config.cookie_secure));

    let addr = SocketAddr::new(
        config
            .host
            .parse()
            .with_context(|| format!("parsing HOST {:?}", config.host))?,
        config.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn prune_sessions(sessions: Arc<SessionStore>) {
    let mut ticker = time::interval(SESSION_PRUNE_INTERVAL);
    loop {
        ticker.tick().await;
        let removed = sessions.prune();
        if removed > 0 {
            info!(removed, remaining = sessions.len(), "pruned expired sessions");
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", err);
    }
    info!("shutting down");
}
