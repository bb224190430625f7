mod logging;
mod routes;

use std::{collections::VecDeque, sync::Arc};

use ando_core::{
    config::Config,
    container::ContainerManager,
    db::Db,
    log_transport::LogTransport,
    orchestrator::Orchestrator,
    source::GitSourceProvider,
    steps::ManifestStepSource,
    vault::Vault,
};
use ando_steps::ContainerExecutor;
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub struct AppState {
    pub db: Arc<Db>,
    pub config: Arc<Config>,
    pub vault: Arc<Vault>,
    pub log_transport: Arc<LogTransport>,
    pub orchestrator: Arc<Orchestrator>,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<std::sync::Mutex<VecDeque<String>>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let (log_tx, _log_rx) = broadcast::channel::<String>(1024);
    let log_ring: Arc<std::sync::Mutex<VecDeque<String>>> =
        Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(500)));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ando_server=info,ando_core=info,ando_steps=info,tower_http=warn".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logging::BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Config::from_env()?;
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.artifact_root)?;

    let db_path = format!("{}/ando.db", config.data_dir);
    let db = Db::open(&db_path)?;
    db.migrate()?;

    let vault_key = if config.vault_key_b64.is_empty() {
        tracing::warn!("ANDO_VAULT_KEY unset, generating an ephemeral key — secrets will not survive a restart");
        Vault::generate_key()
    } else {
        config.vault_key_b64.clone()
    };
    let vault = Arc::new(Vault::new(&vault_key)?);

    let db = Arc::new(db);
    let config = Arc::new(config);

    // Restart recovery: anything left `Running` from a previous crash is a
    // dead build — the work queue and in_flight set were only ever in memory.
    let containers = Arc::new(ContainerManager::new());
    let executor = Arc::new(ContainerExecutor);
    let step_source = Arc::new(ManifestStepSource);
    let source_provider = Arc::new(GitSourceProvider);
    let log_transport = Arc::new(LogTransport::new(Arc::clone(&db)));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        Arc::clone(&config),
        Arc::clone(&vault),
        containers,
        executor,
        step_source,
        source_provider,
        Arc::clone(&log_transport),
    ));
    orchestrator.recover_orphaned_builds()?;

    // Orchestrator tick loop — inner spawn catches panics so the loop never dies.
    {
        let orchestrator = Arc::clone(&orchestrator);
        let tick_secs = config.orchestrator_tick_s;
        tokio::spawn(async move {
            loop {
                let o = Arc::clone(&orchestrator);
                let handle = tokio::spawn(async move { o.tick().await });
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("orchestrator tick error: {e}"),
                    Err(join_err) => error!("orchestrator tick panicked: {join_err}"),
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(tick_secs)).await;
            }
        });
    }

    let state = Arc::new(AppState {
        db,
        config: Arc::clone(&config),
        vault,
        log_transport,
        orchestrator,
        log_tx,
        log_ring,
    });

    let app = Router::new()
        .route("/api/health", get(routes::health))
        // Webhook ingress
        .route("/webhooks/github", post(routes::github_webhook))
        // Projects
        .route("/api/projects", get(routes::list_projects))
        .route("/api/projects", post(routes::create_project))
        .route("/api/projects/:id", get(routes::get_project))
        .route("/api/projects/:id", delete(routes::delete_project))
        .route("/api/projects/:id/trigger", post(routes::manual_trigger))
        .route("/api/projects/:id/secrets", get(routes::list_secrets))
        .route("/api/projects/:id/secrets", put(routes::put_secret))
        .route("/api/projects/:id/secrets/:name", delete(routes::delete_secret))
        .route("/api/projects/:id/builds", get(routes::list_builds))
        // Builds
        .route("/api/builds/:id", get(routes::get_build))
        .route("/api/builds/:id/cancel", post(routes::cancel_build))
        .route("/api/builds/:id/retry", post(routes::retry_build))
        .route("/api/builds/:id/logs", get(routes::get_build_logs))
        .route("/api/builds/:id/stream", get(routes::sse_build_stream))
        .route("/api/builds/:id/artifacts", get(routes::list_artifacts))
        // Tokens
        .route("/api/tokens", post(routes::create_token))
        // Settings
        .route("/api/settings", get(routes::get_settings))
        .route("/api/settings", put(routes::put_settings))
        // Ambient process logs
        .route("/api/logs", get(routes::sse_logs))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = config.bind_addr.clone();
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
