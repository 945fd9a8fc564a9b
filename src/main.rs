use axum::{routing::get, Router};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sirh_followup::{
    db,
    models::SessionStatus,
    routes::{self, AppState},
    sirh::SirhClient,
    store::Store,
    task::SyncTask,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "sirh_followup=info,axum=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let pool = db::connect().await?;
    let store = Store::new(pool.clone());
    let client = SirhClient::from_env()?;

    // One-shot modes for operators; no argument starts the service.
    match env::args().nth(1).as_deref() {
        Some("sync") => {
            return run_once(&pool, store, client, SessionStatus::default_sync_filter()).await;
        }
        Some("send-archived") => {
            return run_once(&pool, store, client, SessionStatus::sync_filter_with_archived())
                .await;
        }
        Some(other) => anyhow::bail!("unknown command: {other}"),
        None => {}
    }

    db::MIGRATOR.run(&pool).await?;

    let task = Arc::new(SyncTask::new(
        store.clone(),
        client,
        SessionStatus::default_sync_filter(),
        true,
    ));

    let interval_secs: u64 = env::var("SYNC_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3600);
    let scheduled = task.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        // The first tick fires immediately; wait one full interval instead.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = scheduled.run().await {
                tracing::error!(error = %e, "scheduled follow-up run failed");
            }
        }
    });

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(routes::router(AppState { store, task }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let port: u16 = env::var("PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(8081);
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on http://0.0.0.0:{}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Run the sync exactly once and exit non-zero on failure. Refuses to run
/// against a database with a pending upgrade.
async fn run_once(
    pool: &db::Db,
    store: Store,
    client: SirhClient,
    statuses: Vec<SessionStatus>,
) -> anyhow::Result<()> {
    if db::has_pending_migrations(pool).await {
        anyhow::bail!("database upgrade pending, cannot run the follow-up task");
    }
    let task = SyncTask::new(store, client, statuses, true);
    let report = task.run().await?;
    tracing::info!(
        sessions = report.sessions,
        entries = report.entries,
        "one-shot follow-up run complete"
    );
    Ok(())
}
