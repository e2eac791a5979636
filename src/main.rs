use actix_web::{web, App, HttpServer};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use matchpoint_backend::config::Config;
use matchpoint_backend::db::create_pool;
use matchpoint_backend::events::{ChangeFeed, ChangeKind};
use matchpoint_backend::http::settlement_handler::{self, AppState};
use matchpoint_backend::http::health;
use matchpoint_backend::middleware::cors_middleware;
use matchpoint_backend::service::{
    ConfirmationService, DisputeService, ExpiryService, RatingCalculator, SettlementService,
};
use matchpoint_backend::store::{
    LockManager, PgStore, RedisLockManager, SettlementStore,
};
use matchpoint_backend::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> io::Result<()> {
    // Load configuration
    let config = Config::from_env().expect("Failed to load configuration");

    // Initialize telemetry
    init_telemetry();

    // Create database pool and run migrations
    let db_pool = create_pool(&config)
        .await
        .expect("Failed to create database pool");
    sqlx::migrate!()
        .run(&db_pool)
        .await
        .expect("Failed to run migrations");

    let store: Arc<dyn SettlementStore> = Arc::new(PgStore::new(db_pool.clone()));
    let locks: Arc<dyn LockManager> = Arc::new(
        RedisLockManager::connect(&config.redis.url)
            .await
            .expect("Failed to connect to Redis"),
    );
    let feed = ChangeFeed::default();

    let settlement = Arc::new(SettlementService::new(
        store.clone(),
        locks.clone(),
        RatingCalculator::default(),
        config.settlement.clone(),
        feed.clone(),
    ));
    let dispute = Arc::new(DisputeService::new(
        store.clone(),
        locks.clone(),
        config.settlement.clone(),
        feed.clone(),
    ));
    let confirmation = Arc::new(ConfirmationService::new(
        store.clone(),
        locks.clone(),
        settlement.clone(),
        dispute.clone(),
        config.settlement.clone(),
        feed.clone(),
    ));
    let expiry = Arc::new(ExpiryService::new(
        store.clone(),
        locks.clone(),
        settlement.clone(),
        dispute.clone(),
        config.settlement.clone(),
    ));

    // Periodic expiry sweep
    let sweeper = expiry.clone();
    let sweep_interval = config.settlement.sweep_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(sweep_interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = sweeper.sweep().await;
            if !report.errors.is_empty() {
                tracing::warn!(
                    errors = report.errors.len(),
                    "Sweep finished with per-match failures"
                );
            }
        }
    });

    // Change-feed listener: re-evaluate a match promptly when a vote lands
    // anywhere in the system. Advisory only; the sweep is the backstop.
    let reevaluator = expiry.clone();
    let mut changes = feed.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) if change.kind == ChangeKind::VoteRecorded => {
                    if let Err(e) = reevaluator.resolve_match(change.match_id).await {
                        tracing::debug!(
                            match_id = %change.match_id,
                            error = %e,
                            "Change-feed re-evaluation deferred to sweep"
                        );
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Change feed lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let state = web::Data::new(AppState {
        confirmation,
        settlement,
        dispute,
        expiry,
    });

    tracing::info!(
        "Starting MatchPoint backend server on {}:{}",
        config.server.host,
        config.server.port
    );

    let pool_data = web::Data::new(db_pool.clone());
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(pool_data.clone())
            .wrap(cors_middleware())
            .wrap(actix_web::middleware::Logger::default())
            .service(
                web::scope("/api")
                    .route("/health", web::get().to(health::health_check))
                    .route(
                        "/matches/{id}/vote",
                        web::post().to(settlement_handler::record_vote),
                    )
                    .route(
                        "/matches/{id}/confirmation",
                        web::get().to(settlement_handler::confirmation_summary),
                    )
                    .route(
                        "/matches/{id}/settle",
                        web::post().to(settlement_handler::settle_match),
                    )
                    .route(
                        "/matches/{id}/dispute",
                        web::post().to(settlement_handler::dispute_match),
                    )
                    .route(
                        "/settlement/sweep",
                        web::post().to(settlement_handler::run_sweep),
                    ),
            )
    })
    .bind((config.server.host.clone(), config.server.port))?
    .run();

    // Graceful shutdown
    let server_handle = server.handle();
    tokio::spawn(async move {
        signal::ctrl_c()
            .await
            .expect("Failed to listen for shutdown signal");
        tracing::info!("Shutdown signal received, stopping server...");
        server_handle.stop(true).await;
    });

    server.await
}
