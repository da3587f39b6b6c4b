#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web API server for bloodlink.
//!
//! Accepts donor location reports, blood requests, and donor responses over
//! a JSON REST API under `/api`, persisting to `SQLite` and delivering alerts
//! through the configured notifier. Caller identity is taken from the
//! `X-User-Id` and `X-User-Role` headers set by the upstream auth gateway.

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use bloodlink_coordinator::config::CoordinatorConfig;
use bloodlink_coordinator::{Coordinator, notifier, sweep};
use bloodlink_database::SqliteStore;

/// Shared application state.
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

/// Registers every `/api` route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(handlers::health))
            .route("/locations", web::post().to(handlers::update_location))
            .route("/health-profiles", web::put().to(handlers::upsert_health_profile))
            .route("/requests", web::post().to(handlers::create_request))
            .route("/requests/nearby", web::get().to(handlers::nearby_requests))
            .route("/requests/{id}", web::get().to(handlers::get_request))
            .route("/requests/{id}/alerts", web::get().to(handlers::request_alerts))
            .route("/requests/{id}/cancel", web::post().to(handlers::cancel_request))
            .route("/requests/{id}/fulfill", web::post().to(handlers::fulfill_request))
            .route("/alerts/{id}/respond", web::post().to(handlers::respond))
            .route("/donors/{id}/stats", web::get().to(handlers::donor_stats)),
    );
}

/// Starts the bloodlink API server.
///
/// Loads configuration, opens the `SQLite` store, warms the spatial index
/// from persisted donor locations, starts the request sweeper, and serves
/// HTTP until shut down. The caller provides the async runtime (e.g. via
/// `#[actix_web::main]`).
///
/// # Errors
///
/// * If the configuration cannot be loaded
/// * If the database cannot be opened or read
/// * If the HTTP server fails to bind or encounters a runtime error
#[allow(clippy::future_not_send)]
pub async fn run_server() -> std::io::Result<()> {
    let config = CoordinatorConfig::load().map_err(std::io::Error::other)?;

    log::info!("Opening database...");
    let store = SqliteStore::open_from_env()
        .await
        .map_err(std::io::Error::other)?;

    let notifier = notifier::from_config(&config.notifier);
    let sweep_every = Duration::from_secs(config.lifecycle.sweep_interval_secs.max(1));
    let coordinator = Arc::new(Coordinator::new(Arc::new(store), notifier, config));

    log::info!("Warming spatial index...");
    coordinator
        .warm_up()
        .await
        .map_err(std::io::Error::other)?;

    let sweeper = sweep::spawn_sweeper(Arc::clone(&coordinator), sweep_every);

    let state = web::Data::new(AppState { coordinator });

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    log::info!("Starting server on {bind_addr}:{port}");

    let result = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(configure)
    })
    .bind((bind_addr, port))?
    .run()
    .await;

    sweeper.abort();
    result
}
