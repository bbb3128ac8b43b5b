mod blobs;
mod clock;
mod config;
mod db;
mod errors;
mod ids;
mod lifecycle;
mod models;
mod reclaimer;
mod routes;
mod sniff;

use crate::blobs::BlobStore;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::db::Db;
use crate::ids::OsIdGenerator;
use crate::lifecycle::Lifecycle;
use crate::reclaimer::Reclaimer;
use actix_cors::Cors;
use actix_web::http::header;
use actix_web::middleware::Logger;
use actix_web::web::Data;
use actix_web::{App, HttpServer};
use anyhow::Context;
use env_logger::Env;
use std::sync::Arc;
use std::time::Duration;

fn cors(allowed_origins: &[String]) -> Cors {
    let mut cors = Cors::default()
        .allowed_methods(vec!["GET", "POST"])
        .allowed_headers(vec![header::ACCEPT, header::CONTENT_TYPE])
        .max_age(3600);
    if allowed_origins.is_empty() {
        cors = cors.allow_any_origin();
    }
    for origin in allowed_origins {
        cors = cors.allowed_origin(origin);
    }
    cors
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Init logger to show info by default, but can be overridden by RUST_LOG
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cfg = Config::from_env_config()?;

    let db = Db::connect_and_migrate(&cfg.database_path, cfg.max_db_connections)
        .await
        .context("database init failed")?;
    let blobs = BlobStore::new(&cfg.uploads_dir, cfg.max_upload_size)
        .await
        .with_context(|| format!("cannot use uploads dir {}", cfg.uploads_dir))?;
    log::info!("metadata in {}, blobs in {}", cfg.database_path, cfg.uploads_dir);

    let lifecycle = Arc::new(Lifecycle::new(
        db.clone(),
        blobs,
        Arc::new(OsIdGenerator),
        Arc::new(SystemClock),
        cfg.retention(),
        cfg.public_url.clone(),
    ));
    let recovered = lifecycle.recover().await.context("startup repair failed")?;
    if recovered.partials > 0 || recovered.orphans > 0 {
        log::warn!(
            "removed {} unfinished uploads and {} blobs without metadata",
            recovered.partials,
            recovered.orphans
        );
    }
    let reclaimer = Reclaimer::start(lifecycle.clone(), cfg.reclaim_interval());

    log::info!("Starting server at {}", cfg.listen);
    let lifecycle = Data::from(lifecycle);
    let app_cfg = Data::new(cfg.clone());
    let server = HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(cors(&app_cfg.allowed_origins))
            .app_data(app_cfg.clone())
            .app_data(lifecycle.clone())
            .configure(routes::configure)
    })
    .client_request_timeout(Duration::from_secs(cfg.client_request_timeout_secs))
    .client_disconnect_timeout(Duration::from_secs(cfg.client_disconnect_timeout_secs))
    .keep_alive(Duration::from_secs(cfg.keep_alive_secs))
    .bind(cfg.listen.as_str())
    .with_context(|| format!("cannot listen on {}", cfg.listen))?
    .run();

    let served = server.await;
    reclaimer.shutdown().await;
    db.0.close().await;
    served.context("http server failed")
}
