use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod consumer;
mod error;
mod handlers;
mod idempotency;
mod marketdata;
mod matcher;
mod orders;
mod router;
mod session;
mod state;
mod store;
mod wallet;
mod ws;

use crate::config::load_config;
use crate::consumer::spawn_trade_consumer;
use crate::matcher::{GrpcMatcher, MatcherClient};
use crate::router::build_router;
use crate::state::Gateway;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config()?;
    tracing::info!(service = "edge-gateway", addr = %cfg.addr, env = %cfg.environment, "starting");

    let db = if cfg.disable_db {
        None
    } else {
        let pool = store::open_pool(&cfg).await?;
        store::init_schema(&pool, cfg.db_statement_timeout).await?;
        Some(pool)
    };

    let redis = if cfg.redis_url.trim().is_empty() {
        None
    } else {
        let client = redis::Client::open(cfg.redis_url.as_str()).context("open redis")?;
        Some(
            client
                .get_connection_manager()
                .await
                .context("connect redis")?,
        )
    };

    let matcher: Option<Arc<dyn MatcherClient>> = if cfg.disable_core {
        None
    } else {
        let client = GrpcMatcher::connect(&cfg.core_addr, cfg.core_timeout).await?;
        Some(Arc::new(client))
    };

    let gateway = Arc::new(Gateway::new(cfg.clone(), db, redis, matcher));
    let trade_consumer = spawn_trade_consumer(gateway.clone())?;

    let app = build_router(gateway.clone());
    let listener = TcpListener::bind(&cfg.addr)
        .await
        .with_context(|| format!("bind {}", cfg.addr))?;
    tracing::info!(addr = %cfg.addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serve")?;

    tracing::info!("shutting down");
    if let Some(handle) = trade_consumer {
        let _ = handle.shutdown.send(true);
        let _ = handle.task.await;
    }
    if let Some(pool) = &gateway.db {
        pool.close().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
