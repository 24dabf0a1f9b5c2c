//! CLI entry point: parses `-q/-c/-t/-l/-r/-v`, resolves `FAKTORY_URL`, serves
//! a health/metrics router the way the teacher's `hook-worker` binary does,
//! and runs the worker to completion.

use std::future::ready;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use envconfig::Envconfig;
use faktory_common::chain::HandlerResult;
use faktory_common::job::WorkerIdentity;
use faktory_common::metrics::setup_metrics_router;
use faktory_common::pool::{Pool, PoolConfig};
use faktory_common::url::{parse_connect_target, resolve_url_from_env};
use health::HealthRegistry;

use faktory_worker::config::{CliArgs, EnvConfig, WorkerOptions};
use faktory_worker::error::WorkerError;
use faktory_worker::{facade, middleware};

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let cli = CliArgs::parse();
    let env_config = EnvConfig::init_from_env().map_err(|e| WorkerError::Config(e.to_string()))?;

    for path in &cli.require {
        tracing::warn!(path = %path.display(), "-r/--require has no effect in this binary; register job types at compile time instead");
    }

    let options = WorkerOptions::from_cli(&cli)?;
    let target = parse_connect_target(&resolve_url_from_env())?;

    let identity = WorkerIdentity::new(options.wid.clone(), options.labels.clone());
    let pool = Pool::new(PoolConfig {
        addr: target.addr,
        tls: target.tls,
        password: target.password,
        worker: Some(identity.clone()),
        max_size: options.pool_size,
        ..PoolConfig::default()
    });

    let liveness = HealthRegistry::new("liveness");
    let deadline = time::Duration::seconds((options.beat_interval.as_secs() as i64) * 3);
    let worker_health = liveness.register("worker".to_owned(), deadline).await;

    facade::use_middleware(middleware::logging()).await;
    facade::register("echo", |args| async move {
        tracing::info!(?args, "echo job");
        Ok(HandlerResult::Direct)
    })
    .await;

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_router().merge(router);
    let bind = env_config.bind();

    // Bind eagerly so a port conflict fails startup instead of surfacing
    // later as a silently logged background-task error.
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(WorkerError::Io)?;
    tokio::task::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "health/metrics server exited");
        }
    });

    let exit_code = facade::work(pool, identity, options, Some(worker_health)).await;
    std::process::exit(exit_code);
}

async fn index() -> &'static str {
    "faktory-worker"
}
