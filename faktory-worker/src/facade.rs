//! Process-global convenience: an optional singleton combining a registry, a
//! middleware list, and at-most-one running worker, behind an explicit
//! lifecycle (`register`, `use_middleware`, `work`, `stop`) rather than
//! hidden process-wide state.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use faktory_common::chain::{Chain, HandlerResult, Middleware, Registry};
use faktory_common::job::WorkerIdentity;
use faktory_common::pool::Pool;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::WorkerOptions;
use crate::worker::Worker;

#[derive(Default)]
struct FacadeState {
    registry: Registry,
    middleware: Vec<Arc<dyn Middleware>>,
    worker: Option<Arc<Worker>>,
}

fn facade() -> &'static Mutex<FacadeState> {
    static FACADE: OnceLock<Mutex<FacadeState>> = OnceLock::new();
    FACADE.get_or_init(|| Mutex::new(FacadeState::default()))
}

/// Register a handler for `jobtype` on the process-global registry.
pub async fn register<F, Fut>(jobtype: impl Into<String>, f: F)
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = faktory_common::Result<HandlerResult>> + Send + 'static,
{
    facade().lock().await.registry.register(jobtype, f);
}

/// Append one middleware to the process-global chain.
pub async fn use_middleware(middleware: Arc<dyn Middleware>) {
    facade().lock().await.middleware.push(middleware);
}

/// Build and run the single process-global worker from whatever was
/// accumulated via [`register`]/[`use_middleware`].
///
/// # Panics
///
/// Panics if a worker from a previous call is still running.
pub async fn work(
    pool: Pool,
    identity: WorkerIdentity,
    options: WorkerOptions,
    health: Option<health::HealthHandle>,
) -> i32 {
    let worker = {
        let mut state = facade().lock().await;
        assert!(state.worker.is_none(), "a worker is already running");

        let registry = std::mem::take(&mut state.registry);
        let middleware = std::mem::take(&mut state.middleware);
        let chain = Chain::new(middleware, registry);

        let worker = Worker::new(pool, identity, chain, &options, health);
        state.worker = Some(worker.clone());
        worker
    };

    let exit_code = worker.run().await;
    facade().lock().await.worker = None;
    exit_code
}

/// Signal the process-global worker to stop, if one is running.
pub async fn stop() {
    if let Some(worker) = facade().lock().await.worker.as_ref() {
        worker.stop();
    }
}
