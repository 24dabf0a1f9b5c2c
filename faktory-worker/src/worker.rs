//! The orchestrator: a concurrency-bounded fetch/execute loop, a heartbeat
//! that can fold `quiet`/`terminate` transitions back into the state
//! machine, and a graceful/forced two-phase shutdown.
//!
//! Structured the way the teacher's `WebhookWorker::run` bounds concurrency
//! with a `tokio::sync::Semaphore` and reports saturation as a gauge, but
//! generalized to a self-limiting single fetch loop (per the design note
//! preferring one shutdown cancellation primitive over ad-hoc flags) instead
//! of N parallel poll loops.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use faktory_common::chain::{Chain, JobContext};
use faktory_common::client::{BeatReply, Client};
use faktory_common::error::Error as ProtoError;
use faktory_common::job::{JobPayload, WorkerIdentity};
use faktory_common::metrics;
use faktory_common::pool::Pool;
use faktory_common::queues::QueueSelector;
use faktory_common::shutdown::ShutdownController;
use futures::FutureExt;
use health::HealthHandle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::config::WorkerOptions;

/// Monotonic lifecycle. Variant declaration order doubles as the transition
/// order `Ord` enforces — `transition` refuses to move backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerState {
    Running,
    Quieted,
    Stopping,
    ForceAborted,
    Stopped,
}

/// Observable outcomes applications can subscribe to via
/// [`Worker::subscribe_events`]. A default listener logs each one.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Done { jid: String },
    Fail { jid: String, message: String },
    Error { message: String },
}

/// The orchestrator for one worker process. Cheap to clone an `Arc<Worker>`
/// around the fetch loop, the heartbeat task, and the signal handler.
pub struct Worker {
    identity: WorkerIdentity,
    client: Client,
    pool: Pool,
    chain: Chain,
    queues: QueueSelector,
    concurrency: usize,
    timeout: Duration,
    beat_interval: Duration,
    cleanup_delay: Duration,
    health: Option<HealthHandle>,
    state: Mutex<WorkerState>,
    quieted: AtomicBool,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    shutdown: ShutdownController,
    in_flight: tokio::sync::Mutex<HashMap<String, JobPayload>>,
    events: broadcast::Sender<WorkerEvent>,
}

impl Worker {
    pub fn new(
        pool: Pool,
        identity: WorkerIdentity,
        chain: Chain,
        options: &WorkerOptions,
        health: Option<HealthHandle>,
    ) -> Arc<Self> {
        let client = Client::new(pool.clone());
        let (stop_tx, stop_rx) = watch::channel(false);
        let (shutdown, _signal) = ShutdownController::new();

        Arc::new(Self {
            identity,
            client,
            pool,
            chain,
            queues: options.queues.clone(),
            concurrency: options.concurrency,
            timeout: options.timeout,
            beat_interval: options.beat_interval,
            cleanup_delay: options.cleanup_delay,
            health,
            state: Mutex::new(WorkerState::Running),
            quieted: AtomicBool::new(false),
            stop_tx,
            stop_rx,
            shutdown,
            in_flight: tokio::sync::Mutex::new(HashMap::new()),
            events: broadcast::channel(256).0,
        })
    }

    pub fn wid(&self) -> &str {
        &self.identity.wid
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Stop fetching new jobs; in-flight jobs continue to completion.
    pub fn quiet(&self) {
        self.quieted.store(true, Ordering::Release);
        self.transition(WorkerState::Quieted);
    }

    /// Quiet, then begin the shutdown sequence: the fetch loop unwinds and
    /// [`Worker::run`] proceeds to the graceful/forced shutdown race.
    pub fn stop(&self) {
        self.quiet();
        if self.transition(WorkerState::Stopping) {
            let _ = self.stop_tx.send(true);
        }
    }

    fn transition(&self, to: WorkerState) -> bool {
        let mut state = self.state.lock().unwrap();
        if to > *state {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Run until `stop()` is called (by the caller, the heartbeat, or a
    /// signal handler), then perform the graceful/forced shutdown. Returns
    /// the process exit code: `0` if every in-flight job completed within
    /// the timeout, `1` if the forced path was taken.
    pub async fn run(self: Arc<Self>) -> i32 {
        self.spawn_default_event_logger();

        let heartbeat = tokio::spawn(self.clone().heartbeat_loop());
        let signals = self.clone().spawn_signal_handler();

        let mut in_flight_tasks: JoinSet<()> = JoinSet::new();
        let mut stop_rx = self.stop_rx.clone();

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let in_flight_len = self.in_flight.lock().await.len();
            metrics::record_saturation_percent(in_flight_len, self.concurrency);
            let at_capacity = in_flight_len >= self.concurrency;
            let quieted = self.quieted.load(Ordering::Acquire);

            if !quieted && !at_capacity {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => continue,
                    result = self.fetch_one() => match result {
                        Ok(Some(job)) => self.dispatch(job, &mut in_flight_tasks).await,
                        Ok(None) => {}
                        Err(e) => {
                            let _ = self.events.send(WorkerEvent::Error { message: e.to_string() });
                            error!(error = %e, "fetch failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    },
                }
            } else if !in_flight_tasks.is_empty() {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => continue,
                    _ = in_flight_tasks.join_next() => {}
                }
            } else {
                let _ = stop_rx.changed().await;
            }
        }

        signals.abort();
        self.shutdown_sequence(in_flight_tasks, heartbeat).await
    }

    async fn fetch_one(&self) -> Result<Option<JobPayload>, ProtoError> {
        self.client.fetch(&self.queues.queues()).await
    }

    async fn dispatch(self: &Arc<Self>, job: JobPayload, tasks: &mut JoinSet<()>) {
        let jid = job.jid().to_owned();
        metrics::record_job_fetched(&job.jobtype, job.queue_name());
        self.in_flight.lock().await.insert(jid, job.clone());

        let worker = self.clone();
        tasks.spawn(async move { worker.handle(job).await });
    }

    /// Run the execution chain for one job and report the outcome. If by
    /// the time the chain resolves the forced-shutdown path has already
    /// claimed this jid (and sent its own `FAIL`), this is a no-op — the
    /// in-flight map entry is the single point of truth for "who reports
    /// this job's outcome".
    async fn handle(self: Arc<Self>, job: JobPayload) {
        let jid = job.jid().to_owned();
        let jobtype = job.jobtype.clone();
        let queue = job.queue_name().to_owned();
        let started = Instant::now();

        let mut ctx = JobContext::new(job, self.shutdown.signal());
        let result = match AssertUnwindSafe(self.chain.run(&mut ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                warn!(%jid, panic = %panic_message(&panic), "job handler panicked");
                // A panic is this runtime's analogue of a non-Error throwable;
                // classify_error turns an empty JobError into the documented
                // placeholder message.
                Err(ProtoError::JobError(String::new()))
            }
        };

        let claimed = self.in_flight.lock().await.remove(&jid).is_some();
        if !claimed {
            return;
        }

        match result {
            Ok(()) => match self.client.ack(&jid).await {
                Ok(()) => {
                    metrics::record_job_completed(&jobtype, &queue, started.elapsed().as_secs_f64());
                    let _ = self.events.send(WorkerEvent::Done { jid });
                }
                Err(e) => {
                    let _ = self.events.send(WorkerEvent::Error { message: e.to_string() });
                }
            },
            Err(e) => {
                let (errtype, message, backtrace) = classify_error(&e);
                metrics::record_job_failed(&jobtype, &queue);
                match self.client.fail(&jid, &errtype, &message, &backtrace).await {
                    Ok(()) => {
                        let _ = self.events.send(WorkerEvent::Fail { jid, message });
                    }
                    Err(send_err) => {
                        let _ = self
                            .events
                            .send(WorkerEvent::Error { message: send_err.to_string() });
                    }
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.beat_interval);
        loop {
            interval.tick().await;
            match self.client.beat(&self.identity.wid).await {
                Ok(BeatReply::Continue) => {
                    if let Some(health) = &self.health {
                        health.report_healthy().await;
                    }
                }
                Ok(BeatReply::Quiet) => self.quiet(),
                Ok(BeatReply::Terminate) => self.stop(),
                Err(e) => {
                    let _ = self.events.send(WorkerEvent::Error { message: e.to_string() });
                }
            }
        }
    }

    fn spawn_signal_handler(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut stop_rx = self.stop_rx.clone();

            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                // SIGTSTP has no named SignalKind constant in tokio; 20 is its
                // raw number on Linux.
                let mut sigterm =
                    signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
                let mut sigtstp = signal(SignalKind::from_raw(20))
                    .expect("failed to install SIGTSTP handler");

                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => return,
                        _ = tokio::signal::ctrl_c() => { self.stop(); return; }
                        _ = sigterm.recv() => { self.stop(); return; }
                        _ = sigtstp.recv() => { self.quiet(); }
                    }
                }
            }

            #[cfg(not(unix))]
            {
                tokio::select! {
                    _ = stop_rx.changed() => {}
                    _ = tokio::signal::ctrl_c() => { self.stop(); }
                }
            }
        })
    }

    async fn shutdown_sequence(
        self: Arc<Self>,
        mut in_flight_tasks: JoinSet<()>,
        heartbeat: tokio::task::JoinHandle<()>,
    ) -> i32 {
        self.transition(WorkerState::Stopping);

        let all_done = async {
            while in_flight_tasks.join_next().await.is_some() {}
        };

        let exit_code = match tokio::time::timeout(self.timeout, all_done).await {
            Ok(()) => 0,
            Err(_elapsed) => {
                self.transition(WorkerState::ForceAborted);
                self.shutdown.cancel();
                tokio::time::sleep(self.cleanup_delay).await;
                self.fail_remaining_in_flight().await;
                // A handler that ignores the cancellation signal may still be
                // running its real body; don't let it block process exit.
                // Abort and drop every spawned task rather than awaiting it.
                in_flight_tasks.abort_all();
                1
            }
        };

        heartbeat.abort();
        self.pool.drain().await;
        self.transition(WorkerState::Stopped);
        exit_code
    }

    async fn fail_remaining_in_flight(&self) {
        let remaining: Vec<JobPayload> = {
            let mut guard = self.in_flight.lock().await;
            guard.drain().map(|(_, job)| job).collect()
        };

        for job in remaining {
            let jid = job.jid().to_owned();
            const MESSAGE: &str = "faktory worker shutdown timeout exceeded";
            match self
                .client
                .fail(&jid, "ShutdownAborted", MESSAGE, &[])
                .await
            {
                Ok(()) => {
                    let _ = self.events.send(WorkerEvent::Fail {
                        jid,
                        message: MESSAGE.to_owned(),
                    });
                }
                Err(e) => {
                    let _ = self.events.send(WorkerEvent::Error { message: e.to_string() });
                }
            }
            metrics::record_job_failed(&job.jobtype, job.queue_name());
        }
    }

    fn spawn_default_event_logger(&self) {
        let mut events = self.events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    WorkerEvent::Done { jid } => debug!(%jid, "job done"),
                    WorkerEvent::Fail { jid, message } => warn!(%jid, %message, "job failed"),
                    WorkerEvent::Error { message } => error!(%message, "worker error"),
                }
            }
        });
    }
}

/// Best-effort extraction of the `&str`/`String` payload `std::panic!` and
/// `assert!` leave in the `Box<dyn Any>` caught by `catch_unwind`.
fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Turns a chain-execution error into the `(errtype, message, backtrace)`
/// triple sent with `FAIL`. An empty message is replaced with the
/// documented placeholder and a warning, covering handlers that fail
/// without a descriptive error.
fn classify_error(err: &ProtoError) -> (String, String, Vec<String>) {
    let errtype = match err {
        ProtoError::UnknownJobType(_) => "UnknownJobType",
        ProtoError::JobError(_) => "JobError",
        _ => "Error",
    }
    .to_owned();

    // A handler that fails without a descriptive message is the Rust analogue
    // of the source's "non-Error throwable"; substitute the documented
    // placeholder rather than sending an empty FAIL message.
    let message = match err {
        ProtoError::JobError(inner) if inner.is_empty() => {
            warn!("job handler failed with no error or message");
            "Job failed with no error or message given".to_owned()
        }
        other => other.to_string(),
    };

    let backtrace = vec![message.clone()];
    (errtype, message, backtrace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_are_monotonic() {
        assert!(WorkerState::Running < WorkerState::Quieted);
        assert!(WorkerState::Quieted < WorkerState::Stopping);
        assert!(WorkerState::Stopping < WorkerState::ForceAborted);
        assert!(WorkerState::ForceAborted < WorkerState::Stopped);
    }

    #[test]
    fn classify_error_names_unknown_job_type() {
        let err = ProtoError::UnknownJobType("nope".to_owned());
        let (errtype, message, backtrace) = classify_error(&err);
        assert_eq!(errtype, "UnknownJobType");
        assert!(message.contains("nope"));
        assert_eq!(backtrace.len(), 1);
    }

    #[test]
    fn classify_error_falls_back_on_empty_message() {
        let err = ProtoError::JobError(String::new());
        let (_, message, _) = classify_error(&err);
        assert_eq!(message, "Job failed with no error or message given");
    }
}
