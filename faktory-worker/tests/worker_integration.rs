//! End-to-end scenarios run against a small scripted mock server, standing in
//! for the teacher's `#[sqlx::test]` ephemeral-database tests since this
//! system's server dependency is a TCP protocol rather than SQL.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use faktory_common::chain::Chain;
use faktory_common::job::{JobPayload, WorkerIdentity};
use faktory_common::pool::{Pool, PoolConfig};
use faktory_common::queues::QueueSelector;
use faktory_common::Registry;
use faktory_worker::config::WorkerOptions;
use faktory_worker::worker::{Worker, WorkerEvent};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

struct MockState {
    jobs: Mutex<VecDeque<JobPayload>>,
    events: Mutex<Vec<String>>,
    beat_reply: Mutex<String>,
}

struct MockServer {
    addr: String,
    state: Arc<MockState>,
}

impl MockServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(MockState {
            jobs: Mutex::new(VecDeque::new()),
            events: Mutex::new(Vec::new()),
            beat_reply: Mutex::new("OK".to_owned()),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(handle_connection(socket, accept_state.clone()));
            }
        });

        Self { addr, state }
    }

    fn push_job(&self, job: JobPayload) {
        self.state.jobs.lock().unwrap().push_back(job);
    }

    fn set_beat_reply(&self, reply: &str) {
        *self.state.beat_reply.lock().unwrap() = reply.to_owned();
    }

    /// The verb of each command observed, in arrival order, across every
    /// connection this server accepted.
    fn event_verbs(&self) -> Vec<String> {
        self.state
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.split(':').next().unwrap_or(e).to_owned())
            .collect()
    }
}

async fn handle_connection(mut socket: tokio::net::TcpStream, state: Arc<MockState>) {
    if socket.write_all(b"+HI {\"v\":2}\r\n").await.is_err() {
        return;
    }
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let mut parts = line.splitn(2, ' ');
        let verb = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");

        let reply = match verb {
            "HELLO" | "PUSH" => b"+OK\r\n".to_vec(),
            "FETCH" => {
                state.events.lock().unwrap().push("FETCH".to_owned());
                match state.jobs.lock().unwrap().pop_front() {
                    Some(job) => {
                        let body = serde_json::to_string(&job).unwrap();
                        format!("${}\r\n{}\r\n", body.len(), body).into_bytes()
                    }
                    None => b"$-1\r\n".to_vec(),
                }
            }
            "ACK" => {
                state
                    .events
                    .lock()
                    .unwrap()
                    .push(format!("ACK:{}", jid_of(rest)));
                b"+OK\r\n".to_vec()
            }
            "FAIL" => {
                state
                    .events
                    .lock()
                    .unwrap()
                    .push(format!("FAIL:{}", jid_of(rest)));
                b"+OK\r\n".to_vec()
            }
            "BEAT" => {
                let body = state.beat_reply.lock().unwrap().clone();
                format!("+{body}\r\n").into_bytes()
            }
            _ => b"+OK\r\n".to_vec(),
        };

        if writer.write_all(&reply).await.is_err() {
            return;
        }
    }
}

fn jid_of(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("jid").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_default()
}

fn worker_options(queue: &str, concurrency: usize, timeout: Duration) -> WorkerOptions {
    WorkerOptions {
        wid: "testwid1".to_owned(),
        concurrency,
        timeout,
        beat_interval: Duration::from_secs(30),
        queues: QueueSelector::ordered(vec![queue.to_owned()]),
        pool_size: concurrency + 2,
        labels: vec![],
        cleanup_delay: Duration::from_millis(50),
    }
}

async fn build_worker(server: &MockServer, registry: Registry, options: &WorkerOptions) -> Arc<Worker> {
    let identity = WorkerIdentity::new(options.wid.clone(), options.labels.clone());
    let pool = Pool::new(PoolConfig {
        addr: server.addr.clone(),
        max_size: options.pool_size,
        ..PoolConfig::default()
    });
    let chain = Chain::new(vec![], registry);
    Worker::new(pool, identity, chain, options, None)
}

#[tokio::test]
async fn simple_job_round_trip() {
    let server = MockServer::start().await;
    let job = JobPayload {
        args: Some(vec![Value::from(1), Value::from(2), Value::from("three")]),
        ..JobPayload::new("t")
    }
    .with_defaults();
    server.push_job(job.clone());

    let seen_args: Arc<Mutex<Option<Vec<Value>>>> = Arc::new(Mutex::new(None));
    let seen_args_clone = seen_args.clone();
    let mut registry = Registry::new();
    registry.register_direct("t", move |args| {
        *seen_args_clone.lock().unwrap() = Some(args);
        async move { Ok(()) }
    });

    let options = worker_options("q1", 1, Duration::from_secs(2));
    let worker = build_worker(&server, registry, &options).await;
    let mut events = worker.subscribe_events();

    let handle = tokio::spawn(worker.clone().run());
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for an event")
        .unwrap();
    assert!(matches!(event, WorkerEvent::Done { jid } if jid == job.jid()));

    worker.stop();
    let exit_code = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit_code, 0);

    assert_eq!(
        seen_args.lock().unwrap().as_ref().unwrap(),
        &vec![Value::from(1), Value::from(2), Value::from("three")]
    );
    assert!(server.event_verbs().contains(&"ACK".to_owned()));
}

#[tokio::test]
async fn failure_path_reports_fail_with_message_and_backtrace() {
    let server = MockServer::start().await;
    server.push_job(JobPayload::new("t").with_defaults());

    let mut registry = Registry::new();
    registry.register_direct("t", |_args| async move {
        Err(faktory_common::Error::JobError("boom".to_owned()))
    });

    let options = worker_options("q1", 1, Duration::from_secs(2));
    let worker = build_worker(&server, registry, &options).await;
    let mut events = worker.subscribe_events();

    let handle = tokio::spawn(worker.clone().run());
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        WorkerEvent::Fail { message, .. } => assert!(message.contains("boom")),
        other => panic!("expected a Fail event, got {other:?}"),
    }

    worker.stop();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn unknown_jobtype_fails_naming_the_jobtype() {
    let server = MockServer::start().await;
    server.push_job(JobPayload::new("nope").with_defaults());

    let registry = Registry::new();
    let options = worker_options("q1", 1, Duration::from_secs(2));
    let worker = build_worker(&server, registry, &options).await;
    let mut events = worker.subscribe_events();

    let handle = tokio::spawn(worker.clone().run());
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        WorkerEvent::Fail { message, .. } => assert!(message.contains("nope")),
        other => panic!("expected a Fail event, got {other:?}"),
    }

    worker.stop();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn heartbeat_terminate_stops_the_worker_without_external_stop() {
    let server = MockServer::start().await;
    server.set_beat_reply(r#"{"state":"terminate"}"#);

    let registry = Registry::new();
    let mut options = worker_options("q1", 1, Duration::from_secs(2));
    options.beat_interval = Duration::from_millis(20);
    let worker = build_worker(&server, registry, &options).await;

    let handle = tokio::spawn(worker.clone().run());
    let exit_code = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker should have stopped itself after a terminate heartbeat")
        .unwrap();
    assert_eq!(exit_code, 0);
}

#[tokio::test]
async fn graceful_shutdown_lets_an_in_flight_handler_finish() {
    let server = MockServer::start().await;
    server.push_job(JobPayload::new("t").with_defaults());

    let mut registry = Registry::new();
    registry.register_direct("t", |_args| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    });

    let options = worker_options("q1", 1, Duration::from_millis(250));
    let worker = build_worker(&server, registry, &options).await;

    let handle = tokio::spawn(worker.clone().run());
    tokio::time::sleep(Duration::from_millis(20)).await;
    worker.stop();

    let exit_code = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit_code, 0, "handler finished inside the timeout budget");
    assert!(server.event_verbs().contains(&"ACK".to_owned()));
}

#[tokio::test]
async fn forced_shutdown_fails_remaining_jobs_in_fetch_order() {
    let server = MockServer::start().await;
    server.push_job(JobPayload::new("t").with_defaults());
    server.push_job(JobPayload::new("t").with_defaults());

    let mut registry = Registry::new();
    registry.register_direct("t", |_args| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    });

    let options = worker_options("q1", 2, Duration::from_millis(50));
    let worker = build_worker(&server, registry, &options).await;

    let handle = tokio::spawn(worker.clone().run());
    tokio::time::sleep(Duration::from_millis(30)).await;
    worker.stop();

    let exit_code = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("forced shutdown should still bound total runtime")
        .unwrap();
    assert_eq!(exit_code, 1);

    assert_eq!(
        server.event_verbs(),
        vec!["FETCH", "FETCH", "FAIL", "FAIL"]
    );
}
