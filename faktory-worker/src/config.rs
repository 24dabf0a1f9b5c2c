//! Environment configuration for the health/metrics surface, and the `-q/-c/…`
//! CLI flags that shape one `WorkerOptions`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use envconfig::Envconfig;
use faktory_common::queues::{QueueEntry, QueueSelector};
use rand::Rng;

use crate::error::WorkerError;

const DEFAULT_CONCURRENCY: usize = 20;
const DEFAULT_TIMEOUT_SECS: u64 = 8;
const DEFAULT_BEAT_INTERVAL: Duration = Duration::from_secs(15);
const WID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const WID_LEN: usize = 8;

/// Ambient process configuration, sourced from the environment the way the
/// teacher's `hook-worker::Config` is.
#[derive(Envconfig, Clone)]
pub struct EnvConfig {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub bind_host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub bind_port: u16,
}

impl EnvConfig {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }
}

/// `-q/--queue`, `-c/--concurrency`, … as specified for the `work()` launcher.
#[derive(Parser, Clone, Debug)]
#[command(name = "faktory-worker", version, about = "Faktory background job worker")]
pub struct CliArgs {
    /// Bare name for ordered mode, or `name,weight` for weighted mode.
    /// Repeatable; mixing the two forms is an error.
    #[arg(short = 'q', long = "queue", value_name = "spec")]
    pub queues: Vec<String>,

    #[arg(short = 'c', long = "concurrency", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Graceful shutdown budget, in seconds.
    #[arg(short = 't', long = "timeout", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    #[arg(short = 'l', long = "label")]
    pub labels: Vec<String>,

    /// Preload one or more files that register jobs before `work()` starts.
    #[arg(short = 'r', long = "require")]
    pub require: Vec<PathBuf>,

    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// The fully resolved set of options a [`crate::worker::Worker`] is built
/// from, after CLI parsing and defaulting.
#[derive(Clone)]
pub struct WorkerOptions {
    pub wid: String,
    pub concurrency: usize,
    pub timeout: Duration,
    pub beat_interval: Duration,
    pub queues: QueueSelector,
    pub pool_size: usize,
    pub labels: Vec<String>,
    /// Grace period, after the abort signal fires, given to handlers to
    /// unwind before remaining in-flight jobs are force-failed. 3s in
    /// production; tests shrink this to make the scenario run fast.
    pub cleanup_delay: Duration,
}

impl WorkerOptions {
    pub fn from_cli(cli: &CliArgs) -> Result<Self, WorkerError> {
        let entries = cli
            .queues
            .iter()
            .map(|spec| parse_queue_entry(spec))
            .collect::<Result<Vec<_>, WorkerError>>()?;
        let queues =
            QueueSelector::from_entries(entries).map_err(|e| WorkerError::Config(e.to_string()))?;

        Ok(Self {
            wid: random_wid(),
            concurrency: cli.concurrency,
            timeout: Duration::from_secs(cli.timeout_secs),
            beat_interval: DEFAULT_BEAT_INTERVAL,
            pool_size: cli.concurrency + 2,
            labels: cli.labels.clone(),
            queues,
            cleanup_delay: Duration::from_secs(3),
        })
    }

    pub fn with_cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay = delay;
        self
    }
}

/// Parses one `-q` repetition: `name` (ordered) or `name,weight` (weighted).
fn parse_queue_entry(spec: &str) -> Result<QueueEntry, WorkerError> {
    match spec.split_once(',') {
        Some((name, weight)) => {
            let weight: u32 = weight
                .parse()
                .map_err(|_| WorkerError::Config(format!("invalid queue weight in {spec:?}")))?;
            Ok(QueueEntry::Weighted(name.to_owned(), weight))
        }
        None => Ok(QueueEntry::Named(spec.to_owned())),
    }
}

fn random_wid() -> String {
    let mut rng = rand::thread_rng();
    (0..WID_LEN)
        .map(|_| WID_ALPHABET[rng.gen_range(0..WID_ALPHABET.len())] as char)
        .collect()
}
