//! The `JobPayload` data model and the worker identity advertised during the
//! HELLO handshake.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A server-assigned work unit, as described in the data model.
///
/// `push` does not apply any defaults itself; see [`JobPayload::with_defaults`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jid: Option<String>,

    pub jobtype: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_for: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<HashMap<String, Value>>,
}

impl JobPayload {
    /// Construct a minimal job with only the required `jobtype` set; every
    /// other field is left absent so the caller (or [`with_defaults`]) can
    /// populate them.
    ///
    /// [`with_defaults`]: JobPayload::with_defaults
    pub fn new(jobtype: impl Into<String>) -> Self {
        Self {
            jid: None,
            jobtype: jobtype.into(),
            queue: None,
            args: None,
            priority: None,
            retry: None,
            at: None,
            reserve_for: None,
            custom: None,
        }
    }

    /// Apply the defaults the server does not apply itself: `jid` (random if
    /// absent), `queue` (`"default"`), `args` (`[]`), `priority` (`5`),
    /// `retry` (`25`).
    pub fn with_defaults(mut self) -> Self {
        if self.jid.is_none() {
            self.jid = Some(Uuid::new_v4().simple().to_string());
        }
        if self.queue.is_none() {
            self.queue = Some("default".to_owned());
        }
        if self.args.is_none() {
            self.args = Some(Vec::new());
        }
        if self.priority.is_none() {
            self.priority = Some(5);
        }
        if self.retry.is_none() {
            self.retry = Some(25);
        }
        self
    }

    pub fn jid(&self) -> &str {
        self.jid.as_deref().unwrap_or_default()
    }

    pub fn queue_name(&self) -> &str {
        self.queue.as_deref().unwrap_or("default")
    }

    pub fn args(&self) -> &[Value] {
        static EMPTY: &[Value] = &[];
        self.args.as_deref().unwrap_or(EMPTY)
    }
}

/// Identifies one worker process to the server; advertised in HELLO and used
/// to address heartbeat responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub wid: String,
    pub hostname: String,
    pub pid: u32,
    pub labels: Vec<String>,
}

impl WorkerIdentity {
    pub fn new(wid: impl Into<String>, labels: Vec<String>) -> Self {
        Self {
            wid: wid.into(),
            hostname: local_hostname(),
            pid: std::process::id(),
            labels,
        }
    }
}

/// Best-effort local hostname, used both in `WorkerIdentity` and directly in
/// the HELLO handshake for producer-only connections.
pub fn local_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned())
}

/// A failure report sent with `FAIL`, as specified in the command table.
#[derive(Debug, Clone, Serialize)]
pub struct FailPayload<'a> {
    pub jid: &'a str,
    pub errtype: &'a str,
    pub message: &'a str,
    pub backtrace: Vec<&'a str>,
}

/// The server's `HI` greeting, read once right after connecting.
#[derive(Debug, Clone, Deserialize)]
pub struct Greeting {
    pub v: u32,
    #[serde(default)]
    pub s: Option<String>,
    #[serde(default)]
    pub i: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied_once() {
        let job = JobPayload::new("SomeJob").with_defaults();
        assert!(job.jid.is_some());
        assert_eq!(job.queue_name(), "default");
        assert_eq!(job.args(), &[] as &[Value]);
        assert_eq!(job.priority, Some(5));
        assert_eq!(job.retry, Some(25));
    }

    #[test]
    fn explicit_fields_survive_defaulting() {
        let job = JobPayload {
            jid: Some("abc123".to_owned()),
            queue: Some("critical".to_owned()),
            priority: Some(9),
            retry: Some(0),
            ..JobPayload::new("SomeJob")
        }
        .with_defaults();

        assert_eq!(job.jid.as_deref(), Some("abc123"));
        assert_eq!(job.queue_name(), "critical");
        assert_eq!(job.priority, Some(9));
        assert_eq!(job.retry, Some(0));
    }

    #[test]
    fn round_trips_through_json() {
        let job = JobPayload::new("SomeJob").with_defaults();
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: JobPayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(job, decoded);
    }
}
