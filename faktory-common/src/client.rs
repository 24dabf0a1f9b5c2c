//! The high-level command surface: one `Client` wraps one connection
//! [`Pool`](crate::pool::Pool), acquiring a connection per call the same way
//! the teacher's `PgQueue` acquires from its `sqlx::PgPool` per query.

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::job::{FailPayload, JobPayload};
use crate::pool::Pool;

const MAX_BACKTRACE_LINES: usize = 100;

/// The worker-state transition a `BEAT` reply may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatReply {
    /// Keep running as normal.
    Continue,
    /// Stop fetching new jobs; finish in-flight ones.
    Quiet,
    /// Quiet, then shut down within the timeout budget.
    Terminate,
}

/// One client, wrapping one connection pool.
#[derive(Clone)]
pub struct Client {
    pool: Pool,
}

impl Client {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// `FETCH q1 q2 …`. Blocks server-side up to ~2s when no work is
    /// available; callers must not assume a shorter round trip.
    pub async fn fetch(&self, queues: &[String]) -> Result<Option<JobPayload>> {
        let conn = self.pool.acquire().await?;
        let tokens: Vec<&str> = std::iter::once("FETCH")
            .chain(queues.iter().map(String::as_str))
            .collect();
        match conn.send(&tokens).await? {
            None => Ok(None),
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
        }
    }

    /// `PUSH {json}`. Applies the client-side defaults the server does not:
    /// `jid`, `queue`, `args`, `priority`, `retry`.
    pub async fn push(&self, job: JobPayload) -> Result<()> {
        let job = job.with_defaults();
        let body = serde_json::to_string(&job)?;
        let conn = self.pool.acquire().await?;
        conn.send_with_assert(&["PUSH", &body], "OK").await
    }

    /// `ACK {"jid":…}`.
    pub async fn ack(&self, jid: &str) -> Result<()> {
        let body = serde_json::to_string(&json!({ "jid": jid }))?;
        let conn = self.pool.acquire().await?;
        conn.send_with_assert(&["ACK", &body], "OK").await
    }

    /// `FAIL {"jid","message","errtype","backtrace":[…]}`. `backtrace` is
    /// truncated to at most 100 lines.
    pub async fn fail(
        &self,
        jid: &str,
        errtype: &str,
        message: &str,
        backtrace: &[String],
    ) -> Result<()> {
        let payload = FailPayload {
            jid,
            errtype,
            message,
            backtrace: backtrace
                .iter()
                .take(MAX_BACKTRACE_LINES)
                .map(String::as_str)
                .collect(),
        };
        let body = serde_json::to_string(&payload)?;
        let conn = self.pool.acquire().await?;
        conn.send_with_assert(&["FAIL", &body], "OK").await
    }

    /// `BEAT {"wid":…}`. Interprets the reply per the BEAT contract: a bare
    /// `OK` (or any non-JSON string) means continue; a JSON object with a
    /// `state` field selects `Quiet`/`Terminate`.
    pub async fn beat(&self, wid: &str) -> Result<BeatReply> {
        let body = serde_json::to_string(&json!({ "wid": wid }))?;
        let conn = self.pool.acquire().await?;
        let reply = conn.send(&["BEAT", &body]).await?;
        Ok(match reply {
            None => BeatReply::Continue,
            Some(text) => parse_beat_reply(&text),
        })
    }

    /// `INFO`. Returns the server's info document verbatim.
    pub async fn info(&self) -> Result<Value> {
        let conn = self.pool.acquire().await?;
        let reply = conn.send(&["INFO"]).await?.ok_or_else(|| {
            Error::Protocol("INFO unexpectedly returned a null reply".into())
        })?;
        Ok(serde_json::from_str(&reply)?)
    }

    /// `FLUSH`. Administrative: clears all queue state.
    pub async fn flush(&self) -> Result<()> {
        let conn = self.pool.acquire().await?;
        conn.send_with_assert(&["FLUSH"], "OK").await
    }

    /// `MUTATE {cmd,target,filter}`. Administrative: clear/kill/discard/requeue.
    pub async fn mutate(&self, cmd: &str, target: &str, filter: Value) -> Result<()> {
        let body = serde_json::to_string(&json!({
            "cmd": cmd,
            "target": target,
            "filter": filter,
        }))?;
        let conn = self.pool.acquire().await?;
        conn.send_with_assert(&["MUTATE", &body], "OK").await
    }
}

fn parse_beat_reply(text: &str) -> BeatReply {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return BeatReply::Continue;
    };
    match value.get("state").and_then(Value::as_str) {
        Some("quiet") => BeatReply::Quiet,
        Some("terminate") => BeatReply::Terminate,
        _ => BeatReply::Continue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_reply_plain_ok_is_continue() {
        assert_eq!(parse_beat_reply("OK"), BeatReply::Continue);
    }

    #[test]
    fn beat_reply_quiet() {
        assert_eq!(
            parse_beat_reply(r#"{"state":"quiet"}"#),
            BeatReply::Quiet
        );
    }

    #[test]
    fn beat_reply_terminate() {
        assert_eq!(
            parse_beat_reply(r#"{"state":"terminate"}"#),
            BeatReply::Terminate
        );
    }

    #[test]
    fn beat_reply_unrecognized_json_is_continue() {
        assert_eq!(parse_beat_reply(r#"{"foo":"bar"}"#), BeatReply::Continue);
    }
}
