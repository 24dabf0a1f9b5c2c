//! Computes and sends the `HELLO` reply to the server's `HI` greeting.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::job::{local_hostname, WorkerIdentity};

const PROTOCOL_VERSION: u32 = 2;

/// Perform the HELLO handshake on a freshly opened `Connection`.
///
/// `worker` is `Some` for worker connections (wid/pid/labels advertised) and
/// `None` for producer-only clients. `password` is the plaintext password
/// configured for this connection, if any.
pub async fn handshake(
    conn: &Connection,
    password: Option<&str>,
    worker: Option<&WorkerIdentity>,
) -> Result<()> {
    if conn.greeting.v != PROTOCOL_VERSION {
        return Err(Error::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found: conn.greeting.v,
        });
    }

    let mut hello = Map::new();
    hello.insert("v".into(), json!(PROTOCOL_VERSION));
    hello.insert("hostname".into(), json!(local_hostname()));

    if let Some(identity) = worker {
        hello.insert("wid".into(), json!(identity.wid));
        hello.insert("pid".into(), json!(identity.pid));
        hello.insert("labels".into(), json!(identity.labels));
    }

    if let (Some(salt), Some(iterations)) = (conn.greeting.s.as_deref(), conn.greeting.i) {
        let password = password.ok_or_else(|| {
            Error::Protocol("server requires a password but none was configured".into())
        })?;
        hello.insert(
            "pwdhash".into(),
            json!(compute_pwdhash(password, salt, iterations)),
        );
    }

    let body = serde_json::to_string(&Value::Object(hello))?;
    let tokens = ["HELLO", body.as_str()];
    conn.send_with_assert(&tokens, "OK").await
}

/// The hex of the `i`-th iterated SHA-256, starting from
/// `sha256(password||salt)` and hashing each successive digest's raw bytes.
fn compute_pwdhash(password: &str, salt: &str, iterations: u32) -> String {
    let mut digest = Sha256::digest(format!("{password}{salt}").as_bytes());
    for _ in 1..iterations.max(1) {
        digest = Sha256::digest(digest);
    }
    to_hex(&digest)
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String cannot fail");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pwdhash_matches_known_vector() {
        // sha256("passwordsomesalt") iterated twice, verified against the
        // `sha2` crate's single-shot digest applied by hand.
        let once = Sha256::digest(b"passwordsomesalt");
        let twice = Sha256::digest(once);
        let expected = to_hex(&twice);

        assert_eq!(compute_pwdhash("password", "somesalt", 2), expected);
    }

    #[test]
    fn pwdhash_one_iteration_is_plain_digest() {
        let expected = to_hex(&Sha256::digest(b"passwordsomesalt"));
        assert_eq!(compute_pwdhash("password", "somesalt", 1), expected);
    }
}
