//! Resolves `FAKTORY_URL`/`FAKTORY_PROVIDER` into a connect target.

use crate::error::{Error, Result};

/// What's needed to dial the server: host:port, whether to use TLS, and any
/// password embedded in the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub addr: String,
    pub tls: bool,
    pub password: Option<String>,
}

/// Reads `FAKTORY_PROVIDER` first: if set, it names another environment
/// variable holding the real URL (for platforms that inject a
/// differently-named variable). Falls back to `FAKTORY_URL`, then to
/// `tcp://localhost:7419`.
pub fn resolve_url_from_env() -> String {
    if let Ok(provider_var) = std::env::var("FAKTORY_PROVIDER") {
        if let Ok(url) = std::env::var(&provider_var) {
            return url;
        }
    }
    std::env::var("FAKTORY_URL").unwrap_or_else(|_| "tcp://localhost:7419".to_owned())
}

/// Parse a `tcp://` or `tcps://` URL into a [`ConnectTarget`].
pub fn parse_connect_target(raw: &str) -> Result<ConnectTarget> {
    let parsed = url::Url::parse(raw).map_err(|e| Error::InvalidUrl(e.to_string()))?;

    let tls = match parsed.scheme() {
        "tcp" => false,
        "tcps" => true,
        other => return Err(Error::InvalidUrl(format!("unsupported scheme {other:?}"))),
    };

    let host = parsed
        .host_str()
        .ok_or_else(|| Error::InvalidUrl("missing host".to_owned()))?;
    let port = parsed.port().unwrap_or(7419);
    let password = match parsed.password() {
        Some(p) => Some(p.to_owned()),
        None => None,
    };

    Ok(ConnectTarget {
        addr: format!("{host}:{port}"),
        tls,
        password,
    })
}
