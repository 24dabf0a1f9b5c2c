//! A bounded, lazily-populated, reconnecting pool of [`Connection`]s.
//!
//! The backoff on repeated create failures is linear and capped —
//! `delay = min(cap, unit * consecutive_failures)` — the same shape as a
//! job-retry policy, generalized here to "delay between connection create
//! attempts" per the reconnect-backoff design note.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::job::WorkerIdentity;

/// Static configuration for a [`Pool`].
#[derive(Clone)]
pub struct PoolConfig {
    /// `host:port` to dial.
    pub addr: String,
    /// Negotiate TLS on connect, using the host portion of `addr` as the
    /// domain to validate. Requires the `tls` feature; building a pool with
    /// `tls: true` without it is a configuration error surfaced on the first
    /// `create()`.
    pub tls: bool,
    /// Plaintext password to hash into `pwdhash`, if the server requires one.
    pub password: Option<String>,
    /// `Some` for a worker connection (advertises wid/pid/labels), `None` for
    /// a producer-only client.
    pub worker: Option<WorkerIdentity>,
    /// Upper bound on live connections (idle + borrowed).
    pub max_size: usize,
    /// How long `acquire` will wait for a connection before failing.
    pub acquire_timeout: Duration,
    /// Backoff coefficient `k` in `delay = min(cap, k * consecutive_failures)`.
    pub backoff_unit: Duration,
    /// Backoff cap in the same formula.
    pub backoff_cap: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:7419".to_owned(),
            tls: false,
            password: None,
            worker: None,
            max_size: 20,
            acquire_timeout: Duration::from_secs(5),
            backoff_unit: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(5),
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<(Connection, OwnedSemaphorePermit)>>,
    consecutive_failures: AtomicU32,
    draining: AtomicBool,
}

/// A bounded pool of handshaked connections. Cheaply `Clone`.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_size));
        Self {
            inner: Arc::new(PoolInner {
                config,
                semaphore,
                idle: Mutex::new(VecDeque::new()),
                consecutive_failures: AtomicU32::new(0),
                draining: AtomicBool::new(false),
            }),
        }
    }

    /// Acquire a validated, handshaked connection, blocking up to the
    /// configured acquisition timeout.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        if self.inner.draining.load(Ordering::Acquire) {
            return Err(Error::PoolDraining);
        }

        let reused = self.inner.idle.lock().unwrap().pop_front();
        let permit = match reused {
            Some((conn, permit)) if !conn.is_closed() => {
                self.record_in_use();
                return Ok(PooledConnection::new(self.clone(), conn, permit));
            }
            Some((_stale, permit)) => {
                debug!("discarding stale idle connection, reusing its permit");
                permit
            }
            None => {
                let acquire_timeout = self.inner.config.acquire_timeout;
                match tokio::time::timeout(acquire_timeout, self.inner.semaphore.clone().acquire_owned())
                    .await
                {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_closed)) => return Err(Error::PoolDraining),
                    Err(_elapsed) => return Err(Error::PoolTimeout(acquire_timeout)),
                }
            }
        };

        match self.create().await {
            Ok(conn) => {
                self.inner.consecutive_failures.store(0, Ordering::Release);
                self.record_in_use();
                Ok(PooledConnection::new(self.clone(), conn, permit))
            }
            Err(e) => {
                self.back_off().await;
                drop(permit);
                Err(e)
            }
        }
    }

    /// Records the number of connections currently borrowed (as opposed to
    /// idle or not yet created) as the `faktory_pool_connections_in_use` gauge.
    fn record_in_use(&self) {
        let in_use = self
            .inner
            .config
            .max_size
            .saturating_sub(self.inner.semaphore.available_permits());
        crate::metrics::record_pool_connections_in_use(in_use);
    }

    /// Scope `acquire`/release around `f`, releasing on every exit path,
    /// including errors returned by `f`.
    pub async fn with<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(PooledConnection) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let conn = self.acquire().await?;
        f(conn).await
    }

    /// Stop creating new connections and let idle ones close.
    pub async fn drain(&self) {
        self.inner.draining.store(true, Ordering::Release);
        let idle: VecDeque<_> = std::mem::take(&mut *self.inner.idle.lock().unwrap());
        for (conn, permit) in idle {
            let _ = conn.close().await;
            drop(permit);
        }
        self.record_in_use();
    }

    /// Tear down all connections: equivalent to [`drain`](Pool::drain), plus
    /// any connection currently borrowed will be closed (rather than
    /// returned to the idle set) as soon as its guard is dropped.
    pub async fn clear(&self) {
        self.drain().await;
    }

    fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    async fn create(&self) -> Result<Connection> {
        let conn = if self.inner.config.tls {
            self.connect_tls().await?
        } else {
            Connection::connect_tcp(&self.inner.config.addr).await?
        };
        crate::handshake::handshake(
            &conn,
            self.inner.config.password.as_deref(),
            self.inner.config.worker.as_ref(),
        )
        .await?;
        Ok(conn)
    }

    #[cfg(feature = "tls")]
    async fn connect_tls(&self) -> Result<Connection> {
        let domain = self
            .inner
            .config
            .addr
            .rsplit_once(':')
            .map(|(host, _port)| host)
            .unwrap_or(&self.inner.config.addr);
        Connection::connect_tls(&self.inner.config.addr, domain).await
    }

    #[cfg(not(feature = "tls"))]
    async fn connect_tls(&self) -> Result<Connection> {
        Err(Error::Tls(
            "TLS requested but faktory-common was built without the \"tls\" feature".to_owned(),
        ))
    }

    async fn back_off(&self) {
        let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let delay = std::cmp::min(
            self.inner.config.backoff_cap,
            self.inner.config.backoff_unit * failures,
        );
        if !delay.is_zero() {
            warn!(?delay, failures, "connection create failed, backing off");
            tokio::time::sleep(delay).await;
        }
    }

    fn release(&self, conn: Connection, permit: OwnedSemaphorePermit) {
        if self.is_draining() || conn.is_closed() {
            // Graceful teardown (the `END\r\n` + socket close documented for
            // `Connection::close`) rather than a bare `Drop`, matching how
            // `drain()` already tears down idle connections. `release` runs
            // from `PooledConnection`'s synchronous `Drop`, so the close has
            // to happen on a spawned task.
            let pool = self.clone();
            tokio::spawn(async move {
                let _ = conn.close().await;
                drop(permit);
                pool.record_in_use();
            });
            return;
        }
        self.inner.idle.lock().unwrap().push_back((conn, permit));
    }
}

/// An acquired connection. Returned to the pool's idle set on drop, unless
/// the pool is draining or the connection has failed.
pub struct PooledConnection {
    pool: Pool,
    conn: Option<Connection>,
    permit: Option<OwnedSemaphorePermit>,
    acquired_at: Instant,
}

impl PooledConnection {
    fn new(pool: Pool, conn: Connection, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            conn: Some(conn),
            permit: Some(permit),
            acquired_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let (Some(conn), Some(permit)) = (self.conn.take(), self.permit.take()) {
            self.pool.release(conn, permit);
        }
    }
}
