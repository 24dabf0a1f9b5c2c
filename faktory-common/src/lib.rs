//! Wire protocol, connection pooling, and job-execution primitives shared by
//! the producer and worker sides of a Faktory client.

pub mod chain;
pub mod client;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod job;
pub mod metrics;
pub mod pool;
pub mod queues;
pub mod shutdown;
pub mod url;

pub use chain::{Chain, HandlerResult, JobContext, Middleware, Next, Registry};
pub use client::{BeatReply, Client};
pub use connection::Connection;
pub use error::{Error, Result};
pub use job::{FailPayload, JobPayload, WorkerIdentity};
pub use pool::{Pool, PoolConfig, PooledConnection};
pub use queues::{MixedQueueSpecError, QueueEntry, QueueSelector};
pub use shutdown::{ShutdownController, ShutdownSignal};
pub use url::{parse_connect_target, resolve_url_from_env, ConnectTarget};
