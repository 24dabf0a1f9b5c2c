pub mod config;
pub mod error;
pub mod facade;
pub mod middleware;
pub mod worker;

pub use config::{CliArgs, EnvConfig, WorkerOptions};
pub use error::WorkerError;
pub use worker::{Worker, WorkerEvent, WorkerState};
