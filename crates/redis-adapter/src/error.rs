//! Construction-time error type.
//!
//! The per-message hot path (facade operations, typed stream reads/writes,
//! pub/sub dispatch) never uses this type — it stays on the three-valued
//! sentinel contract described in `driver`. `AdapterError` is reserved for
//! failures that happen once, at setup, where a caller actually wants to
//! `match` on the cause rather than branch on a sentinel integer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("could not establish a cluster or single-node connection: {0}")]
    Connect(#[source] redis::RedisError),

    #[error("invalid connection options: {0}")]
    InvalidOptions(String),

    #[error("worker pool requires at least one worker")]
    EmptyWorkerPool,
}
