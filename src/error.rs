//! Crate-wide error type.
//!
//! One variant per error kind in the transport core's error model: soft
//! errors (`NoResources`, `Unavailable`) are expected to be retried by
//! the caller or the worker loop; the rest are logged at the point of
//! failure and returned.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgs(&'static str),

    #[error("index/size {value} out of range (limit {limit})")]
    OutOfRange { value: usize, limit: usize },

    #[error("no resources available")]
    NoResources,

    #[error("ring unavailable: requested {requested}, available {available}")]
    Unavailable { requested: usize, available: usize },

    #[error("operation not valid in current state")]
    BadState,

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("malformed firmware message: {0}")]
    IoDataIntegrity(&'static str),

    #[error("timed out")]
    TimedOut,

    #[error("connection aborted")]
    ConnectionAborted,

    #[error("I/O error: {0}")]
    Io(&'static str),
}
