//! Error taxonomy shared by every `tracecap` crate.
//!
//! A single flattened `thiserror` enum: each failure kind gets its own
//! variant instead of a generic kind wrapped in a `Context`.
//!
//! `EngineBusy` (SQLite `SQLITE_BUSY`/`SQLITE_LOCKED`) is deliberately
//! *not* a variant here: it never surfaces past `safe_transaction`,
//! which retries internally. It is represented as a private
//! step-result inside `tracecap-store`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad element path, mutation attempted after finalize, or a schema
    /// append attempted on a pre-existing store file.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Duplicate table/column, or a default value given for a blob column.
    #[error("schema error: {0}")]
    Schema(String),

    /// Any engine failure other than busy/locked, carrying the offending
    /// SQL and the engine's own message.
    #[error("engine error running `{sql}`: {message}")]
    Engine { sql: String, message: String },

    /// A user's `write_field` call did not match the declared field's
    /// type or width.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// `collect()` was called with a timestamp that did not strictly
    /// increase over the previous tick.
    #[error("collect() called with non-increasing timestamp: previous={previous}, supplied={supplied}")]
    TimeRegression { previous: String, supplied: String },

    /// `stopThread()` (or the Rust equivalent, `StopHandle::stop`) was
    /// invoked from within a `Task::execute()`, which would deadlock the
    /// join.
    #[error("shutdown requested from within a running task; this would deadlock the join")]
    Shutdown,
}

impl Error {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    pub fn schema(reason: impl Into<String>) -> Self {
        Self::Schema(reason.into())
    }

    pub fn engine(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Engine {
            sql: sql.into(),
            message: message.into(),
        }
    }

    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization(reason.into())
    }

    pub fn time_regression(previous: impl Into<String>, supplied: impl Into<String>) -> Self {
        Self::TimeRegression {
            previous: previous.into(),
            supplied: supplied.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
