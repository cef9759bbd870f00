//! Engine error taxonomy.
//!
//! `Usage` and `StrictMiss` are caught at the handler boundary and sent
//! back to the client as a single `error: …` line. `Storage` is fatal at
//! startup only.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DbError {
    /// Malformed arguments or a wrong operand shape (appending to a
    /// mapping, keys of a non-mapping, indexing through a non-mapping,
    /// subtracting absent elements, bad JSON, ...).
    #[error("{0}")]
    Usage(String),

    /// Strict mode indexed through a missing key.
    #[error("{0} not found")]
    StrictMiss(String),

    /// The on-disk file exists but is neither valid JSON nor valid
    /// compressed JSON.
    #[error("could not parse database on disk: {0}")]
    Storage(String),
}

impl DbError {
    pub fn usage(message: impl Into<String>) -> DbError {
        DbError::Usage(message.into())
    }

    /// The single reply line sent to clients for a failed query.
    pub fn reply_line(&self) -> String {
        format!("error: {self}\n")
    }
}
