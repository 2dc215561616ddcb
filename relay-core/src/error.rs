//! Error types shared across relay crates.
//!
//! Only a few conditions ever reach a caller: a response, a deadline, "no
//! endpoints", or an aggregate [`RetryError`]. Discovery failures are absorbed
//! by the watcher and only show up once an error grace window has run out.

use std::fmt;

use thiserror::Error;

/// Failure reported by a discovery backend.
///
/// Comparable so that a repeated failure does not trigger a second
/// notification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// connection or transport-level failure talking to the backend
    #[error("transport error: {0}")]
    Transport(String),

    /// backend answered with a non-success status
    #[error("backend returned status {code}: {message}")]
    Status {
        /// status code returned by the backend
        code: u16,
        /// response body or reason
        message: String,
    },

    /// response could not be decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// the watch was stopped before the query completed
    #[error("discovery stopped")]
    Stopped,
}

/// Errors that cross the boundary of the resolution pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// the resolver knows no usable endpoint
    #[error("no endpoints available")]
    NoEndpoints,

    /// the deadline for the whole call expired
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// the caller cancelled the call
    #[error("operation cancelled")]
    Cancelled,

    /// every attempt failed
    #[error(transparent)]
    Retry(#[from] RetryError),

    /// discovery is failing and the grace window expired
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
}

impl Error {
    /// true for [`Error::DeadlineExceeded`]
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Error::DeadlineExceeded)
    }

    /// true for [`Error::NoEndpoints`]
    pub fn is_no_endpoints(&self) -> bool {
        matches!(self, Error::NoEndpoints)
    }

    /// true for [`Error::Cancelled`]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Every error seen across the attempts of one call, plus the terminal cause
/// if the retry policy replaced the last one.
#[derive(Debug, Default)]
pub struct RetryError {
    raw: Vec<anyhow::Error>,
    final_err: Option<anyhow::Error>,
}

impl RetryError {
    /// empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// record the failure of one attempt
    pub fn push(&mut self, err: anyhow::Error) {
        self.raw.push(err);
    }

    /// set the terminal error
    pub fn set_final(&mut self, err: anyhow::Error) {
        self.final_err = Some(err);
    }

    /// raw errors in attempt order
    pub fn raw_errors(&self) -> &[anyhow::Error] {
        &self.raw
    }

    /// the terminal error, if one was set
    pub fn final_error(&self) -> Option<&anyhow::Error> {
        self.final_err.as_ref()
    }

    /// number of failed attempts
    pub fn attempts(&self) -> usize {
        self.raw.len()
    }
}

impl fmt::Display for RetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.final_err, self.raw.last()) {
            (Some(err), _) | (None, Some(err)) => write!(f, "{err}")?,
            (None, None) => write!(f, "retry failed without attempts")?,
        }
        if self.raw.len() > 1 {
            let previous = self.raw[..self.raw.len() - 1]
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            write!(f, " (previously: {previous})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RetryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.final_err
            .as_ref()
            .or_else(|| self.raw.last())
            .map(|e| {
                let source: &(dyn std::error::Error + 'static) = e.as_ref();
                source
            })
    }
}
