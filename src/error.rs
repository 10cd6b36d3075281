use std::path::PathBuf;
use thiserror::Error;

/// Failure of a single collaborator call. Always recovered into a diagnostic.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("DNS failure: {0}")]
    Dns(String),
    #[error("connection failed: {0}")]
    Connection(String),
    /// The proxy itself misbehaved; the pool should count this against it.
    #[error("proxy {endpoint} failed: {reason}")]
    Proxy { endpoint: String, reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("HTTP failure: {0}")]
    Http(String),
}

impl LookupError {
    pub fn is_proxy_fault(&self) -> bool {
        matches!(self, LookupError::Proxy { .. })
    }
}

impl From<std::io::Error> for LookupError {
    fn from(e: std::io::Error) -> Self {
        LookupError::Connection(e.to_string())
    }
}

impl From<reqwest::Error> for LookupError {
    fn from(e: reqwest::Error) -> Self {
        LookupError::Http(e.to_string())
    }
}

/// Checkpoint or output write failure. Fatal for the run.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("checkpoint write to {path} failed: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("output write to {path} failed: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An input line that cannot become a record.
#[derive(Debug, Error, PartialEq)]
pub enum InputError {
    #[error("{file}:{line}: missing ':' separator")]
    MissingSeparator { file: String, line: usize },
    #[error("{file}:{line}: empty address")]
    EmptyAddress { file: String, line: usize },
    #[error("{file}: unreadable: {reason}")]
    Unreadable { file: String, reason: String },
}
