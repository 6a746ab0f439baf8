//! Error taxonomy for the cluster-sync subsystem.
//!
//! Every error carries a scope that decides how far its failure
//! propagates:
//!
//! - `Pass`   — coordination-store or role failures; the whole
//!              reconciliation pass aborts and is retried on the next
//!              external trigger.
//! - `Shard`  — remote-leader transport/protocol failures; only the
//!              affected shard's sync run aborts.
//! - `Object` — local-storage failures on a single database, shard or
//!              index; captured as an `ObjectError`, surfaced in
//!              Current, and the pass continues.

use thiserror::Error;

/// Convenience alias for `Result<T, OspreyError>`.
pub type OspreyResult<T> = Result<T, OspreyError>;

/// How far a failure propagates (see module docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Pass,
    Shard,
    Object,
}

/// Top-level error type that all subsystem errors convert into.
#[derive(Error, Debug)]
pub enum OspreyError {
    #[error("agency error: {0}")]
    Agency(#[from] AgencyError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("replication error: {0}")]
    Replication(#[from] ReplicationError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("role error: {0}")]
    Role(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// Context wrapper; classification delegates to the source.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<OspreyError>,
    },
}

/// Errors talking to the external coordination store.
#[derive(Error, Debug)]
pub enum AgencyError {
    #[error("write lock on '{partition}' not acquired within {timeout_ms} ms")]
    LockTimeout { partition: String, timeout_ms: u64 },

    #[error("write conflict on '{0}'")]
    Conflict(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("malformed value at '{path}': {reason}")]
    Malformed { path: String, reason: String },

    #[error("agency transport: {0}")]
    Transport(String),
}

/// A local storage-engine failure, carried with the engine's numeric
/// error code so it can be surfaced verbatim in Current.
#[derive(Error, Debug, Clone)]
#[error("[{code}] {message}")]
pub struct StoreError {
    pub code: i64,
    pub message: String,
}

impl StoreError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors from the replication client (initial sync, finalize, applier).
#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("initial sync of '{db}/{shard}' failed: {reason}")]
    InitialSync {
        db: String,
        shard: String,
        reason: String,
    },

    #[error("sync finalize of '{db}/{shard}' failed: {reason}")]
    Finalize {
        db: String,
        shard: String,
        reason: String,
    },

    #[error("replication applier for '{db}' failed: {reason}")]
    Applier { db: String, reason: String },
}

/// Errors from HTTP calls to peer servers.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("bad response body from {url}: {reason}")]
    BadBody { url: String, reason: String },

    #[error("read lock at {url} not confirmed after {attempts} attempts")]
    LockNotConfirmed { url: String, attempts: u32 },
}

impl OspreyError {
    /// Classify this error for abort/continue decisions.
    pub fn scope(&self) -> ErrorScope {
        match self {
            OspreyError::Agency(_) | OspreyError::Role(_) | OspreyError::Internal(_) => {
                ErrorScope::Pass
            }
            OspreyError::Replication(_) | OspreyError::Transport(_) => ErrorScope::Shard,
            OspreyError::Store(_) => ErrorScope::Object,
            OspreyError::Context { source, .. } => source.scope(),
        }
    }

    /// True when this failure must abort the whole reconciliation pass.
    pub fn is_pass_fatal(&self) -> bool {
        self.scope() == ErrorScope::Pass
    }

    /// Wrap with a context string, preserving classification.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        OspreyError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Add context to a Result, preserving error classification.
/// Usage: `agency.get(path).ctx("reading plan snapshot")?`
pub trait ErrorContext<T> {
    fn ctx(self, context: &str) -> OspreyResult<T>;
    fn ctx_with(self, f: impl FnOnce() -> String) -> OspreyResult<T>;
}

impl<T, E: Into<OspreyError>> ErrorContext<T> for Result<T, E> {
    fn ctx(self, context: &str) -> OspreyResult<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn ctx_with(self, f: impl FnOnce() -> String) -> OspreyResult<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}
