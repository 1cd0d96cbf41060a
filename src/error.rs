//! Error types for hook tracing
//!
//! Instrumentation errors never cross into the host application's call path:
//! the wrapper logs and swallows them. They exist so the watcher and the
//! reporters can surface desynchronisation in diagnostics and tests.

use thiserror::Error;

use crate::invocation::InvocationId;

/// Errors raised by the invocation watcher
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatcherError {
    /// An after-event arrived while no invocation was open
    #[error("integrity error: after-event for invocation {handle} with an empty stack")]
    StackUnderflow { handle: InvocationId },

    /// An after-event arrived for something other than the top of the stack
    #[error("integrity error: after-event for invocation {found}, but invocation {expected} is on top of the stack")]
    OutOfOrder {
        expected: InvocationId,
        found: InvocationId,
    },

    /// The id does not belong to this watcher
    #[error("unknown invocation {0}")]
    UnknownInvocation(InvocationId),

    /// The invocation never received its after-event
    #[error("incomplete invocation {0}: no end time recorded")]
    IncompleteInvocation(InvocationId),
}

impl WatcherError {
    /// Whether this error indicates desynchronised before/after events
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, Self::StackUnderflow { .. } | Self::OutOfOrder { .. })
    }
}

/// Errors loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid component root `{0}` (expected TYPE=PREFIX)")]
    InvalidRoot(String),

    #[error("unknown component type `{0}`")]
    UnknownComponentType(String),
}

/// Errors reading a recorded hook trace
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line}: after-event for unknown recorded id {id}")]
    UnknownRecordedId { line: usize, id: u64 },

    #[error("line {line}: timestamp {at_us}us goes backwards (previous {previous_us}us)")]
    NonMonotonicClock {
        line: usize,
        at_us: u64,
        previous_us: u64,
    },

    #[error("line {line}: {source}")]
    Watcher {
        line: usize,
        #[source]
        source: WatcherError,
    },

    #[error("failed to read trace: {0}")]
    Io(#[from] std::io::Error),
}
