//! Structured run events: the in-process bus and the JSONL event log.

pub mod bus;
pub mod eventlog;

pub use bus::{BusStats, EventBus, Subscription, SubscriptionHandle};

use serde::{Deserialize, Serialize};

/// Which output stream a relayed line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamOrigin {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Event payloads. `category()` gives the dotted name subscribers filter on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    TaskCompiled {
        task: String,
        commands: usize,
    },
    HostStarted {
        tasks: usize,
        dry_run: bool,
    },
    HostFinished {
        executed: usize,
        cached: usize,
        invalidated: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    CommandCached {
        task: String,
        index: usize,
        checksum: String,
        logging: String,
    },
    CommandExecStart {
        task: String,
        index: usize,
        checksum: String,
        logging: String,
    },
    CommandExecFinished {
        task: String,
        index: usize,
        checksum: String,
        exit_code: i32,
        duration_ms: u64,
        /// Set when the command could not be run or waited on.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    CommandStream {
        task: String,
        checksum: String,
        stream: StreamOrigin,
        line: String,
    },
    CacheInvalidated {
        task: String,
        checksums: Vec<String>,
    },
    LogRelayFailed {
        task: String,
        checksum: String,
        error: String,
    },
}

impl EventKind {
    pub fn category(&self) -> &'static str {
        match self {
            Self::TaskCompiled { .. } => "task.compiled",
            Self::HostStarted { .. } => "host.started",
            Self::HostFinished { .. } => "host.finished",
            Self::CommandCached { .. } => "command.cached",
            Self::CommandExecStart { .. } => "command.exec_start",
            Self::CommandExecFinished { .. } => "command.exec_finished",
            Self::CommandStream { .. } => "command.stream",
            Self::CacheInvalidated { .. } => "cache.invalidated",
            Self::LogRelayFailed { .. } => "log.relay_failed",
        }
    }
}

/// A timestamped event, optionally scoped to a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(host: Option<&str>, kind: EventKind) -> Self {
        Self {
            ts: eventlog::now_iso8601(),
            host: host.map(str::to_string),
            kind,
        }
    }

    pub fn category(&self) -> &'static str {
        self.kind.category()
    }
}
