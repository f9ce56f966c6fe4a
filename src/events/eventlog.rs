//! ST-011: Append-only JSONL event log.

use super::Event;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use thiserror::Error;

/// Events without a host are filed under this name.
pub const FLEET_LOG: &str = "_fleet";

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("cannot create {path}: {source}")]
    Create {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot append to {path}: {source}")]
    Append {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Generate an ISO 8601 timestamp (UTC, millisecond precision).
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = dur.as_secs();
    let millis = dur.subsec_millis();
    let days = secs / 86400;
    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    let (y, m, d) = civil_from_days(days as i64);
    format!("{y:04}-{m:02}-{d:02}T{hours:02}:{minutes:02}:{seconds:02}.{millis:03}Z")
}

/// Days since the epoch to a (year, month, day) Gregorian date.
fn civil_from_days(days: i64) -> (i64, u32, i64) {
    let mut y = 1970i64;
    let mut remaining = days;
    loop {
        let year_days = if is_leap(y) { 366 } else { 365 };
        if remaining < year_days {
            break;
        }
        remaining -= year_days;
        y += 1;
    }
    let feb = if is_leap(y) { 29 } else { 28 };
    let month_days = [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut m = 12;
    for (i, &md) in month_days.iter().enumerate() {
        if remaining < md {
            m = i as u32 + 1;
            break;
        }
        remaining -= md;
    }
    (y, m, remaining + 1)
}

fn is_leap(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Derive the event log path for a host.
pub fn event_log_path(state_dir: &Path, host: &str) -> PathBuf {
    state_dir.join(host).join("events.jsonl")
}

/// Append one event to its host's log.
pub fn append_event(state_dir: &Path, event: &Event) -> Result<(), EventLogError> {
    let host = event.host.as_deref().unwrap_or(FLEET_LOG);
    let path = event_log_path(state_dir, host);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| EventLogError::Create {
            path: parent.display().to_string(),
            source,
        })?;
    }

    let json = serde_json::to_string(event)?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| writeln!(file, "{json}"))
        .map_err(|source| EventLogError::Append {
            path: path.display().to_string(),
            source,
        })
}

/// Drain a subscription into the log until the bus side disconnects.
/// Returns how many events were written; write failures are logged and
/// skipped.
pub fn write_events(state_dir: &Path, events: Receiver<Event>) -> usize {
    let mut written = 0;
    for event in events {
        match append_event(state_dir, &event) {
            Ok(()) => written += 1,
            Err(e) => log::warn!("event log: {e}"),
        }
    }
    written
}
