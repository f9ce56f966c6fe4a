//! ST-009: Error types for every layer of the engine.
//!
//! Compile-time errors never touch a target. Execution errors carry enough
//! context (host, task, command index) to resume by hand.

use thiserror::Error;

/// Failure to expand a template against its reference.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("unclosed template at position {position} in {template:?}")]
    Unclosed { template: String, position: usize },

    #[error("unknown template field '{field}'")]
    UnknownField { field: String },

    #[error("invalid template expression '{{{{{expr}}}}}' (expected '{{{{ .field }}}}')")]
    Expression { expr: String },

    /// Expansion kept changing after the configured number of rounds.
    #[error("rendering loop: {template:?} did not converge within {rounds} rounds")]
    Loop { template: String, rounds: usize },
}

/// A field value violated its declared constraints.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("field '{field}' is required")]
    Required { field: String },

    #[error("field '{field}' must be at least {min} (got {actual})")]
    Min { field: String, min: i64, actual: i64 },

    #[error("field '{field}' must be at most {max} (got {actual})")]
    Max { field: String, max: i64, actual: i64 },

    #[error("field '{field}' must have size {size} (got {actual})")]
    Size {
        field: String,
        size: usize,
        actual: usize,
    },

    #[error("field '{field}' expects {expected}, got {actual}")]
    Kind {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("constraint '{constraint}' is not supported for {kind} field '{field}'")]
    Unsupported {
        field: String,
        kind: String,
        constraint: String,
    },

    #[error("unknown field '{field}'")]
    UnknownField { field: String },
}

/// A command rejected its own inputs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("command has empty shell text")]
    Empty,

    #[error("{0}")]
    Invalid(String),
}

/// Programmer errors found while compiling the builder graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("duplicate name '{name}'")]
    DuplicateName { name: String },

    #[error("unsupported unit '{name}': {detail}")]
    UnsupportedUnit { name: String, detail: String },

    #[error("validation of '{name}' failed: {source}")]
    Validation {
        name: String,
        #[source]
        source: ValidationError,
    },

    #[error("rendering '{context}' failed: {source}")]
    Render {
        context: String,
        #[source]
        source: RenderError,
    },

    #[error("command {index} of task '{task}' is invalid: {source}")]
    Command {
        task: String,
        index: usize,
        #[source]
        source: CommandError,
    },
}

/// Errors raised by a transport while spawning or waiting on a process.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("process was not started")]
    NotStarted,

    #[error("process I/O error: {0}")]
    Io(String),
}

/// The remote cache could not be listed or trusted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InventoryError {
    #[error("corrupt cache marker '{path}': file name is not a 64-character hex checksum")]
    CorruptChecksum { path: String },

    #[error("unexpected cache layout: '{path}' is not inside a task directory")]
    Layout { path: String },

    #[error("cache listing failed with exit code {exit_code}: {stderr}")]
    Listing { exit_code: i32, stderr: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The remote log append session failed. Never fatal to the command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("log session exited with code {exit_code}")]
    Session { exit_code: i32 },

    #[error("log session has no stdin")]
    NoStdin,

    #[error("writing log line failed: {0}")]
    Write(String),

    #[error("finalizing log failed with exit code {exit_code}: {stderr}")]
    Finalize { exit_code: i32, stderr: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Terminal error of a provisioning run.
#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("host preparation failed (exit code {exit_code}): {stderr}")]
    HostPrep { exit_code: i32, stderr: String },

    #[error("{action} for task '{task}' failed (exit code {exit_code}): {stderr}")]
    Remote {
        task: String,
        action: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("command {index} of task '{task}' failed with exit code {exit_code}")]
    CommandFailed {
        task: String,
        index: usize,
        checksum: String,
        exit_code: i32,
    },

    #[error("{} of {total} host(s) failed: {}", .failures.len(), summarize(.failures))]
    Fleet {
        total: usize,
        failures: Vec<(String, ProvisionError)>,
    },
}

fn summarize(failures: &[(String, ProvisionError)]) -> String {
    failures
        .iter()
        .map(|(host, err)| format!("{host}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_st009_render_error_display() {
        let e = RenderError::Loop {
            template: "{{ .a }}".to_string(),
            rounds: 8,
        };
        assert!(e.to_string().contains("rendering loop"));
        let e = RenderError::Expression {
            expr: "a".to_string(),
        };
        assert!(e.to_string().contains("{{ .field }}"));
    }

    #[test]
    fn test_st009_fleet_error_lists_hosts() {
        let err = ProvisionError::Fleet {
            total: 3,
            failures: vec![(
                "web1".to_string(),
                ProvisionError::HostPrep {
                    exit_code: 1,
                    stderr: "denied".to_string(),
                },
            )],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("1 of 3 host(s) failed"));
        assert!(msg.contains("web1: host preparation failed"));
    }

    #[test]
    fn test_st009_compile_error_keeps_source() {
        use std::error::Error as _;
        let err = CompileError::Validation {
            name: "nginx".to_string(),
            source: ValidationError::Required {
                field: "version".to_string(),
            },
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("nginx"));
    }
}
