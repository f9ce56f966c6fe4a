//! ST-020: Local execution transport.

use super::{ChildProcess, Process, Target};
use crate::core::error::TransportError;

/// Runs commands on this machine via `bash -c`.
#[derive(Debug, Clone)]
pub struct LocalTarget {
    user: String,
}

impl Default for LocalTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTarget {
    /// Current user from `$USER` (or `$LOGNAME`), falling back to `root`.
    pub fn new() -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "root".to_string());
        Self { user }
    }

    pub fn with_user(user: &str) -> Self {
        Self {
            user: user.to_string(),
        }
    }
}

impl Target for LocalTarget {
    fn user(&self) -> &str {
        &self.user
    }

    fn address(&self) -> &str {
        "localhost"
    }

    fn command(&self, shell: &str) -> Result<Box<dyn Process>, TransportError> {
        Ok(Box::new(ChildProcess::new(
            "bash",
            &["-c".to_string(), shell.to_string()],
        )))
    }
}
