//! Command library: reusable commands that compile to shell text.
//!
//! Every command here quotes its inputs and validates them at compile time,
//! so a bad path or an empty package list fails before any host is touched.

pub mod file;
pub mod package;
pub mod shell;
pub mod user;

pub use file::{Mkdir, WriteFile};
pub use package::{InstallPackages, UpdatePackages};
pub use shell::ShellCommand;
pub use user::AsUser;

use crate::core::error::CommandError;
use shell_escape::unix::escape;

/// Quote one word for a POSIX shell.
pub fn quote(word: &str) -> String {
    escape(word.into()).into_owned()
}

fn require_absolute(kind: &str, path: &str) -> Result<(), CommandError> {
    if !path.starts_with('/') {
        return Err(CommandError::Invalid(format!(
            "{kind} path must be absolute, got {path:?}"
        )));
    }
    Ok(())
}

fn require_mode(mode: Option<&str>) -> Result<(), CommandError> {
    let Some(mode) = mode else {
        return Ok(());
    };
    let octal = (3..=4).contains(&mode.len()) && mode.chars().all(|c| ('0'..='7').contains(&c));
    if !octal {
        return Err(CommandError::Invalid(format!(
            "mode must be 3 or 4 octal digits, got {mode:?}"
        )));
    }
    Ok(())
}

/// `chmod` / `chown` lines for an optional mode and owner.
fn ownership_lines(path: &str, mode: Option<&str>, owner: Option<&str>) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(owner) = owner {
        lines.push(format!("chown {} {}", quote(owner), quote(path)));
    }
    if let Some(mode) = mode {
        lines.push(format!("chmod {} {}", quote(mode), quote(path)));
    }
    lines
}
