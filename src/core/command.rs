//! ST-001: The command abstraction.
//!
//! A command yields the shell text that runs on the target and a short
//! human-readable description for logs. Commands that carry templates expand
//! them during compilation; afterwards only the frozen [`CompiledCommand`]
//! survives.

use super::error::{CommandError, RenderError};
use super::template::Renderer;

pub trait Command: Send + Sync {
    /// Shell text executed on the target.
    fn shell(&self) -> String;

    /// Description used in logs and events.
    fn logging(&self) -> String;

    /// Expand templates against the renderer's reference.
    fn render(&mut self, _renderer: &Renderer<'_>) -> Result<(), RenderError> {
        Ok(())
    }

    /// Check the command's own inputs.
    fn validate(&self) -> Result<(), CommandError> {
        Ok(())
    }
}

/// Immutable output of compilation: what runs and how it is described.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCommand {
    pub shell: String,
    pub logging: String,
}

impl CompiledCommand {
    pub fn new(shell: impl Into<String>, logging: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            logging: logging.into(),
        }
    }

    /// Freeze a command, rejecting empty shell text.
    pub fn freeze(command: &dyn Command) -> Result<Self, CommandError> {
        command.validate()?;
        let shell = command.shell();
        if shell.trim().is_empty() {
            return Err(CommandError::Empty);
        }
        Ok(Self {
            shell,
            logging: command.logging(),
        })
    }
}

impl From<&str> for Box<dyn Command> {
    fn from(shell: &str) -> Self {
        Box::new(crate::commands::ShellCommand::new(shell))
    }
}

impl From<String> for Box<dyn Command> {
    fn from(shell: String) -> Self {
        Box::new(crate::commands::ShellCommand::new(shell))
    }
}
