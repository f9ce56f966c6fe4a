//! ST-012: Plain shell command with template support.

use crate::core::command::Command;
use crate::core::error::{CommandError, RenderError};
use crate::core::template::Renderer;

/// Runs its text as-is after `{{ .field }}` expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    text: String,
}

impl ShellCommand {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl Command for ShellCommand {
    fn shell(&self) -> String {
        self.text.clone()
    }

    fn logging(&self) -> String {
        let first = self.text.lines().next().unwrap_or_default();
        if self.text.lines().nth(1).is_some() {
            format!("{first} ...")
        } else {
            first.to_string()
        }
    }

    fn render(&mut self, renderer: &Renderer<'_>) -> Result<(), RenderError> {
        self.text = renderer.render(&self.text)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), CommandError> {
        if self.text.trim().is_empty() {
            return Err(CommandError::Empty);
        }
        Ok(())
    }
}
