//! ST-013: File and directory commands.

use super::{ownership_lines, quote, require_absolute, require_mode};
use crate::core::command::Command;
use crate::core::error::{CommandError, RenderError};
use crate::core::template::Renderer;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::Path;

/// Writes `content` to `path`. Content travels base64-encoded so any bytes
/// survive shell quoting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFile {
    pub path: String,
    pub content: String,
    pub mode: Option<String>,
    pub owner: Option<String>,
}

impl WriteFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            mode: None,
            owner: None,
        }
    }

    #[must_use]
    pub fn mode(mut self, mode: &str) -> Self {
        self.mode = Some(mode.to_string());
        self
    }

    #[must_use]
    pub fn owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }
}

impl Command for WriteFile {
    fn shell(&self) -> String {
        let mut lines = Vec::new();
        if let Some(parent) = Path::new(&self.path).parent() {
            if parent != Path::new("/") {
                lines.push(format!("mkdir -p {}", quote(&parent.to_string_lossy())));
            }
        }
        lines.push(format!(
            "printf '%s' {} | base64 -d > {}",
            STANDARD.encode(self.content.as_bytes()),
            quote(&self.path)
        ));
        lines.extend(ownership_lines(
            &self.path,
            self.mode.as_deref(),
            self.owner.as_deref(),
        ));
        lines.join("\n")
    }

    fn logging(&self) -> String {
        format!("write {} ({} bytes)", self.path, self.content.len())
    }

    fn render(&mut self, renderer: &Renderer<'_>) -> Result<(), RenderError> {
        self.path = renderer.render(&self.path)?;
        self.content = renderer.render(&self.content)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), CommandError> {
        require_absolute("write_file", &self.path)?;
        require_mode(self.mode.as_deref())
    }
}

/// Creates a directory (and parents).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mkdir {
    pub path: String,
    pub mode: Option<String>,
    pub owner: Option<String>,
}

impl Mkdir {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: None,
            owner: None,
        }
    }

    #[must_use]
    pub fn mode(mut self, mode: &str) -> Self {
        self.mode = Some(mode.to_string());
        self
    }

    #[must_use]
    pub fn owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }
}

impl Command for Mkdir {
    fn shell(&self) -> String {
        let mut lines = vec![format!("mkdir -p {}", quote(&self.path))];
        lines.extend(ownership_lines(
            &self.path,
            self.mode.as_deref(),
            self.owner.as_deref(),
        ));
        lines.join("\n")
    }

    fn logging(&self) -> String {
        format!("mkdir {}", self.path)
    }

    fn render(&mut self, renderer: &Renderer<'_>) -> Result<(), RenderError> {
        self.path = renderer.render(&self.path)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), CommandError> {
        require_absolute("mkdir", &self.path)?;
        require_mode(self.mode.as_deref())
    }
}
