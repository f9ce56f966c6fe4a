//! ST-015: Run a command as another user.

use super::quote;
use crate::core::command::Command;
use crate::core::error::{CommandError, RenderError};
use crate::core::template::Renderer;

/// `su -l <user> -c <run>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsUser {
    pub user: String,
    pub run: String,
}

impl AsUser {
    pub fn new(user: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            run: run.into(),
        }
    }
}

impl Command for AsUser {
    fn shell(&self) -> String {
        format!("su -l {} -c {}", quote(&self.user), quote(&self.run))
    }

    fn logging(&self) -> String {
        format!("as {}: {}", self.user, self.run)
    }

    fn render(&mut self, renderer: &Renderer<'_>) -> Result<(), RenderError> {
        self.user = renderer.render(&self.user)?;
        self.run = renderer.render(&self.run)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), CommandError> {
        if self.user.trim().is_empty() {
            return Err(CommandError::Invalid("as_user needs a user".to_string()));
        }
        if self.run.trim().is_empty() {
            return Err(CommandError::Empty);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_st015_as_user_quotes() {
        let cmd = AsUser::new("deploy", "cd ~/app && ./bin/migrate");
        assert_eq!(cmd.shell(), "su -l deploy -c 'cd ~/app && ./bin/migrate'");
    }

    #[test]
    fn test_st015_as_user_validation() {
        assert!(AsUser::new("", "true").validate().is_err());
        assert_eq!(AsUser::new("u", "").validate(), Err(CommandError::Empty));
    }
}
