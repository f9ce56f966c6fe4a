//! ST-014: Package commands (apt).

use super::quote;
use crate::core::command::Command;
use crate::core::error::{CommandError, RenderError};
use crate::core::template::Renderer;

/// Installs packages that are not yet present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPackages {
    pub packages: Vec<String>,
}

impl InstallPackages {
    pub fn new<S: Into<String>>(packages: impl IntoIterator<Item = S>) -> Self {
        Self {
            packages: packages.into_iter().map(Into::into).collect(),
        }
    }
}

impl Command for InstallPackages {
    fn shell(&self) -> String {
        let joined = self
            .packages
            .iter()
            .map(|p| quote(p))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "NEED_INSTALL=0\n\
             for pkg in {joined}; do\n\
               dpkg -s \"$pkg\" >/dev/null 2>&1 || NEED_INSTALL=1\n\
             done\n\
             if [ \"$NEED_INSTALL\" = \"1\" ]; then\n\
               DEBIAN_FRONTEND=noninteractive apt-get install -y -qq {joined}\n\
             fi"
        )
    }

    fn logging(&self) -> String {
        format!("install {}", self.packages.join(" "))
    }

    fn render(&mut self, renderer: &Renderer<'_>) -> Result<(), RenderError> {
        for package in &mut self.packages {
            *package = renderer.render(package)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), CommandError> {
        if self.packages.is_empty() {
            return Err(CommandError::Invalid(
                "install_packages needs at least one package".to_string(),
            ));
        }
        if let Some(bad) = self
            .packages
            .iter()
            .find(|p| p.is_empty() || p.starts_with('-'))
        {
            return Err(CommandError::Invalid(format!(
                "invalid package name {bad:?}"
            )));
        }
        Ok(())
    }
}

/// Refreshes the package index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdatePackages;

impl Command for UpdatePackages {
    fn shell(&self) -> String {
        "DEBIAN_FRONTEND=noninteractive apt-get update -qq".to_string()
    }

    fn logging(&self) -> String {
        "update package index".to_string()
    }
}
