//! ST-021: SSH execution transport.
//!
//! Uses the `ssh` binary directly, no libssh2 dependency. The shell text is
//! passed as the remote command so stdin stays free for streaming. With a
//! control path, sessions are multiplexed over one master connection.

use super::{ChildProcess, Process, Target};
use crate::core::error::TransportError;
use crate::core::types::Machine;

#[derive(Debug, Clone)]
pub struct SshTarget {
    user: String,
    addr: String,
    port: u16,
    ssh_key: Option<String>,
    control_path: Option<String>,
}

impl SshTarget {
    pub fn from_machine(machine: &Machine) -> Self {
        Self {
            user: machine.user.clone(),
            addr: machine.addr.clone(),
            port: machine.port,
            ssh_key: machine.ssh_key.as_deref().map(expand_tilde),
            control_path: machine.control_path.as_deref().map(expand_tilde),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.addr)
    }

    /// Connection options shared by commands and `-O exit`.
    fn base_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-o",
            "BatchMode=yes",
            "-o",
            "ConnectTimeout=5",
            "-o",
            "StrictHostKeyChecking=accept-new",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(ref key) = self.ssh_key {
            args.extend(["-i".to_string(), key.clone()]);
        }
        if self.port != 22 {
            args.extend(["-p".to_string(), self.port.to_string()]);
        }
        if let Some(ref path) = self.control_path {
            args.extend([
                "-o".to_string(),
                "ControlMaster=auto".to_string(),
                "-o".to_string(),
                format!("ControlPath={path}"),
                "-o".to_string(),
                "ControlPersist=60".to_string(),
            ]);
        }
        args
    }

    fn command_args(&self, shell: &str) -> Vec<String> {
        let mut args = self.base_args();
        args.push(self.destination());
        args.push(shell.to_string());
        args
    }
}

impl Target for SshTarget {
    fn user(&self) -> &str {
        &self.user
    }

    fn address(&self) -> &str {
        &self.addr
    }

    fn command(&self, shell: &str) -> Result<Box<dyn Process>, TransportError> {
        Ok(Box::new(ChildProcess::new("ssh", &self.command_args(shell))))
    }

    /// Close the multiplexing master; the next command authenticates anew.
    fn reset(&self) -> Result<(), TransportError> {
        if self.control_path.is_none() {
            return Ok(());
        }
        let mut args = self.base_args();
        args.extend(["-O".to_string(), "exit".to_string(), self.destination()]);
        // no running master is fine
        let code = ChildProcess::new("ssh", &args).run()?;
        log::debug!("ssh -O exit {} -> {}", self.addr, code);
        Ok(())
    }
}

/// Expand a leading `~/` to `$HOME`.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> Machine {
        Machine {
            hostname: "web1".to_string(),
            addr: "10.0.0.7".to_string(),
            user: "deploy".to_string(),
            ..Machine::default()
        }
    }

    #[test]
    fn test_st021_ssh_key_expansion() {
        let expanded = expand_tilde("~/.ssh/id_ed25519");
        assert!(expanded.contains(".ssh/id_ed25519"));
        if std::env::var("HOME").is_ok() {
            assert!(!expanded.starts_with('~'));
        }
        assert_eq!(expand_tilde("/etc/key"), "/etc/key");
    }

    #[test]
    fn test_st021_command_args_default_port() {
        let t = SshTarget::from_machine(&machine());
        let args = t.command_args("uptime");
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(!args.contains(&"-p".to_string()));
        assert_eq!(args[args.len() - 2], "deploy@10.0.0.7");
        assert_eq!(args[args.len() - 1], "uptime");
    }

    #[test]
    fn test_st021_command_args_options() {
        let mut m = machine();
        m.port = 2222;
        m.ssh_key = Some("/keys/id".to_string());
        m.control_path = Some("/tmp/strata-%C".to_string());
        let t = SshTarget::from_machine(&m);
        let args = t.command_args("true");
        let joined = args.join(" ");
        assert!(joined.contains("-i /keys/id"));
        assert!(joined.contains("-p 2222"));
        assert!(joined.contains("ControlPath=/tmp/strata-%C"));
        assert!(joined.contains("ControlMaster=auto"));
    }

    #[test]
    fn test_st021_reset_without_control_path_is_noop() {
        let t = SshTarget::from_machine(&machine());
        assert!(t.reset().is_ok());
    }
}
