//! ST-020/021: Transport abstraction: local and SSH execution.
//!
//! A [`Target`] turns shell text into a [`Process`] whose stdio the caller
//! can stream. Both transports spawn a system binary (`bash`, `ssh`) with
//! piped stdio, so they share [`ChildProcess`].

pub mod local;
pub mod ssh;

pub use local::LocalTarget;
pub use ssh::SshTarget;

use crate::core::error::TransportError;
use crate::core::types::Machine;
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};

/// A host that can run shell text.
pub trait Target: Send + Sync {
    /// Login user on the target.
    fn user(&self) -> &str;

    /// Address used in logs and events.
    fn address(&self) -> &str;

    /// Prepare (but do not start) a process running `shell`.
    fn command(&self, shell: &str) -> Result<Box<dyn Process>, TransportError>;

    /// Drop cached sessions so the next command sees fresh credentials
    /// (for example a new group membership).
    fn reset(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A spawned (or spawnable) process with streamable stdio.
pub trait Process: Send {
    fn start(&mut self) -> Result<(), TransportError>;

    /// Close stdin if still held, wait, and return the exit code
    /// (`-1` when killed by a signal).
    fn wait(&mut self) -> Result<i32, TransportError>;

    /// Start, discard output, wait.
    fn run(&mut self) -> Result<i32, TransportError> {
        self.start()?;
        Ok(drain(self)?.exit_code)
    }

    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>>;
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>>;
    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>>;
}

/// Output from executing a script on a target.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `shell` on the target and collect its output.
pub fn capture(target: &dyn Target, shell: &str) -> Result<ExecOutput, TransportError> {
    let mut process = target.command(shell)?;
    process.start()?;
    drain(process.as_mut())
}

/// Read both output streams of a started process to EOF, then wait.
fn drain<P: Process + ?Sized>(process: &mut P) -> Result<ExecOutput, TransportError> {
    drop(process.take_stdin());
    let stdout = process.take_stdout();
    let stderr = process.take_stderr();
    let (stdout, stderr) = std::thread::scope(|s| {
        let err = s.spawn(|| read_all(stderr));
        let out = read_all(stdout);
        (out, err.join().unwrap_or_default())
    });
    let exit_code = process.wait()?;
    Ok(ExecOutput {
        exit_code,
        stdout,
        stderr,
    })
}

fn read_all(stream: Option<Box<dyn Read + Send>>) -> String {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        // a broken pipe only truncates diagnostics
        let _ = stream.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// A `std::process::Command` behind the [`Process`] interface.
pub struct ChildProcess {
    program: String,
    command: Command,
    child: Option<Child>,
}

impl ChildProcess {
    pub fn new(program: &str, args: &[String]) -> Self {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Self {
            program: program.to_string(),
            command,
            child: None,
        }
    }
}

impl Process for ChildProcess {
    fn start(&mut self) -> Result<(), TransportError> {
        let child = self
            .command
            .spawn()
            .map_err(|e| TransportError::Spawn {
                program: self.program.clone(),
                message: e.to_string(),
            })?;
        self.child = Some(child);
        Ok(())
    }

    fn wait(&mut self) -> Result<i32, TransportError> {
        let child = self.child.as_mut().ok_or(TransportError::NotStarted)?;
        drop(child.stdin.take());
        let status = child
            .wait()
            .map_err(|e| TransportError::Io(format!("{} wait error: {e}", self.program)))?;
        Ok(status.code().unwrap_or(-1))
    }

    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        let stdin = self.child.as_mut()?.stdin.take()?;
        Some(Box::new(stdin))
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        let stdout = self.child.as_mut()?.stdout.take()?;
        Some(Box::new(stdout))
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        let stderr = self.child.as_mut()?.stderr.take()?;
        Some(Box::new(stderr))
    }
}

/// Pick a transport for a machine: local addresses run through `bash`,
/// everything else through `ssh`.
pub fn target_for(machine: &Machine) -> Box<dyn Target> {
    if is_local_addr(&machine.addr) {
        Box::new(LocalTarget::new())
    } else {
        Box::new(SshTarget::from_machine(machine))
    }
}

/// Check if an address is this machine.
fn is_local_addr(addr: &str) -> bool {
    if addr == "127.0.0.1" || addr == "localhost" || addr == "::1" {
        return true;
    }
    if let Ok(hostname) = std::fs::read_to_string("/etc/hostname") {
        if addr == hostname.trim() {
            return true;
        }
    }
    false
}
