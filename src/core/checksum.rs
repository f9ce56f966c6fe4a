//! ST-004: Cumulative per-command checksums.
//!
//! Command *i* of a task is identified by the SHA-256 of the shell text of
//! commands `0..=i` concatenated without separator. One hasher runs per task;
//! each checksum is taken from a clone of the running state.

use super::compiler::CompiledTask;
use sha2::{Digest, Sha256};

/// Incremental checksum over a task's commands.
#[derive(Clone, Default)]
pub struct ChecksumChain {
    hasher: Sha256,
}

impl ChecksumChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next command and return its cumulative checksum.
    pub fn push(&mut self, shell: &str) -> String {
        self.hasher.update(shell.as_bytes());
        format!("{:x}", self.hasher.clone().finalize())
    }
}

/// Checksums of every command of a task, in order.
pub fn task_checksums(task: &CompiledTask) -> Vec<String> {
    let mut chain = ChecksumChain::new();
    task.commands.iter().map(|c| chain.push(&c.shell)).collect()
}

/// Checksums of arbitrary shell texts, in order.
pub fn checksums<'a>(shells: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut chain = ChecksumChain::new();
    shells.into_iter().map(|s| chain.push(s)).collect()
}
