//! ST-006: Remote cache inventory.
//!
//! One listing of `<root>/<task>/<checksum>.done` markers per host run. The
//! inventory is consumed as tasks run: matched checksums are removed, and
//! whatever remains for a task afterwards is stale.

use super::error::InventoryError;
use crate::commands::quote;
use crate::transport::{capture, Target};
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::LazyLock;

static CHECKSUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[0-9a-f]{64}$").expect("valid checksum regex"));

/// Successful checksums per task, as found on the target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    tasks: FxHashMap<String, FxHashSet<String>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: &str, checksum: &str) {
        self.tasks
            .entry(task.to_string())
            .or_default()
            .insert(checksum.to_string());
    }

    /// The set for a task (empty if the task has never run).
    pub fn get(&self, task: &str) -> FxHashSet<String> {
        self.tasks.get(task).cloned().unwrap_or_default()
    }

    /// Remove and return a task's set.
    pub fn take(&mut self, task: &str) -> FxHashSet<String> {
        self.tasks.remove(task).unwrap_or_default()
    }

    pub fn contains(&self, task: &str, checksum: &str) -> bool {
        self.tasks
            .get(task)
            .is_some_and(|set| set.contains(checksum))
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn marker_count(&self) -> usize {
        self.tasks.values().map(FxHashSet::len).sum()
    }
}

/// Shell that lists every success marker under `root`, tolerating a missing
/// root.
pub fn listing_command(cache_root: &str) -> String {
    let root = quote(cache_root);
    format!("if [ -d {root} ]; then find {root} -type f -name '*.done'; fi")
}

/// Parse the listing output into an inventory.
pub fn parse_listing(cache_root: &str, listing: &str) -> Result<Inventory, InventoryError> {
    let prefix = format!("{}/", cache_root.trim_end_matches('/'));
    let mut inventory = Inventory::new();

    for path in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let layout = || InventoryError::Layout {
            path: path.to_string(),
        };
        let (task, file) = path
            .strip_prefix(&prefix)
            .and_then(|relative| relative.rsplit_once('/'))
            .ok_or_else(layout)?;
        if task.is_empty() {
            return Err(layout());
        }
        let checksum = file.strip_suffix(".done").unwrap_or(file);
        if !CHECKSUM_RE.is_match(checksum) {
            return Err(InventoryError::CorruptChecksum {
                path: path.to_string(),
            });
        }
        inventory.insert(task, checksum);
    }

    Ok(inventory)
}

/// List the target's cache in one remote command.
pub fn build_inventory(target: &dyn Target, cache_root: &str) -> Result<Inventory, InventoryError> {
    let out = capture(target, &listing_command(cache_root))?;
    if !out.success() {
        return Err(InventoryError::Listing {
            exit_code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        });
    }
    let inventory = parse_listing(cache_root, &out.stdout)?;
    log::debug!(
        "inventory on {}: {} marker(s) across {} task(s)",
        target.address(),
        inventory.marker_count(),
        inventory.task_count()
    );
    Ok(inventory)
}
