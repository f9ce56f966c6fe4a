//! ST-030: Configuration file types.
//!
//! Defines the YAML schema for machines, settings, recipes, and the root
//! provisioning steps. All types derive Serialize/Deserialize for YAML
//! roundtripping.

use super::recipe::{RecipeDecl, Step};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Top-level strata.yaml
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Human-readable name
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Root template fields, kinds inferred from the YAML values
    #[serde(default)]
    pub params: IndexMap<String, serde_yaml_ng::Value>,

    #[serde(default)]
    pub settings: Settings,

    /// Hosts to provision (order-preserving)
    #[serde(default)]
    pub machines: IndexMap<String, Machine>,

    /// Reusable packages
    #[serde(default)]
    pub recipes: IndexMap<String, RecipeDecl>,

    /// Root steps, compiled against `params`
    #[serde(default)]
    pub provision: Vec<Step>,
}

// ============================================================================
// Machines
// ============================================================================

/// A provisioned host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub hostname: String,

    /// Network address (IP or DNS)
    pub addr: String,

    /// SSH user
    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to SSH private key
    #[serde(default)]
    pub ssh_key: Option<String>,

    /// SSH ControlPath for connection multiplexing
    #[serde(default)]
    pub control_path: Option<String>,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            addr: String::new(),
            user: default_user(),
            port: default_port(),
            ssh_key: None,
            control_path: None,
        }
    }
}

fn default_user() -> String {
    "root".to_string()
}

fn default_port() -> u16 {
    22
}

// ============================================================================
// Settings
// ============================================================================

/// When commands run through `sudo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Elevation {
    /// Elevate unless the login user is root
    #[default]
    Auto,
    Always,
    Never,
}

impl Elevation {
    pub fn applies(self, user: &str) -> bool {
        match self {
            Self::Auto => user != "root",
            Self::Always => true,
            Self::Never => false,
        }
    }
}

impl fmt::Display for Elevation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Always => write!(f, "always"),
            Self::Never => write!(f, "never"),
        }
    }
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Remote cache directory
    pub cache_root: String,

    /// Group owning the cache
    pub cache_group: String,

    /// Exported before every command
    pub env: IndexMap<String, String>,

    pub elevation: Elevation,

    /// Create the cache group and root on first contact
    pub manage_group: bool,

    /// Bound on template expansion rounds
    pub render_rounds: usize,

    /// Provision hosts concurrently
    pub parallel_hosts: bool,

    /// Per-subscriber event queue capacity
    pub event_queue: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_root: "/var/lib/strata".to_string(),
            cache_group: "strata".to_string(),
            env: IndexMap::new(),
            elevation: Elevation::default(),
            manage_group: true,
            render_rounds: super::template::DEFAULT_RENDER_ROUNDS,
            parallel_hosts: true,
            event_queue: crate::events::bus::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

// ============================================================================
// Template helper
// ============================================================================

/// Convert a serde_yaml_ng::Value to a string for display.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

// ============================================================================
// Tests
// ============================================================================
