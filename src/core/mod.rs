//! Core engine: compilation, caching, execution, and the config layer.

pub mod checksum;
pub mod command;
pub mod compiler;
pub mod error;
pub mod inventory;
pub mod parser;
pub mod prepare;
pub mod provision;
pub mod recipe;
pub mod relay;
pub mod runner;
pub mod schema;
pub mod template;
pub mod types;
