//! Strata: layered remote provisioning.
//!
//! Builders compile into named tasks of shell commands. Every command gets a
//! cumulative SHA-256 checksum, and the target keeps a marker per successful
//! checksum, so a re-run skips the unchanged prefix of each task and resumes
//! from the first edited command.

pub mod cli;
pub mod commands;
pub mod core;
pub mod events;
pub mod transport;
