//! rigtown library crate; the orchestrator core behind the `gt` binary.
//!
//! A town hosts rigs (source repositories); each rig hosts an agent fleet
//! in git worktrees, with work items ("beads") stored in per-rig databases
//! served by one shared SQL server. The modules here coordinate the
//! external tools (git, dolt, tmux, bd) that do the actual work.

pub mod bd;
pub mod beads;
pub mod config;
pub mod doctor;
pub mod dolt;
pub mod error;
pub mod fields;
pub mod git;
pub mod rig;
pub mod routes;
pub mod session;
pub mod telemetry;
pub mod town;

pub use error::{Result, TownError};
pub use town::Town;
