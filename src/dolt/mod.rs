//! Versioned storage coordinator.
//!
//! One long-lived `dolt sql-server` process serves every logical database
//! under `<town>/.dolt-data/` on a single TCP port. This module owns the
//! server lifecycle, database registration and migration, the per-worker
//! write-branch protocol, the metadata invariant, and health probing with
//! read-only self-healing.
//!
//! The core never speaks MySQL itself; every statement goes through the
//! `dolt sql` CLI (which reaches the running server), so the subprocess
//! seam is the whole interface.

pub mod branch;
pub mod health;
pub mod metadata;
pub mod migrate;
pub mod retry;
pub mod server;
pub mod sql;

use std::path::PathBuf;

use crate::town::Town;

/// Name of the town-level logical database.
pub const TOWN_DB: &str = "hq";

/// Valid logical databases: subdirectories of `.dolt-data/` that contain a
/// `.dolt/` marker. Plain directories without the marker are ignored.
pub fn list_databases(town: &Town) -> crate::error::Result<Vec<String>> {
    let data_dir = town.dolt_data_dir();
    if !data_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(&data_dir)? {
        let entry = entry?;
        if !entry.path().join(".dolt").is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Directory of one logical database.
pub fn database_dir(town: &Town, name: &str) -> PathBuf {
    town.dolt_data_dir().join(name)
}

/// Initialize the logical database for a rig (or the town).
///
/// With the server up, `CREATE DATABASE` both creates the directory and
/// registers it with the live server; no restart needed. With the server
/// down, the directory is initialized locally and the next start picks it
/// up. Either way the metadata invariant is written immediately.
pub fn init_rig(town: &Town, name: &str) -> crate::error::Result<()> {
    validate_database_name(name)?;
    let dir = database_dir(town, name);
    let server = server::DoltServer::with_defaults(town.clone());

    if dir.join(".dolt").is_dir() {
        // Already initialized; just reassert metadata.
        metadata::ensure_metadata(town, name)?;
        return Ok(());
    }

    if server.probe_running().is_some() && server.is_reachable() {
        let sql = sql::DoltSql::new(town.dolt_data_dir());
        sql.query(&format!("CREATE DATABASE `{name}`;"))?;
    } else {
        std::fs::create_dir_all(&dir)?;
        sql::DoltSql::init_in(&dir)?;
    }
    metadata::ensure_metadata(town, name)?;
    Ok(())
}

/// Database names: letters, digits, underscore, hyphen.
pub fn validate_database_name(name: &str) -> crate::error::Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(crate::error::TownError::InvalidRigName {
            name: name.to_owned(),
            reason: "database names use only letters, digits, '_' and '-'".to_owned(),
            suggestion: None,
        })
    }
}
