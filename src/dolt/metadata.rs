//! The beads-directory metadata invariant.
//!
//! Every logical database referenced by a worktree carries a
//! `metadata.json` in its resolved beads directory declaring the server
//! backend and the database name. Writes are atomic and preserve fields
//! this module does not own, so other tools can annotate the file freely.
//!
//! The inter-process story is the daemon file lock; within one process,
//! concurrent threads writing the same file are serialized by a per-path
//! mutex keyed on the absolute metadata path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::{json, Map, Value};

use crate::beads;
use crate::error::{Result, TownError};
use crate::town::{write_json_atomic, Town};

/// Metadata file name inside a beads directory.
pub const METADATA_FILE: &str = "metadata.json";

/// The invariant keys and their required values for `database` name `name`.
fn invariant_entries(name: &str) -> [(&'static str, Value); 5] {
    [
        ("database", json!("dolt")),
        ("backend", json!("dolt")),
        ("dolt_mode", json!("server")),
        ("dolt_database", json!(name)),
        ("jsonl_export", json!("issues.jsonl")),
    ]
}

// ---------------------------------------------------------------------------
// Per-path mutex registry
// ---------------------------------------------------------------------------

fn path_mutex(path: &Path) -> Arc<Mutex<()>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    map.entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

// ---------------------------------------------------------------------------
// Ensure
// ---------------------------------------------------------------------------

/// The beads directory that holds metadata for database `name`.
///
/// The town database lives in the town's own `.beads/`; rig databases in
/// the rig's canonical beads directory (created when missing).
pub fn metadata_dir(town: &Town, name: &str) -> Result<PathBuf> {
    if name == super::TOWN_DB {
        let dir = town.beads_dir();
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    } else {
        beads::find_or_create_rig_beads_dir(town, name)
    }
}

/// Assert the metadata invariant for database `name`.
///
/// Returns `true` when the file changed. Unknown fields are preserved;
/// rewrites are atomic; concurrent in-process callers serialize on the
/// file path.
pub fn ensure_metadata(town: &Town, name: &str) -> Result<bool> {
    let dir = metadata_dir(town, name)?;
    let path = dir.join(METADATA_FILE);
    let guard_slot = path_mutex(&path);
    let _guard = guard_slot
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    let mut map: Map<String, Value> = match std::fs::read_to_string(&path) {
        Ok(content) => serde_json::from_str(&content).map_err(|e| TownError::Corrupt {
            path: path.clone(),
            detail: e.to_string(),
        })?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
        Err(err) => return Err(TownError::Io(err)),
    };

    let mut changed = false;
    for (key, value) in invariant_entries(name) {
        if map.get(key) != Some(&value) {
            map.insert(key.to_owned(), value);
            changed = true;
        }
    }
    if changed {
        write_json_atomic(&path, &Value::Object(map))?;
    }
    Ok(changed)
}

/// Assert the invariant for every database in the town.
///
/// Returns the list of updated databases and the errors encountered; one
/// broken rig does not stop the sweep.
pub fn ensure_all_metadata(town: &Town) -> Result<(Vec<String>, Vec<(String, TownError)>)> {
    let mut updated = Vec::new();
    let mut errors = Vec::new();
    for name in super::list_databases(town)? {
        match ensure_metadata(town, &name) {
            Ok(true) => updated.push(name),
            Ok(false) => {}
            Err(err) => errors.push((name, err)),
        }
    }
    Ok((updated, errors))
}

// ---------------------------------------------------------------------------
// Broken-workspace scan
// ---------------------------------------------------------------------------

/// A workspace whose metadata names a database that no longer exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokenWorkspace {
    /// Rig name, or the town database name for the town itself.
    pub owner: String,
    /// The beads directory holding the stale metadata.
    pub beads_dir: PathBuf,
    /// The database the metadata declares.
    pub declared_database: String,
}

/// Scan the town and every rig for metadata declaring a database missing
/// from `.dolt-data/`. Corrupt metadata files are skipped with a warning;
/// the repair path owns rewriting them.
pub fn find_broken_workspaces(town: &Town) -> Result<Vec<BrokenWorkspace>> {
    let databases = super::list_databases(town)?;
    let mut broken = Vec::new();

    let mut scan = |owner: &str, beads_dir: PathBuf| {
        let path = beads_dir.join(METADATA_FILE);
        if !path.is_file() {
            return;
        }
        let declared = match std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str::<Value>(&content).ok())
        {
            Some(value) => value
                .get("dolt_database")
                .and_then(Value::as_str)
                .map(str::to_owned),
            None => {
                tracing::warn!(path = %path.display(), "skipping corrupt metadata");
                return;
            }
        };
        let Some(declared) = declared else { return };
        if !databases.contains(&declared) {
            broken.push(BrokenWorkspace {
                owner: owner.to_owned(),
                beads_dir: beads_dir.clone(),
                declared_database: declared,
            });
        }
    };

    scan(super::TOWN_DB, town.beads_dir());
    for entry in std::fs::read_dir(town.root())? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !entry.path().is_dir() || name.starts_with('.') || name == "mayor" || name == "daemon"
        {
            continue;
        }
        scan(&name, beads::rig_beads_dir(town, &name));
    }
    Ok(broken)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
