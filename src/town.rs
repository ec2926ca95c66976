//! Town root discovery and canonical paths.
//!
//! A town is the workspace root hosting rigs, the route table, the central
//! data directory, and the shared SQL server. The root is the unique
//! ancestor containing `mayor/town.json`; discovery walks up from any
//! starting directory.
//!
//! This module also owns the town-level registry `mayor/rigs.json`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TownError};

/// Marker file that identifies a town root, relative to the root.
pub const TOWN_MARKER: &str = "mayor/town.json";

// ---------------------------------------------------------------------------
// Town
// ---------------------------------------------------------------------------

/// Handle to a town root. All canonical paths hang off this value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Town {
    root: PathBuf,
}

impl Town {
    /// Wrap an already-known town root. No validation is performed.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Find the town containing `start` by walking up to the marker file.
    pub fn find(start: &Path) -> Result<Self> {
        let mut dir = if start.is_absolute() {
            start.to_path_buf()
        } else {
            std::env::current_dir()?.join(start)
        };
        loop {
            if dir.join(TOWN_MARKER).is_file() {
                return Ok(Self { root: dir });
            }
            if !dir.pop() {
                return Err(TownError::TownNotFound {
                    start: start.to_path_buf(),
                });
            }
        }
    }

    /// The absolute town root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Town-level beads directory (`.beads/`), holding the route table.
    pub fn beads_dir(&self) -> PathBuf {
        self.root.join(".beads")
    }

    /// The route table file.
    pub fn routes_path(&self) -> PathBuf {
        self.beads_dir().join("routes.jsonl")
    }

    /// Central data directory served by the SQL server.
    pub fn dolt_data_dir(&self) -> PathBuf {
        self.root.join(".dolt-data")
    }

    /// Daemon state directory (lock/pid/log/state files).
    pub fn daemon_dir(&self) -> PathBuf {
        self.root.join("daemon")
    }

    /// Town configuration directory.
    pub fn mayor_dir(&self) -> PathBuf {
        self.root.join("mayor")
    }

    /// The rig registry file.
    pub fn rigs_json_path(&self) -> PathBuf {
        self.mayor_dir().join("rigs.json")
    }

    /// Directory of a named rig.
    pub fn rig_dir(&self, rig: &str) -> PathBuf {
        self.root.join(rig)
    }

    /// Create a new town skeleton at `root`: the marker file plus the
    /// reserved children. Idempotent.
    pub fn create(root: &Path) -> Result<Self> {
        let town = Self::at(root);
        std::fs::create_dir_all(town.mayor_dir())?;
        std::fs::create_dir_all(town.beads_dir())?;
        std::fs::create_dir_all(town.dolt_data_dir())?;
        std::fs::create_dir_all(town.daemon_dir())?;
        let marker = root.join(TOWN_MARKER);
        if !marker.exists() {
            std::fs::write(&marker, "{}\n")?;
        }
        Ok(town)
    }
}

// ---------------------------------------------------------------------------
// Rig registry (mayor/rigs.json)
// ---------------------------------------------------------------------------

/// One entry in `mayor/rigs.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RigEntry {
    /// Upstream git URL the rig was created from.
    pub git_url: String,
    /// Optional local reference repository used for clone acceleration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_repo: Option<String>,
    /// RFC 3339 timestamp of registration.
    pub added_at: String,
    /// Bead settings for the rig.
    #[serde(default)]
    pub beads: RigBeads,
    /// Fields written by other tools are preserved on rewrite.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Bead settings carried in registry and rig config entries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RigBeads {
    /// Issue-id prefix, including the trailing hyphen is NOT stored here;
    /// `"gt"` means ids look like `gt-ab3de`.
    #[serde(default)]
    pub prefix: String,
}

/// The registry of rigs known to the town.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RigRegistry {
    /// Rig name → entry. BTreeMap keeps the file diff-stable.
    #[serde(default)]
    pub rigs: BTreeMap<String, RigEntry>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RigRegistry {
    /// Load the registry. A missing file is an empty registry.
    pub fn load(town: &Town) -> Result<Self> {
        let path = town.rigs_json_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| TownError::Corrupt {
            path,
            detail: e.to_string(),
        })
    }

    /// Persist the registry atomically (temp file + rename).
    pub fn save(&self, town: &Town) -> Result<()> {
        let path = town.rigs_json_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        write_json_atomic(&path, self)
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
///
/// The temp file is created in the target's directory so the rename never
/// crosses filesystems.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(|e| TownError::Corrupt {
        path: path.to_path_buf(),
        detail: format!("serialize failed: {e}"),
    })?;
    tmp.write_all(b"\n")?;
    tmp.persist(path).map_err(|e| TownError::Io(e.error))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
