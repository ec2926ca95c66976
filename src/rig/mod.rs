//! Rig structure: configuration, naming, and layout.
//!
//! A rig is one source repository with its agent fleet. On disk it holds a
//! hidden shared bare repo (`.repo.git`), a regular mayor clone
//! (`mayor/rig`), a refinery worktree (`refinery/rig`), `crew/` and
//! `polecats/` worktree containers, a `witness/` directory, plugins, and a
//! `.beads/` directory that is usually a redirect into the mayor clone.

pub mod add;
pub mod hooks;
pub mod redirect;
pub mod register;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TownError};
use crate::town::{RigBeads, Town};

/// Reserved rig name: the town-level database.
pub const RESERVED_NAMES: &[&str] = &["hq"];

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Validate a rig name.
///
/// Rig names feed the agent-id grammar, which uses `-` as its field
/// separator; so hyphens (and dots and spaces) are rejected outright,
/// with a sanitized candidate in the error. `hq` is reserved.
pub fn validate_rig_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TownError::InvalidRigName {
            name: name.to_owned(),
            reason: "empty".to_owned(),
            suggestion: None,
        });
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(TownError::InvalidRigName {
            name: name.to_owned(),
            reason: "reserved for the town".to_owned(),
            suggestion: None,
        });
    }
    let bad: Vec<char> = name
        .chars()
        .filter(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && *c != '_')
        .collect();
    if !bad.is_empty() {
        return Err(TownError::InvalidRigName {
            name: name.to_owned(),
            reason: format!("contains {bad:?}"),
            suggestion: Some(sanitize_rig_name(name)),
        });
    }
    Ok(())
}

/// Produce a name that would pass validation: lowercase, separators
/// mapped to underscores, everything else dropped.
pub fn sanitize_rig_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            out.push(c);
        } else if c == '-' || c == '.' || c == ' ' {
            out.push('_');
        }
    }
    out
}

/// Default issue prefix for a rig name: its first two characters.
pub fn default_prefix(name: &str) -> String {
    name.chars().take(2).collect()
}

// ---------------------------------------------------------------------------
// Rig config (config.json)
// ---------------------------------------------------------------------------

/// Per-rig configuration, stored at `<rig>/config.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RigConfig {
    pub name: String,
    pub git_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_repo: Option<String>,
    pub default_branch: String,
    pub created_at: String,
    #[serde(default)]
    pub beads: RigBeads,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RigConfig {
    pub fn path(town: &Town, name: &str) -> PathBuf {
        town.rig_dir(name).join("config.json")
    }

    pub fn load(town: &Town, name: &str) -> Result<Self> {
        let path = Self::path(town, name);
        let content = std::fs::read_to_string(&path).map_err(|_| TownError::RigNotFound {
            name: name.to_owned(),
        })?;
        serde_json::from_str(&content).map_err(|e| TownError::Corrupt {
            path,
            detail: e.to_string(),
        })
    }

    pub fn save(&self, town: &Town) -> Result<()> {
        let path = Self::path(town, &self.name);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        crate::town::write_json_atomic(&path, self)
    }
}

// ---------------------------------------------------------------------------
// Layout paths
// ---------------------------------------------------------------------------

/// Well-known paths inside one rig.
#[derive(Clone, Debug)]
pub struct RigLayout {
    pub root: PathBuf,
}

impl RigLayout {
    pub fn new(town: &Town, name: &str) -> Self {
        Self {
            root: town.rig_dir(name),
        }
    }

    /// The shared bare repository.
    pub fn bare_repo(&self) -> PathBuf {
        self.root.join(".repo.git")
    }

    /// The mayor's regular clone. Deliberately NOT a worktree of the bare
    /// repo: the mayor must not see polecat branches, or it would fight
    /// the refinery over them.
    pub fn mayor_clone(&self) -> PathBuf {
        self.root.join("mayor").join("rig")
    }

    /// The refinery worktree, pinned to the default branch.
    pub fn refinery_worktree(&self) -> PathBuf {
        self.root.join("refinery").join("rig")
    }

    /// Witness directory (no clone).
    pub fn witness_dir(&self) -> PathBuf {
        self.root.join("witness")
    }

    /// Crew worktree container.
    pub fn crew_dir(&self) -> PathBuf {
        self.root.join("crew")
    }

    /// Polecat worktree container.
    pub fn polecats_dir(&self) -> PathBuf {
        self.root.join("polecats")
    }

    /// One polecat's container directory.
    pub fn polecat_dir(&self, polecat: &str) -> PathBuf {
        self.polecats_dir().join(polecat)
    }

    /// Plugin directory.
    pub fn plugins_dir(&self) -> PathBuf {
        self.root.join("plugins")
    }

    /// Rig-level settings directory.
    pub fn settings_dir(&self) -> PathBuf {
        self.root.join("settings")
    }

    /// Overlay files copied into the refinery root at creation.
    pub fn overlay_dir(&self) -> PathBuf {
        self.root.join(".runtime").join("overlay")
    }

    /// Rig-level beads directory.
    pub fn beads_dir(&self) -> PathBuf {
        self.root.join(".beads")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
