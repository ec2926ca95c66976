//! Beads-directory resolution: redirect chains and canonical locations.
//!
//! Every worktree carries a `.beads/` subdirectory. Worktrees that share a
//! rig-level database hold a single-line `redirect` file there instead of a
//! database; resolution follows the chain to the logical directory.
//!
//! The resolver is pure except for one mandated mutation: a redirect that
//! resolves back to its own starting directory is removed on sight, with a
//! warning, so a broken chain cannot wedge every operation that touches it.

use std::path::{Component, Path, PathBuf};

use crate::error::Result;
use crate::town::Town;

/// Name of the redirect file inside a `.beads/` directory.
pub const REDIRECT_FILE: &str = "redirect";

/// Maximum redirect hops before resolution stops with a warning.
pub const MAX_REDIRECT_HOPS: usize = 3;

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve the logical beads directory for `work_dir`.
///
/// Starts at `<work_dir>/.beads`. A `redirect` file there is a single
/// relative path, joined against the *worktree* (`work_dir`), not against
/// `.beads/` itself. Resolution recurses into the target, capped at
/// [`MAX_REDIRECT_HOPS`]; chains past the cap stop where they are, with a
/// warning.
///
/// `BEADS_DIR`, when set and non-empty, overrides discovery entirely.
pub fn resolve_beads_dir(work_dir: &Path) -> Result<PathBuf> {
    let explicit = std::env::var("BEADS_DIR").ok();
    resolve_beads_dir_with(work_dir, explicit.as_deref())
}

/// [`resolve_beads_dir`] with the override passed explicitly. The env-free
/// form keeps resolution testable without mutating process state.
pub fn resolve_beads_dir_with(work_dir: &Path, explicit: Option<&str>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let mut current = normalize_path(&work_dir.join(".beads"));
    for _ in 0..MAX_REDIRECT_HOPS {
        let redirect = current.join(REDIRECT_FILE);
        if !redirect.is_file() {
            return Ok(current);
        }
        let content = std::fs::read_to_string(&redirect)?;
        let rel = content.trim();
        if rel.is_empty() {
            return Ok(current);
        }
        // The redirect is relative to the worktree that owns this .beads
        // directory, i.e. the parent of `current`.
        let owner = current.parent().unwrap_or(&current).to_path_buf();
        let target = normalize_path(&owner.join(rel));
        if target == current {
            // Self-referential redirect: remove it so the next resolution
            // terminates, and warn loudly.
            std::fs::remove_file(&redirect)?;
            eprintln!(
                "warning: removed circular beads redirect at {}",
                redirect.display()
            );
            tracing::warn!(path = %redirect.display(), "removed circular beads redirect");
            return Ok(current);
        }
        current = target;
    }

    if current.join(REDIRECT_FILE).is_file() {
        eprintln!(
            "warning: beads redirect chain from {} exceeds {} hops; stopping at {}",
            work_dir.display(),
            MAX_REDIRECT_HOPS,
            current.display()
        );
        tracing::warn!(
            start = %work_dir.display(),
            stop = %current.display(),
            "redirect chain exceeds hop cap"
        );
    }
    Ok(current)
}

/// Canonical beads directory for a rig, read-only form.
///
/// Prefers `<rig>/mayor/rig/.beads` when present (tracked-beads repos keep
/// the database inside the mayor clone), else `<rig>/.beads`.
pub fn rig_beads_dir(town: &Town, rig: &str) -> PathBuf {
    let mayor = town.rig_dir(rig).join("mayor").join("rig").join(".beads");
    if mayor.is_dir() {
        mayor
    } else {
        town.rig_dir(rig).join(".beads")
    }
}

/// Resolve-or-create form of [`rig_beads_dir`], safe for writers.
///
/// `create_dir_all` on the canonical path is the whole synchronization
/// story: it is atomic per component and idempotent, so two concurrent
/// callers both land on an existing directory. The read-only lookup is
/// reserved for diagnostics.
pub fn find_or_create_rig_beads_dir(town: &Town, rig: &str) -> Result<PathBuf> {
    let rig_dir = town.rig_dir(rig);
    let target = if rig_dir.join("mayor").join("rig").is_dir() {
        rig_dir.join("mayor").join("rig").join(".beads")
    } else {
        rig_dir.join(".beads")
    };
    std::fs::create_dir_all(&target)?;
    Ok(target)
}

// ---------------------------------------------------------------------------
// Redirect-target computation
// ---------------------------------------------------------------------------

/// Compute the relative path a worktree's `redirect` file must contain.
///
/// `worktree` must be at least two levels below the town root; a redirect
/// is never placed at the canonical beads location itself (`mayor/rig`,
/// whether town-level or rig-level).
///
/// The target is `<rig>/.beads` unless that directory holds no actual
/// database (no `dolt/` subtree and no `beads.db`), in which case it falls
/// back to `<rig>/mayor/rig/.beads`. If the rig-level location itself
/// contains a redirect, the returned path points directly at the final
/// destination; chains are flattened at creation time.
pub fn compute_redirect_target(town: &Town, worktree: &Path) -> Result<PathBuf> {
    let worktree = normalize_path(worktree);
    let rel = worktree
        .strip_prefix(town.root())
        .map_err(|_| invalid_worktree(&worktree, "not under the town root"))?;
    let components: Vec<&str> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();

    if components.len() < 2 {
        return Err(invalid_worktree(
            &worktree,
            "a worktree lives at least two levels below the town root",
        ));
    }
    // Never place a redirect at the canonical beads location.
    if components[..] == ["mayor", "rig"] || (components.len() == 3 && components[1] == "mayor" && components[2] == "rig")
    {
        return Err(invalid_worktree(
            &worktree,
            "the canonical beads location keeps a database, not a redirect",
        ));
    }

    let rig = components[0];
    let rig_level = town.rig_dir(rig).join(".beads");
    let has_database = rig_level.join("dolt").is_dir() || rig_level.join("beads.db").is_file();

    let mut target = if has_database {
        rig_level.clone()
    } else {
        town.rig_dir(rig).join("mayor").join("rig").join(".beads")
    };

    // Flatten: if the selected location is itself redirected, point the new
    // worktree straight at the final destination.
    if target.join(REDIRECT_FILE).is_file() {
        let owner = target.parent().unwrap_or(&target).to_path_buf();
        target = resolve_beads_dir_with(&owner, None)?;
    }

    Ok(relative_from(&worktree, &target))
}

fn invalid_worktree(path: &Path, reason: &str) -> crate::error::TownError {
    crate::error::TownError::Corrupt {
        path: path.to_path_buf(),
        detail: format!("cannot place a beads redirect here: {reason}"),
    }
}

// ---------------------------------------------------------------------------
// Path helpers (lexical, no filesystem access)
// ---------------------------------------------------------------------------

/// Lexically normalize a path: resolve `.` and `..` without touching the
/// filesystem. Symlinks are deliberately not followed; redirect semantics
/// are defined on the literal tree.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Lexical relative path from directory `from` to `to`.
fn relative_from(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<_> = from.components().collect();
    let to: Vec<_> = to.components().collect();
    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for component in &to[common..] {
        out.push(component.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
