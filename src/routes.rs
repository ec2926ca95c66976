//! Bead routing core.
//!
//! The town's routing table maps bead-id prefixes to rig directories. It is
//! stored as JSON-lines in `<town>/.beads/routes.jsonl`, one object per
//! line: `{"prefix":"al-","path":"alpha"}`. `#` comment lines and blank
//! lines are tolerated; malformed lines are logged and skipped so one bad
//! record never takes down routing for the whole town.
//!
//! The table is deliberately re-read before every mutation and rewritten
//! whole. Concurrent writers are not supported; callers serialize.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::town::Town;

/// Route table file name inside a beads directory.
pub const ROUTES_FILE: &str = "routes.jsonl";

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// One prefix → rig-path mapping.
///
/// `prefix` includes the trailing hyphen (`"al-"`). `path` is relative to
/// the town root; `"."` means the town-level database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: String,
    pub path: String,
}

impl Route {
    pub fn new(prefix: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            path: path.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Load / store
// ---------------------------------------------------------------------------

/// Load all routes from `<beads_dir>/routes.jsonl`.
///
/// Missing file → empty table. Comment (`#`) and blank lines are skipped
/// silently; unparsable lines are skipped with a warning.
pub fn load(beads_dir: &Path) -> Result<Vec<Route>> {
    let path = beads_dir.join(ROUTES_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)?;
    let mut routes = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<Route>(line) {
            Ok(route) => routes.push(route),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping malformed route line"
                );
            }
        }
    }
    Ok(routes)
}

/// Overwrite `<beads_dir>/routes.jsonl` with `routes`, atomically.
pub fn write(beads_dir: &Path, routes: &[Route]) -> Result<()> {
    std::fs::create_dir_all(beads_dir)?;
    let path = beads_dir.join(ROUTES_FILE);
    let mut tmp = tempfile::NamedTempFile::new_in(beads_dir)?;
    for route in routes {
        let line = serde_json::to_string(route).expect("route serializes");
        writeln!(tmp, "{line}")?;
    }
    tmp.persist(&path)
        .map_err(|e| crate::error::TownError::Io(e.error))?;
    Ok(())
}

/// Insert `route` into the table under `beads_dir`, updating in place if a
/// route with the same prefix already exists.
pub fn append_to_dir(beads_dir: &Path, route: Route) -> Result<()> {
    let mut routes = load(beads_dir)?;
    if let Some(existing) = routes.iter_mut().find(|r| r.prefix == route.prefix) {
        existing.path = route.path;
    } else {
        routes.push(route);
    }
    write(beads_dir, &routes)
}

/// Remove every route with `prefix` from the town table. A missing prefix
/// is a no-op.
pub fn remove(town: &Town, prefix: &str) -> Result<()> {
    let beads_dir = town.beads_dir();
    let mut routes = load(&beads_dir)?;
    let before = routes.len();
    routes.retain(|r| r.prefix != prefix);
    if routes.len() != before {
        write(&beads_dir, &routes)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// The prefix of a bead id: everything up to and including the first
/// hyphen. Returns `""` when the id has no hyphen past position zero.
pub fn extract_prefix(bead_id: &str) -> &str {
    match bead_id.find('-') {
        Some(pos) if pos > 0 => &bead_id[..=pos],
        _ => "",
    }
}

/// Resolve the working directory for a hook or mutation touching `bead_id`.
///
/// Prefix routing is tried first; only the route table yields the correct
/// rig directory, since the VCS does not follow the worktree-redirect
/// scheme. When no route matches, a non-empty `fallback` wins, else the
/// town root.
pub fn resolve_hook_dir(town: &Town, bead_id: &str, fallback: &Path) -> PathBuf {
    let prefix = extract_prefix(bead_id);
    if !prefix.is_empty() {
        if let Ok(routes) = load(&town.beads_dir()) {
            if let Some(route) = routes.iter().find(|r| r.prefix == prefix) {
                if route.path == "." {
                    return town.root().to_path_buf();
                }
                return town.root().join(&route.path);
            }
        }
    }
    if fallback.as_os_str().is_empty() {
        town.root().to_path_buf()
    } else {
        fallback.to_path_buf()
    }
}

/// Prefixes that map to more than one distinct path.
///
/// [`append_to_dir`] updates in place, so conflicts only arise from
/// hand-edited or concatenated files; doctor surfaces them.
pub fn find_conflicting_prefixes(beads_dir: &Path) -> Result<BTreeMap<String, Vec<String>>> {
    let routes = load(beads_dir)?;
    let mut by_prefix: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for route in routes {
        let paths = by_prefix.entry(route.prefix).or_default();
        if !paths.contains(&route.path) {
            paths.push(route.path);
        }
    }
    by_prefix.retain(|_, paths| paths.len() > 1);
    Ok(by_prefix)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
