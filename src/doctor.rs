//! Health checks and repair for a whole town.
//!
//! `doctor` composes the other subsystems to find the known failure modes
//! of this distributed setup; `--fix` enables the destructive repairs.
//! Output is check-by-check, `[OK]`/`[WARN]`/`[FAIL]` per line, with a
//! repair hint wherever one exists.

use std::path::Path;

use crate::bd;
use crate::beads;
use crate::dolt::{self, health, metadata, migrate, server::DoltServer};
use crate::error::Result;
use crate::git::Git;
use crate::routes;
use crate::session::{self, Mux};
use crate::town::{RigRegistry, Town};

/// Verdict of one check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    Warn,
    Fail,
    Fixed,
}

impl CheckStatus {
    fn label(self) -> &'static str {
        match self {
            Self::Ok => "[OK]",
            Self::Warn => "[WARN]",
            Self::Fail => "[FAIL]",
            Self::Fixed => "[FIXED]",
        }
    }
}

/// One check's outcome.
#[derive(Clone, Debug)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_owned(),
            status,
            message: message.into(),
        }
    }
}

/// Run every check; with `fix`, apply repairs as they are found.
pub fn run(town: &Town, fix: bool) -> Result<Vec<CheckResult>> {
    let mut results = Vec::new();
    let mux = Mux::default();

    check_route_conflicts(town, &mut results);
    check_rigs_git(town, fix, &mut results)?;
    check_broken_workspaces(town, fix, &mut results)?;
    check_sessions(town, &mux, fix, &mut results)?;
    check_read_only(town, fix, &mut results);
    check_orphaned_polecats(town, &mux, fix, &mut results)?;
    check_issues_jsonl(town, fix, &mut results)?;

    for result in &results {
        println!("{} {}: {}", result.status.label(), result.name, result.message);
    }
    let bad = results
        .iter()
        .filter(|r| r.status == CheckStatus::Fail)
        .count();
    if bad > 0 && !fix {
        let cli = std::env::var("GT_COMMAND").unwrap_or_else(|_| "gt".to_owned());
        println!("\n{bad} check(s) failing. Run `{cli} doctor --fix` to repair.");
    }
    Ok(results)
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

fn check_route_conflicts(town: &Town, results: &mut Vec<CheckResult>) {
    match routes::find_conflicting_prefixes(&town.beads_dir()) {
        Ok(conflicts) if conflicts.is_empty() => {
            results.push(CheckResult::new("routes", CheckStatus::Ok, "no conflicts"));
        }
        Ok(conflicts) => {
            for (prefix, paths) in conflicts {
                results.push(CheckResult::new(
                    "routes",
                    CheckStatus::Fail,
                    format!("prefix '{prefix}' maps to multiple paths: {paths:?}"),
                ));
            }
        }
        Err(err) => {
            results.push(CheckResult::new("routes", CheckStatus::Fail, err.to_string()));
        }
    }
}

/// Per-rig git health: bare refspec, sparse checkout.
fn check_rigs_git(town: &Town, fix: bool, results: &mut Vec<CheckResult>) -> Result<()> {
    let registry = RigRegistry::load(town)?;
    for name in registry.rigs.keys() {
        let bare_path = town.rig_dir(name).join(".repo.git");
        if bare_path.is_dir() {
            let bare = Git::bare(&bare_path);
            if bare.bare_refspec_ok() {
                results.push(CheckResult::new(
                    &format!("{name}: refspec"),
                    CheckStatus::Ok,
                    "origin fetch refspec present",
                ));
            } else if fix {
                match bare.fix_bare_refspec() {
                    Ok(()) => results.push(CheckResult::new(
                        &format!("{name}: refspec"),
                        CheckStatus::Fixed,
                        "installed origin fetch refspec",
                    )),
                    Err(err) => results.push(CheckResult::new(
                        &format!("{name}: refspec"),
                        CheckStatus::Fail,
                        err.to_string(),
                    )),
                }
            } else {
                results.push(CheckResult::new(
                    &format!("{name}: refspec"),
                    CheckStatus::Fail,
                    "bare repo missing origin fetch refspec; worktrees cannot resolve origin/<branch>",
                ));
            }
        }

        for clone_dir in [
            town.rig_dir(name).join("mayor/rig"),
            town.rig_dir(name).join("refinery/rig"),
        ] {
            if !clone_dir.is_dir() {
                continue;
            }
            let git = Git::in_dir(&clone_dir);
            if !git.sparse_checkout_enabled() {
                continue;
            }
            let label = format!("{name}: sparse checkout");
            if fix {
                match git.sparse_checkout_disable() {
                    Ok(()) => results.push(CheckResult::new(
                        &label,
                        CheckStatus::Fixed,
                        format!("disabled in {}", clone_dir.display()),
                    )),
                    Err(err) => {
                        results.push(CheckResult::new(&label, CheckStatus::Fail, err.to_string()));
                    }
                }
            } else {
                results.push(CheckResult::new(
                    &label,
                    CheckStatus::Fail,
                    format!("{} has sparse checkout enabled", clone_dir.display()),
                ));
            }
        }
    }
    Ok(())
}

fn check_broken_workspaces(town: &Town, fix: bool, results: &mut Vec<CheckResult>) -> Result<()> {
    let broken = metadata::find_broken_workspaces(town)?;
    if broken.is_empty() {
        results.push(CheckResult::new(
            "workspaces",
            CheckStatus::Ok,
            "all metadata points at live databases",
        ));
        return Ok(());
    }
    for workspace in broken {
        let label = format!("workspace {}", workspace.owner);
        if !fix {
            results.push(CheckResult::new(
                &label,
                CheckStatus::Fail,
                format!(
                    "metadata declares missing database '{}'",
                    workspace.declared_database
                ),
            ));
            continue;
        }
        // Prefer migrating local embedded data; fall back to a fresh
        // database.
        let migratable = migrate::find_migratable_databases(town)?
            .into_iter()
            .find(|m| m.name == workspace.owner);
        let outcome = match migratable {
            Some(m) => migrate::migrate_rig_from_beads(town, &m.name, &m.source)
                .map(|()| "migrated embedded database into place"),
            None => dolt::init_rig(town, &workspace.owner).map(|()| "initialized fresh database"),
        };
        match outcome {
            Ok(message) => results.push(CheckResult::new(&label, CheckStatus::Fixed, message)),
            Err(err) => results.push(CheckResult::new(&label, CheckStatus::Fail, err.to_string())),
        }
    }
    Ok(())
}

/// Classify every live session that belongs to a registered rig.
fn check_sessions(
    town: &Town,
    mux: &Mux,
    fix: bool,
    results: &mut Vec<CheckResult>,
) -> Result<()> {
    let registry = RigRegistry::load(town)?;
    let profile = session::AgentProfile::default();
    let mut any = false;

    for session_id in mux.list_sessions() {
        let Some((rig, name)) = session::names::parse_rig_session(&session_id) else {
            continue;
        };
        if !registry.rigs.contains_key(rig) {
            continue;
        }
        any = true;
        let polecat_dir = town.rig_dir(rig).join("polecats").join(name);
        let work_dir = session::start::resolve_work_dir(&polecat_dir, rig, None);
        let state = session::classify(mux, &session_id, &work_dir, &profile);
        if !state.needs_replacement() {
            results.push(CheckResult::new(
                &format!("session {session_id}"),
                CheckStatus::Ok,
                format!("{state:?}"),
            ));
            continue;
        }
        if fix {
            session::reap_session(mux, &session_id);
            results.push(CheckResult::new(
                &format!("session {session_id}"),
                CheckStatus::Fixed,
                format!("killed ({state:?})"),
            ));
        } else {
            results.push(CheckResult::new(
                &format!("session {session_id}"),
                CheckStatus::Fail,
                format!("{state:?}"),
            ));
        }
    }
    if !any {
        results.push(CheckResult::new(
            "sessions",
            CheckStatus::Ok,
            "no rig sessions running",
        ));
    }
    Ok(())
}

fn check_read_only(town: &Town, fix: bool, results: &mut Vec<CheckResult>) {
    let server = DoltServer::with_defaults(town.clone());
    if server.probe_running().is_none() {
        results.push(CheckResult::new(
            "sql server",
            CheckStatus::Warn,
            "not running",
        ));
        return;
    }
    match health::probe_read_only(town) {
        Ok(false) => {
            results.push(CheckResult::new("sql server", CheckStatus::Ok, "writable"));
        }
        Ok(true) if fix => match health::recover_read_only(town, &server) {
            Ok(()) => results.push(CheckResult::new(
                "sql server",
                CheckStatus::Fixed,
                "restarted out of read-only mode",
            )),
            Err(err) => {
                results.push(CheckResult::new("sql server", CheckStatus::Fail, err.to_string()));
            }
        },
        Ok(true) => results.push(CheckResult::new(
            "sql server",
            CheckStatus::Fail,
            "read-only; restart required",
        )),
        Err(err) => {
            results.push(CheckResult::new("sql server", CheckStatus::Warn, err.to_string()));
        }
    }
}

/// Polecat directories without sessions and sessions without directories.
fn check_orphaned_polecats(
    town: &Town,
    mux: &Mux,
    fix: bool,
    results: &mut Vec<CheckResult>,
) -> Result<()> {
    let registry = RigRegistry::load(town)?;
    let live: Vec<String> = mux.list_sessions();

    for rig in registry.rigs.keys() {
        let polecats_dir = town.rig_dir(rig).join("polecats");
        if !polecats_dir.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&polecats_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let session_id = session::names::rig_session_id(rig, &name);
            if live.contains(&session_id) {
                continue;
            }
            let label = format!("orphan {rig}/{name}");
            let work_dir = session::start::resolve_work_dir(&entry.path(), rig, None);
            if !fix {
                results.push(CheckResult::new(
                    &label,
                    CheckStatus::Warn,
                    "worktree present but session gone",
                ));
                continue;
            }
            if has_blocking_changes(&work_dir) {
                results.push(CheckResult::new(
                    &label,
                    CheckStatus::Warn,
                    "kept: uncommitted work present",
                ));
                continue;
            }
            let bare = Git::bare(town.rig_dir(rig).join(".repo.git"));
            let removed = bare.worktree_remove(&work_dir, true).and_then(|()| {
                if entry.path().exists() {
                    std::fs::remove_dir_all(entry.path())?;
                }
                Ok(())
            });
            match removed {
                Ok(()) => results.push(CheckResult::new(
                    &label,
                    CheckStatus::Fixed,
                    "removed orphaned worktree",
                )),
                Err(err) => {
                    results.push(CheckResult::new(&label, CheckStatus::Fail, err.to_string()));
                }
            }
        }

        // The reverse direction: sessions whose polecat directory is gone.
        for session_id in &live {
            let Some((session_rig, name)) = session::names::parse_rig_session(session_id) else {
                continue;
            };
            if session_rig != rig || ["witness", "refinery"].contains(&name) {
                continue;
            }
            if polecats_dir.join(name).is_dir() {
                continue;
            }
            let label = format!("orphan session {session_id}");
            if fix {
                session::reap_session(mux, session_id);
                results.push(CheckResult::new(&label, CheckStatus::Fixed, "killed"));
            } else {
                results.push(CheckResult::new(
                    &label,
                    CheckStatus::Warn,
                    "session running but worktree gone",
                ));
            }
        }
    }
    Ok(())
}

/// Uncommitted work that blocks worktree removal. Changes confined to
/// `.beads/` are benign; redirects and runtime droppings, not work.
fn has_blocking_changes(work_dir: &Path) -> bool {
    if !work_dir.join(".git").exists() {
        return false;
    }
    let Ok(status) = Git::in_dir(work_dir).run(&["status", "--porcelain"]) else {
        // Unknown state blocks removal.
        return true;
    };
    status.lines().any(|line| {
        let path = line.get(3..).unwrap_or("").trim();
        !path.starts_with(".beads/") && path != ".beads"
    })
}

fn check_issues_jsonl(town: &Town, fix: bool, results: &mut Vec<CheckResult>) -> Result<()> {
    let registry = RigRegistry::load(town)?;
    let mut dirs = vec![town.beads_dir()];
    for rig in registry.rigs.keys() {
        dirs.push(beads::rig_beads_dir(town, rig));
    }
    for dir in dirs {
        if !dir.is_dir() || dir.join("issues.jsonl").is_file() {
            continue;
        }
        let label = format!("issues.jsonl in {}", dir.display());
        if fix {
            bd::ensure_issues_jsonl(&dir)?;
            results.push(CheckResult::new(&label, CheckStatus::Fixed, "created empty"));
        } else {
            results.push(CheckResult::new(
                &label,
                CheckStatus::Warn,
                "missing; auto-export may corrupt other JSONL files",
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
