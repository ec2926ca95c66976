//! Worktree redirect setup.
//!
//! Attaching a worktree to a rig's shared bead storage means cleaning any
//! runtime droppings out of its `.beads/` and writing a fresh single-line
//! `redirect` file. The operation is idempotent: running it twice yields
//! the same file content and leaves tracked files untouched.

use std::path::Path;

use glob::Pattern;

use crate::beads::{self, REDIRECT_FILE};
use crate::error::{Result, TownError};
use crate::town::Town;

/// Runtime files cleaned from a worktree's `.beads/` before the redirect
/// is written. Tracked content (`formulas/`, `README.md`, `config.yaml`,
/// `.gitignore`) survives; everything matching these globs is state some
/// prior local daemon left behind.
const RUNTIME_GLOBS: &[&str] = &[
    "*.db",
    "*.db-*",
    "daemon.lock",
    "daemon.log",
    "daemon.pid",
    "bd.sock",
    "sync-state.json",
    "last-touched",
    "metadata.json",
    ".local_version",
    "redirect",
    "beads.base.*",
    "beads.left.*",
    "beads.right.*",
    "issues.jsonl",
    "interactions.jsonl",
];

/// Runtime directories removed wholesale.
const RUNTIME_DIRS: &[&str] = &["mq"];

/// Point `worktree`'s `.beads/` at the rig's shared bead storage.
///
/// Computes the target (flattening any existing chain), clears stale
/// state, and writes the redirect atomically with a trailing newline.
pub fn setup_redirect(town: &Town, worktree: &Path) -> Result<()> {
    let target = beads::compute_redirect_target(town, worktree)?;
    let beads_dir = worktree.join(".beads");

    // A stale run can leave `.beads` as a regular file.
    if beads_dir.exists() && !beads_dir.is_dir() {
        std::fs::remove_file(&beads_dir)?;
    }

    if beads_dir.is_dir() {
        clean_runtime_files(&beads_dir)?;
    }
    std::fs::create_dir_all(&beads_dir)?;

    let mut content = target.to_string_lossy().into_owned();
    content.push('\n');
    let tmp = tempfile::NamedTempFile::new_in(&beads_dir)?;
    std::fs::write(tmp.path(), &content)?;
    tmp.persist(beads_dir.join(REDIRECT_FILE))
        .map_err(|e| TownError::Io(e.error))?;
    Ok(())
}

/// Remove runtime state from a `.beads/` directory, preserving tracked
/// files.
fn clean_runtime_files(beads_dir: &Path) -> Result<()> {
    let patterns: Vec<Pattern> = RUNTIME_GLOBS
        .iter()
        .map(|g| Pattern::new(g).expect("static glob"))
        .collect();

    for entry in std::fs::read_dir(beads_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if path.is_dir() {
            if RUNTIME_DIRS.contains(&name.as_str()) {
                std::fs::remove_dir_all(&path)?;
            }
            continue;
        }
        if patterns.iter().any(|p| p.matches(&name)) {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Town, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let town = Town::create(dir.path()).unwrap();
        // Rig-level database so the redirect targets <rig>/.beads.
        std::fs::create_dir_all(town.rig_dir("alpha").join(".beads/dolt")).unwrap();
        let worktree = town.rig_dir("alpha").join("crew/max");
        std::fs::create_dir_all(&worktree).unwrap();
        (dir, town, worktree)
    }

    #[test]
    fn writes_single_line_redirect() {
        let (_dir, town, worktree) = fixture();
        setup_redirect(&town, &worktree).unwrap();
        let content =
            std::fs::read_to_string(worktree.join(".beads").join(REDIRECT_FILE)).unwrap();
        assert_eq!(content, "../../.beads\n");
    }

    #[test]
    fn idempotent_and_preserves_tracked_files() {
        let (_dir, town, worktree) = fixture();
        let beads = worktree.join(".beads");
        std::fs::create_dir_all(beads.join("formulas")).unwrap();
        std::fs::write(beads.join("config.yaml"), "prefix: al\n").unwrap();
        std::fs::write(beads.join("README.md"), "# beads\n").unwrap();
        std::fs::write(beads.join(".gitignore"), "*.db\n").unwrap();
        std::fs::write(beads.join("formulas/patrol.toml"), "x = 1\n").unwrap();

        setup_redirect(&town, &worktree).unwrap();
        let first = std::fs::read_to_string(beads.join(REDIRECT_FILE)).unwrap();
        setup_redirect(&town, &worktree).unwrap();
        let second = std::fs::read_to_string(beads.join(REDIRECT_FILE)).unwrap();

        assert_eq!(first, second);
        assert!(beads.join("config.yaml").is_file());
        assert!(beads.join("README.md").is_file());
        assert!(beads.join(".gitignore").is_file());
        assert!(beads.join("formulas/patrol.toml").is_file());
    }

    #[test]
    fn cleans_runtime_files() {
        let (_dir, town, worktree) = fixture();
        let beads = worktree.join(".beads");
        std::fs::create_dir_all(beads.join("mq")).unwrap();
        for name in [
            "beads.db",
            "beads.db-wal",
            "daemon.lock",
            "daemon.log",
            "daemon.pid",
            "bd.sock",
            "sync-state.json",
            "last-touched",
            "metadata.json",
            ".local_version",
            "redirect",
            "beads.base.7",
            "beads.left.7",
            "beads.right.7",
            "issues.jsonl",
            "interactions.jsonl",
        ] {
            std::fs::write(beads.join(name), "stale").unwrap();
        }
        std::fs::write(beads.join("mq/pending"), "q").unwrap();

        setup_redirect(&town, &worktree).unwrap();

        for name in ["beads.db", "daemon.lock", "metadata.json", "issues.jsonl"] {
            assert!(!beads.join(name).exists(), "{name} should be removed");
        }
        assert!(!beads.join("mq").exists());
        // The redirect itself was rewritten fresh.
        assert!(beads.join(REDIRECT_FILE).is_file());
    }

    #[test]
    fn replaces_stale_beads_file() {
        let (_dir, town, worktree) = fixture();
        std::fs::write(worktree.join(".beads"), "not a directory").unwrap();
        setup_redirect(&town, &worktree).unwrap();
        assert!(worktree.join(".beads").is_dir());
        assert!(worktree.join(".beads").join(REDIRECT_FILE).is_file());
    }
}
