//! Rig creation.
//!
//! `add_rig` materializes the full on-disk topology for a new rig from a
//! git URL: shared bare repo, mayor clone, refinery worktree, role
//! containers, bead storage, routing, and registry entry. A cleanup guard
//! removes the partially-built rig directory if any step fails, so a
//! botched add never leaves a half-rig for the next command to trip over.

use std::path::{Path, PathBuf};

use crate::bd::BeadsCli;
use crate::beads;
use crate::dolt;
use crate::error::{Result, TownError};
use crate::git::{self, CloneKind, Git};
use crate::routes::{self, Route};
use crate::town::{RigBeads, RigEntry, RigRegistry, Town};

use super::{hooks, redirect, RigConfig, RigLayout};

/// Options for [`add_rig`].
#[derive(Clone, Debug, Default)]
pub struct AddRigOptions {
    pub name: String,
    pub git_url: String,
    /// Local repository used as a `--reference` during cloning.
    pub local_repo: Option<PathBuf>,
    /// Issue prefix override (no trailing hyphen). Must agree with any
    /// prefix detected in a tracked beads directory.
    pub prefix: Option<String>,
    /// Default-branch override; validated against `origin/<branch>`.
    pub default_branch: Option<String>,
}

/// Removes the rig directory on drop unless disarmed.
struct CleanupGuard {
    path: PathBuf,
    armed: bool,
}

impl CleanupGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            if let Err(err) = std::fs::remove_dir_all(&self.path) {
                tracing::warn!(path = %self.path.display(), %err, "cleanup after failed add");
            }
        }
    }
}

/// Create a rig from scratch. See the module doc for the full sequence.
pub fn add_rig(town: &Town, opts: &AddRigOptions) -> Result<RigConfig> {
    super::validate_rig_name(&opts.name)?;
    let layout = RigLayout::new(town, &opts.name);
    if layout.root.exists() {
        return Err(TownError::RigExists {
            name: opts.name.clone(),
        });
    }

    std::fs::create_dir_all(&layout.root)?;
    let mut guard = CleanupGuard::new(layout.root.clone());
    let config = build_rig(town, opts, &layout)?;
    guard.disarm();
    Ok(config)
}

fn build_rig(town: &Town, opts: &AddRigOptions, layout: &RigLayout) -> Result<RigConfig> {
    // Shared bare repo, reference clone first, plain fallback.
    git::clone_with_fallback(
        &opts.git_url,
        &layout.bare_repo(),
        CloneKind::Bare,
        opts.local_repo.as_deref(),
    )
    .map_err(|err| with_ssh_hint(err, &opts.git_url))?;
    let bare = Git::bare(layout.bare_repo());

    let default_branch = determine_default_branch(&bare, opts.default_branch.as_deref())?;

    // Mayor: a regular clone, NOT a worktree of the bare repo, so it never
    // sees polecat branches and cannot conflict with the refinery.
    git::clone_with_fallback(
        &opts.git_url,
        &layout.mayor_clone(),
        CloneKind::Normal,
        opts.local_repo.as_deref(),
    )
    .map_err(|err| with_ssh_hint(err, &opts.git_url))?;
    let mayor = Git::in_dir(layout.mayor_clone());
    mayor.run(&["checkout", default_branch.as_str()])?;

    // Tracked beads detection and prefix resolution.
    let mayor_beads = layout.mayor_clone().join(".beads");
    let tracked_beads = mayor_beads.join("config.yaml").is_file();
    if tracked_beads {
        let stale_redirect = mayor_beads.join(beads::REDIRECT_FILE);
        if stale_redirect.exists() {
            std::fs::remove_file(&stale_redirect)?;
        }
    }
    let prefix = resolve_prefix(&opts.name, opts.prefix.as_deref(), &mayor_beads)?;

    let mut config = RigConfig {
        name: opts.name.clone(),
        git_url: opts.git_url.clone(),
        local_repo: opts
            .local_repo
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned()),
        default_branch: default_branch.clone(),
        created_at: chrono::Utc::now().to_rfc3339(),
        beads: RigBeads {
            prefix: prefix.clone(),
        },
        ..Default::default()
    };
    config.save(town)?;

    // Database + bead storage.
    dolt::init_rig(town, &opts.name)?;
    let rig_beads_dir = init_rig_beads(opts, layout)?;
    dolt::metadata::ensure_metadata(town, &opts.name)?;
    BeadsCli::in_dir(&rig_beads_dir).set_prefix(&prefix)?;

    // Refinery worktree on the default branch, hooks path configured,
    // beads redirected into the rig storage.
    let refinery_path = layout.refinery_worktree();
    std::fs::create_dir_all(refinery_path.parent().unwrap_or(&layout.root))?;
    bare.worktree_add(
        &refinery_path,
        &default_branch,
        Some(&format!("origin/{default_branch}")),
    )?;
    let refinery = Git::in_dir(&refinery_path);
    let hooks_dir = layout.root.join(".runtime").join("hooks");
    std::fs::create_dir_all(&hooks_dir)?;
    refinery.config_set("core.hooksPath", &hooks_dir.to_string_lossy())?;
    redirect::setup_redirect(town, &refinery_path)?;

    copy_overlay(&layout.overlay_dir(), &refinery_path);

    // Role containers.
    std::fs::create_dir_all(layout.crew_dir())?;
    std::fs::write(layout.crew_dir().join("README.md"), CREW_README)?;
    std::fs::create_dir_all(layout.witness_dir())?;
    std::fs::create_dir_all(layout.polecats_dir())?;
    hooks::ensure_role_settings(&layout.settings_dir(), "polecat")?;

    // Routing: tracked beads live in the mayor clone, so the route points
    // there; otherwise at the rig root.
    let route_path = if tracked_beads {
        format!("{}/mayor/rig", opts.name)
    } else {
        opts.name.clone()
    };
    routes::append_to_dir(
        &town.beads_dir(),
        Route::new(format!("{prefix}-"), route_path),
    )?;

    // Rig-level agent beads (town agents are created elsewhere).
    let bd = BeadsCli::in_dir(&rig_beads_dir);
    for role in ["witness", "refinery"] {
        bd.create_agent_bead(
            &format!("{prefix}-{}-{role}", opts.name),
            &format!("{role} agent for {}", opts.name),
        )?;
    }

    if let Err(err) = bd.seed_patrol_molecules() {
        tracing::warn!(%err, "patrol molecules not seeded");
    }

    create_plugin_dirs(town, layout)?;

    // Registration last: a rig in rigs.json is a rig that fully exists.
    let mut registry = RigRegistry::load(town)?;
    registry.rigs.insert(
        opts.name.clone(),
        RigEntry {
            git_url: opts.git_url.clone(),
            local_repo: config.local_repo.clone(),
            added_at: config.created_at.clone(),
            beads: config.beads.clone(),
            ..Default::default()
        },
    );
    registry.save(town)?;

    tracing::info!(rig = opts.name, prefix, default_branch, "rig created");
    Ok(config)
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Pick the default branch: caller override (validated against origin),
/// then the remote's recorded default, then the bare repo's own HEAD,
/// then `main`.
fn determine_default_branch(bare: &Git, requested: Option<&str>) -> Result<String> {
    if let Some(branch) = requested {
        if !bare.remote_branch_exists(branch)? {
            return Err(TownError::InvalidBranchName {
                name: branch.to_owned(),
                reason: format!("origin/{branch} does not exist"),
            });
        }
        return Ok(branch.to_owned());
    }
    if let Some(branch) = bare.remote_default_branch() {
        return Ok(branch);
    }
    if let Ok(Some(branch)) = bare.current_branch() {
        return Ok(branch);
    }
    Ok("main".to_owned())
}

/// Initialize rig-level bead storage.
///
/// With a tracked beads directory in the mayor clone, the rig's `.beads/`
/// becomes a redirect into it. Otherwise the rig-level directory gets a
/// fresh server-mode initialization.
fn init_rig_beads(opts: &AddRigOptions, layout: &RigLayout) -> Result<PathBuf> {
    let mayor_beads = layout.mayor_clone().join(".beads");
    if mayor_beads.is_dir() {
        std::fs::create_dir_all(layout.beads_dir())?;
        let content = "mayor/rig/.beads\n";
        std::fs::write(layout.beads_dir().join(beads::REDIRECT_FILE), content)?;
        Ok(mayor_beads)
    } else {
        std::fs::create_dir_all(layout.beads_dir())?;
        BeadsCli::in_dir(layout.beads_dir()).init_server(&opts.name)?;
        Ok(layout.beads_dir())
    }
}

/// Detect the issue prefix, reconciling any caller override with what a
/// tracked beads directory already uses.
fn resolve_prefix(
    rig_name: &str,
    requested: Option<&str>,
    mayor_beads: &Path,
) -> Result<String> {
    let detected = detect_tracked_prefix(mayor_beads);
    match (requested, detected) {
        (Some(req), Some(found)) if req != found => Err(TownError::InvalidRigName {
            name: rig_name.to_owned(),
            reason: format!(
                "requested prefix '{req}' conflicts with tracked beads prefix '{found}'"
            ),
            suggestion: Some(found),
        }),
        (Some(req), _) => Ok(req.to_owned()),
        (None, Some(found)) => Ok(found),
        (None, None) => Ok(super::default_prefix(rig_name)),
    }
}

/// Read the prefix out of a tracked beads directory: `config.yaml` first,
/// then the first few ids in `issues.jsonl` whose suffix is the canonical
/// 5-character hash. Structured agent-bead ids have more than one hyphen
/// and never match.
fn detect_tracked_prefix(beads_dir: &Path) -> Option<String> {
    let config = beads_dir.join("config.yaml");
    if let Ok(content) = std::fs::read_to_string(&config) {
        for line in content.lines() {
            let line = line.trim();
            if let Some(value) = line
                .strip_prefix("issue-prefix:")
                .or_else(|| line.strip_prefix("issue_prefix:"))
                .or_else(|| line.strip_prefix("prefix:"))
            {
                let value = value.trim().trim_matches('"').trim_end_matches('-');
                if !value.is_empty() {
                    return Some(value.to_owned());
                }
            }
        }
    }

    let issues = beads_dir.join("issues.jsonl");
    let content = std::fs::read_to_string(issues).ok()?;
    let id_shape = regex::Regex::new(r"^([a-z0-9]+)-([a-z2-7]{5})$").expect("static regex");
    for line in content.lines().take(10) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        let Some(id) = value.get("id").and_then(serde_json::Value::as_str) else {
            continue;
        };
        if let Some(captures) = id_shape.captures(id) {
            return Some(captures[1].to_owned());
        }
    }
    None
}

/// Attach an SSH-form suggestion to HTTPS clone failures; authentication
/// over HTTPS commonly works over SSH for the same host.
fn with_ssh_hint(err: TownError, url: &str) -> TownError {
    let Some(ssh) = crate::git::https_to_ssh_url(url) else {
        return err;
    };
    match err {
        TownError::Subprocess {
            program,
            args,
            stdout,
            stderr,
            status,
        } => TownError::Subprocess {
            program,
            args,
            stdout,
            stderr: format!("{stderr}\n  If this is an auth failure, try the SSH form: {ssh}"),
            status,
        },
        other => other,
    }
}

/// Copy overlay files into the refinery root. Best-effort: a missing or
/// unreadable overlay never fails rig creation.
fn copy_overlay(overlay_dir: &Path, refinery_path: &Path) {
    if !overlay_dir.is_dir() {
        return;
    }
    if let Err(err) = copy_tree(overlay_dir, refinery_path) {
        tracing::warn!(%err, "overlay copy incomplete");
    }
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Town- and rig-level plugin directories with a README and a gitignore
/// that keeps plugin payloads out of version control.
fn create_plugin_dirs(town: &Town, layout: &RigLayout) -> Result<()> {
    for dir in [town.root().join("plugins"), layout.plugins_dir()] {
        std::fs::create_dir_all(&dir)?;
        let readme = dir.join("README.md");
        if !readme.exists() {
            std::fs::write(&readme, PLUGINS_README)?;
        }
        let gitignore = dir.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(&gitignore, "*\n!README.md\n!.gitignore\n")?;
        }
    }
    Ok(())
}

const CREW_README: &str = "\
# crew/

One directory per persistent worker. Crew worktrees share the rig's bare
repository and stay across work items.

Ephemeral workers live under ../polecats/ instead: those worktrees are
created per task and removed when the work lands.
";

const PLUGINS_README: &str = "\
# plugins/

Drop-in extensions. Contents are local to this machine and ignored by
version control.
";

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn add_refuses_existing_rig_dir() {
        let dir = TempDir::new().unwrap();
        let town = Town::create(dir.path()).unwrap();
        std::fs::create_dir_all(town.rig_dir("alpha")).unwrap();
        let opts = AddRigOptions {
            name: "alpha".to_owned(),
            git_url: "file:///nowhere".to_owned(),
            ..Default::default()
        };
        assert!(matches!(
            add_rig(&town, &opts).unwrap_err(),
            TownError::RigExists { .. }
        ));
        // The pre-existing directory is not torn down.
        assert!(town.rig_dir("alpha").exists());
    }

    #[test]
    fn add_cleans_up_after_failure() {
        let dir = TempDir::new().unwrap();
        let town = Town::create(dir.path()).unwrap();
        let opts = AddRigOptions {
            name: "alpha".to_owned(),
            // Clone of a nonexistent path fails early.
            git_url: format!("file://{}/missing", dir.path().display()),
            ..Default::default()
        };
        assert!(add_rig(&town, &opts).is_err());
        assert!(!town.rig_dir("alpha").exists());
    }

    #[test]
    fn invalid_name_fails_before_touching_disk() {
        let dir = TempDir::new().unwrap();
        let town = Town::create(dir.path()).unwrap();
        let opts = AddRigOptions {
            name: "op-baby".to_owned(),
            git_url: "file:///seed".to_owned(),
            ..Default::default()
        };
        assert!(add_rig(&town, &opts).is_err());
        assert!(!town.rig_dir("op-baby").exists());
    }

    #[test]
    fn prefix_detection_from_config_yaml() {
        let dir = TempDir::new().unwrap();
        let beads = dir.path().join(".beads");
        std::fs::create_dir_all(&beads).unwrap();
        std::fs::write(beads.join("config.yaml"), "issue-prefix: gx-\n").unwrap();
        assert_eq!(detect_tracked_prefix(&beads).as_deref(), Some("gx"));
    }

    #[test]
    fn prefix_detection_from_issues_jsonl() {
        let dir = TempDir::new().unwrap();
        let beads = dir.path().join(".beads");
        std::fs::create_dir_all(&beads).unwrap();
        std::fs::write(
            beads.join("issues.jsonl"),
            concat!(
                "not json\n",
                // Structured agent id: two hyphens, never a prefix source.
                "{\"id\":\"gx-alpha-witness\",\"title\":\"agent\"}\n",
                "{\"id\":\"gx-a2b3c\",\"title\":\"task\"}\n",
            ),
        )
        .unwrap();
        assert_eq!(detect_tracked_prefix(&beads).as_deref(), Some("gx"));
    }

    #[test]
    fn prefix_detection_ignores_non_hash_suffixes() {
        let dir = TempDir::new().unwrap();
        let beads = dir.path().join(".beads");
        std::fs::create_dir_all(&beads).unwrap();
        std::fs::write(
            beads.join("issues.jsonl"),
            // "10" is too short, "widget" too long: neither is a hash.
            "{\"id\":\"gx-10\"}\n{\"id\":\"gx-widget\"}\n",
        )
        .unwrap();
        assert_eq!(detect_tracked_prefix(&beads), None);
    }

    #[test]
    fn resolve_prefix_conflict_fails() {
        let dir = TempDir::new().unwrap();
        let beads = dir.path().join(".beads");
        std::fs::create_dir_all(&beads).unwrap();
        std::fs::write(beads.join("config.yaml"), "prefix: gx\n").unwrap();

        let err = resolve_prefix("alpha", Some("zz"), &beads).unwrap_err();
        assert!(format!("{err}").contains("conflicts"));
        assert_eq!(
            resolve_prefix("alpha", Some("gx"), &beads).unwrap(),
            "gx"
        );
        assert_eq!(resolve_prefix("alpha", None, &beads).unwrap(), "gx");
    }

    #[test]
    fn resolve_prefix_defaults_from_name() {
        let dir = TempDir::new().unwrap();
        let beads = dir.path().join(".beads");
        assert_eq!(resolve_prefix("alpha", None, &beads).unwrap(), "al");
    }

    #[test]
    fn https_clone_failures_suggest_ssh() {
        let err = TownError::Subprocess {
            program: "git".to_owned(),
            args: vec!["clone".to_owned()],
            stdout: String::new(),
            stderr: "fatal: Authentication failed".to_owned(),
            status: None,
        };
        let enriched = with_ssh_hint(err, "https://github.com/acme/widgets.git");
        let msg = format!("{enriched}");
        assert!(msg.contains("git@github.com:acme/widgets.git"));

        // Non-HTTPS URLs pass through untouched.
        let err = TownError::ServerNotRunning;
        let same = with_ssh_hint(err, "file:///seed");
        assert!(matches!(same, TownError::ServerNotRunning));
    }

    #[test]
    fn plugin_dirs_created_with_readme_and_gitignore() {
        let dir = TempDir::new().unwrap();
        let town = Town::create(dir.path()).unwrap();
        let layout = RigLayout::new(&town, "alpha");
        std::fs::create_dir_all(&layout.root).unwrap();

        create_plugin_dirs(&town, &layout).unwrap();
        for base in [town.root().join("plugins"), layout.plugins_dir()] {
            assert!(base.join("README.md").is_file());
            let ignore = std::fs::read_to_string(base.join(".gitignore")).unwrap();
            assert!(ignore.contains("!README.md"));
        }
    }
}
