//! Rig adoption.
//!
//! `register_rig` brings an existing rig directory under management
//! without touching its contents: it reads whatever configuration is
//! already there, auto-detects what is missing (git URL from any clone's
//! origin, prefix from the name), and records the rig in the registry and
//! route table.

use crate::error::{Result, TownError};
use crate::git::Git;
use crate::routes::{self, Route};
use crate::town::{RigBeads, RigEntry, RigRegistry, Town};

use super::{RigConfig, RigLayout};

/// Options for [`register_rig`].
#[derive(Clone, Debug, Default)]
pub struct RegisterRigOptions {
    pub name: String,
    /// Git URL; auto-detected from an existing clone when absent.
    pub git_url: Option<String>,
    /// Issue prefix; derived from the name when absent.
    pub prefix: Option<String>,
}

/// Adopt an existing rig directory. Non-destructive: existing config
/// values win over detection, and nothing inside the rig is rewritten
/// except a missing `config.json`.
pub fn register_rig(town: &Town, opts: &RegisterRigOptions) -> Result<RigConfig> {
    super::validate_rig_name(&opts.name)?;
    let layout = RigLayout::new(town, &opts.name);
    if !layout.root.is_dir() {
        return Err(TownError::RigNotFound {
            name: opts.name.clone(),
        });
    }

    let existing = RigConfig::load(town, &opts.name).ok();

    let git_url = existing
        .as_ref()
        .map(|c| c.git_url.clone())
        .filter(|url| !url.is_empty())
        .or_else(|| opts.git_url.clone())
        .or_else(|| detect_git_url(&layout))
        .ok_or_else(|| TownError::Corrupt {
            path: layout.root.clone(),
            detail: format!(
                "cannot determine git URL for '{}'; pass one explicitly",
                opts.name
            ),
        })?;

    let prefix = existing
        .as_ref()
        .map(|c| c.beads.prefix.clone())
        .filter(|p| !p.is_empty())
        .or_else(|| opts.prefix.clone())
        .unwrap_or_else(|| super::default_prefix(&opts.name));

    let default_branch = existing
        .as_ref()
        .map(|c| c.default_branch.clone())
        .filter(|b| !b.is_empty())
        .or_else(|| detect_default_branch(&layout))
        .unwrap_or_else(|| "main".to_owned());

    let config = match existing {
        Some(mut config) => {
            config.git_url = git_url.clone();
            config.beads.prefix = prefix.clone();
            config.default_branch = default_branch;
            config
        }
        None => {
            let config = RigConfig {
                name: opts.name.clone(),
                git_url: git_url.clone(),
                local_repo: None,
                default_branch,
                created_at: chrono::Utc::now().to_rfc3339(),
                beads: RigBeads {
                    prefix: prefix.clone(),
                },
                ..Default::default()
            };
            config.save(town)?;
            config
        }
    };

    routes::append_to_dir(
        &town.beads_dir(),
        Route::new(format!("{prefix}-"), opts.name.clone()),
    )?;

    let mut registry = RigRegistry::load(town)?;
    registry.rigs.insert(
        opts.name.clone(),
        RigEntry {
            git_url,
            local_repo: config.local_repo.clone(),
            added_at: chrono::Utc::now().to_rfc3339(),
            beads: config.beads.clone(),
            ..Default::default()
        },
    );
    registry.save(town)?;

    tracing::info!(rig = opts.name, "rig registered");
    Ok(config)
}

/// Find a usable origin URL in the rig root, the mayor clone, or the
/// refinery worktree; whichever answers first.
fn detect_git_url(layout: &RigLayout) -> Option<String> {
    for dir in [
        layout.root.clone(),
        layout.mayor_clone(),
        layout.refinery_worktree(),
    ] {
        if !dir.is_dir() {
            continue;
        }
        if let Ok(Some(url)) = Git::in_dir(&dir).origin_url() {
            if !url.is_empty() {
                return Some(url);
            }
        }
    }
    None
}

/// Default branch from the mayor clone's HEAD, when one exists.
fn detect_default_branch(layout: &RigLayout) -> Option<String> {
    let mayor = layout.mayor_clone();
    if !mayor.is_dir() {
        return None;
    }
    Git::in_dir(mayor).current_branch().ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn register_missing_rig_fails() {
        let dir = TempDir::new().unwrap();
        let town = Town::create(dir.path()).unwrap();
        let opts = RegisterRigOptions {
            name: "ghost".to_owned(),
            ..Default::default()
        };
        assert!(matches!(
            register_rig(&town, &opts).unwrap_err(),
            TownError::RigNotFound { .. }
        ));
    }

    #[test]
    fn register_with_explicit_url_writes_config_and_route() {
        let dir = TempDir::new().unwrap();
        let town = Town::create(dir.path()).unwrap();
        std::fs::create_dir_all(town.rig_dir("alpha")).unwrap();

        let opts = RegisterRigOptions {
            name: "alpha".to_owned(),
            git_url: Some("file:///seed".to_owned()),
            prefix: None,
        };
        let config = register_rig(&town, &opts).unwrap();
        assert_eq!(config.beads.prefix, "al");
        assert_eq!(config.git_url, "file:///seed");

        let registry = RigRegistry::load(&town).unwrap();
        assert!(registry.rigs.contains_key("alpha"));

        let routes = routes::load(&town.beads_dir()).unwrap();
        assert_eq!(routes[0], Route::new("al-", "alpha"));
    }

    #[test]
    fn register_prefers_existing_config_values() {
        let dir = TempDir::new().unwrap();
        let town = Town::create(dir.path()).unwrap();
        std::fs::create_dir_all(town.rig_dir("alpha")).unwrap();
        std::fs::write(
            RigConfig::path(&town, "alpha"),
            r#"{"name":"alpha","git_url":"file:///original","default_branch":"trunk","created_at":"2026-01-01T00:00:00Z","beads":{"prefix":"zz"}}"#,
        )
        .unwrap();

        let opts = RegisterRigOptions {
            name: "alpha".to_owned(),
            git_url: Some("file:///other".to_owned()),
            prefix: Some("qq".to_owned()),
        };
        let config = register_rig(&town, &opts).unwrap();
        // Existing config wins over caller options.
        assert_eq!(config.git_url, "file:///original");
        assert_eq!(config.beads.prefix, "zz");
        assert_eq!(config.default_branch, "trunk");
    }

    #[test]
    fn register_without_any_url_fails_with_hint() {
        let dir = TempDir::new().unwrap();
        let town = Town::create(dir.path()).unwrap();
        std::fs::create_dir_all(town.rig_dir("alpha")).unwrap();
        let opts = RegisterRigOptions {
            name: "alpha".to_owned(),
            ..Default::default()
        };
        let err = register_rig(&town, &opts).unwrap_err();
        assert!(format!("{err}").contains("git URL"));
    }
}
