//! Migration of embedded databases into the central data directory.
//!
//! Older layouts kept a dolt database inside each rig's beads directory
//! (`<beads>/dolt/<name>/.dolt`). Migration moves that tree under
//! `<town>/.dolt-data/<rig>` so the shared server can serve it.
//!
//! The scan is conservative: a beads directory with more than one
//! embedded database candidate yields nothing for that rig, with a
//! warning; never a silent pick. Moves are cross-filesystem safe and the
//! whole pass is resumable: anything already migrated simply stops being
//! migratable.

use std::path::PathBuf;

use crate::beads;
use crate::error::{Result, TownError};
use crate::git::move_dir;
use crate::town::Town;

/// One pending migration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Migratable {
    /// Target database name (rig name, or the town database).
    pub name: String,
    /// The embedded database directory to move.
    pub source: PathBuf,
}

/// Find embedded databases that should move into `.dolt-data/`.
///
/// Covers the town itself and every non-hidden rig directory. A rig is
/// migratable when its resolved beads directory contains exactly one
/// `dolt/<sub>/.dolt` candidate and the target database does not exist.
pub fn find_migratable_databases(town: &Town) -> Result<Vec<Migratable>> {
    let mut found = Vec::new();

    let mut consider = |name: &str, work_dir: PathBuf| -> Result<()> {
        if super::database_dir(town, name).exists() {
            return Ok(());
        }
        let beads_dir = beads::resolve_beads_dir(&work_dir)?;
        let dolt_root = beads_dir.join("dolt");
        if !dolt_root.is_dir() {
            return Ok(());
        }
        let mut candidates = Vec::new();
        for entry in std::fs::read_dir(&dolt_root)? {
            let entry = entry?;
            if entry.path().join(".dolt").is_dir() {
                candidates.push(entry.path());
            }
        }
        match candidates.len() {
            0 => {}
            1 => found.push(Migratable {
                name: name.to_owned(),
                source: candidates.remove(0),
            }),
            n => {
                tracing::warn!(
                    rig = name,
                    candidates = n,
                    dir = %dolt_root.display(),
                    "multiple embedded databases; refusing to pick one"
                );
            }
        }
        Ok(())
    };

    consider(super::TOWN_DB, town.root().to_path_buf())?;
    for entry in std::fs::read_dir(town.root())? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !entry.path().is_dir() || name.starts_with('.') || name == "mayor" || name == "daemon"
        {
            continue;
        }
        consider(&name, entry.path())?;
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

/// Move one embedded database into `.dolt-data/<name>`.
///
/// Refuses when the target already exists; reasserts the metadata
/// invariant after the move.
pub fn migrate_rig_from_beads(town: &Town, name: &str, source: &PathBuf) -> Result<()> {
    let target = super::database_dir(town, name);
    if target.exists() {
        return Err(TownError::Corrupt {
            path: target,
            detail: format!("migration target for '{name}' already exists"),
        });
    }
    std::fs::create_dir_all(town.dolt_data_dir())?;
    move_dir(source, &target)?;
    super::metadata::ensure_metadata(town, name)?;
    tracing::info!(rig = name, target = %target.display(), "migrated embedded database");
    Ok(())
}

/// Migrate everything [`find_migratable_databases`] reports.
pub fn migrate_all(town: &Town) -> Result<Vec<String>> {
    let mut migrated = Vec::new();
    for item in find_migratable_databases(town)? {
        migrate_rig_from_beads(town, &item.name, &item.source)?;
        migrated.push(item.name);
    }
    Ok(migrated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn town_fixture() -> (TempDir, Town) {
        let dir = TempDir::new().unwrap();
        let town = Town::create(dir.path()).unwrap();
        (dir, town)
    }

    /// Lay out an embedded database under a rig's beads dir.
    fn seed_embedded(town: &Town, rig: &str) -> PathBuf {
        let db = town.rig_dir(rig).join(".beads/dolt/beads");
        std::fs::create_dir_all(db.join(".dolt")).unwrap();
        std::fs::write(db.join(".dolt/config.json"), "{}\n").unwrap();
        db
    }

    #[test]
    fn scan_finds_single_candidate() {
        let (_dir, town) = town_fixture();
        let source = seed_embedded(&town, "alpha");

        let found = find_migratable_databases(&town).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "alpha");
        assert_eq!(found[0].source, source);
    }

    #[test]
    fn scan_refuses_multiple_candidates() {
        let (_dir, town) = town_fixture();
        seed_embedded(&town, "alpha");
        let second = town.rig_dir("alpha").join(".beads/dolt/extra");
        std::fs::create_dir_all(second.join(".dolt")).unwrap();

        assert!(find_migratable_databases(&town).unwrap().is_empty());
    }

    #[test]
    fn scan_skips_existing_targets() {
        let (_dir, town) = town_fixture();
        seed_embedded(&town, "alpha");
        std::fs::create_dir_all(super::super::database_dir(&town, "alpha").join(".dolt"))
            .unwrap();

        assert!(find_migratable_databases(&town).unwrap().is_empty());
    }

    #[test]
    fn migrate_moves_and_writes_metadata() {
        let (_dir, town) = town_fixture();
        let source = seed_embedded(&town, "alpha");

        migrate_rig_from_beads(&town, "alpha", &source).unwrap();
        assert!(!source.exists());
        let target = super::super::database_dir(&town, "alpha");
        assert!(target.join(".dolt/config.json").is_file());
        let meta = std::fs::read_to_string(
            town.rig_dir("alpha").join(".beads").join("metadata.json"),
        )
        .unwrap();
        assert!(meta.contains("\"dolt_database\": \"alpha\""));
    }

    #[test]
    fn migrate_refuses_existing_target() {
        let (_dir, town) = town_fixture();
        let source = seed_embedded(&town, "alpha");
        std::fs::create_dir_all(super::super::database_dir(&town, "alpha")).unwrap();

        let err = migrate_rig_from_beads(&town, "alpha", &source).unwrap_err();
        assert!(format!("{err}").contains("already exists"));
        assert!(source.exists());
    }

    #[test]
    fn crash_recovery_scenario() {
        // Three rigs with embedded databases; migrate one, then re-scan.
        let (_dir, town) = town_fixture();
        for rig in ["r_alpha", "r_beta", "r_gamma"] {
            seed_embedded(&town, rig);
        }

        let found = find_migratable_databases(&town).unwrap();
        assert_eq!(found.len(), 3);
        let alpha = found.iter().find(|m| m.name == "r_alpha").unwrap();
        migrate_rig_from_beads(&town, &alpha.name, &alpha.source).unwrap();

        let remaining: Vec<String> = find_migratable_databases(&town)
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(remaining, vec!["r_beta", "r_gamma"]);
    }

    #[test]
    fn migrate_all_leaves_nothing_migratable() {
        let (_dir, town) = town_fixture();
        seed_embedded(&town, "r_one");
        seed_embedded(&town, "r_two");

        let migrated = migrate_all(&town).unwrap();
        assert_eq!(migrated, vec!["r_one", "r_two"]);
        assert!(find_migratable_databases(&town).unwrap().is_empty());
    }
}
