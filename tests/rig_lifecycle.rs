//! End-to-end rig creation and adoption with real git and faked
//! dolt/bd tools.

mod common;

use common::{git_available, install_fake_tools, seed_git_repo, TestTown};
use rigtown::beads::resolve_beads_dir;
use rigtown::rig::add::{add_rig, AddRigOptions};
use rigtown::rig::register::{register_rig, RegisterRigOptions};
use rigtown::town::RigRegistry;
use rigtown::{routes, Town};
use tempfile::TempDir;

macro_rules! require_git {
    () => {
        if !git_available() {
            eprintln!("git not available; skipping");
            return;
        }
    };
}

fn seed() -> (TempDir, String) {
    let seed_dir = TempDir::new().unwrap();
    seed_git_repo(seed_dir.path());
    let url = format!("file://{}", seed_dir.path().display());
    (seed_dir, url)
}

#[test]
fn add_rig_materializes_full_topology() {
    require_git!();
    install_fake_tools();
    let fixture = TestTown::new();
    let town = &fixture.town;
    let (_seed, url) = seed();

    let config = add_rig(
        town,
        &AddRigOptions {
            name: "alpha".to_owned(),
            git_url: url.clone(),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(config.default_branch, "main");
    assert_eq!(config.beads.prefix, "al");

    let rig = town.rig_dir("alpha");
    // Shared bare repo.
    assert!(rig.join(".repo.git/HEAD").is_file());
    assert!(!rig.join(".repo.git/.git").exists());
    // Mayor: a regular clone on the default branch.
    assert!(rig.join("mayor/rig/.git").is_dir());
    assert!(rig.join("mayor/rig/README.md").is_file());
    // Refinery: a worktree of the bare repo.
    assert!(rig.join("refinery/rig/README.md").is_file());
    assert!(rig.join("refinery/rig/.git").is_file());
    // Role containers.
    assert!(rig.join("crew/README.md").is_file());
    assert!(rig.join("witness").is_dir());
    assert!(rig.join("polecats").is_dir());
    assert!(rig.join("settings/polecat.json").is_file());
    // Plugins at both levels.
    assert!(rig.join("plugins/README.md").is_file());
    assert!(town.root().join("plugins/README.md").is_file());

    // Routing entry.
    let table = routes::load(&town.beads_dir()).unwrap();
    assert!(table
        .iter()
        .any(|r| r.prefix == "al-" && r.path == "alpha"));

    // Database and metadata invariant (through the redirect chain).
    assert!(town.dolt_data_dir().join("alpha/.dolt").is_dir());
    let beads_dir = resolve_beads_dir(&rig).unwrap();
    let metadata: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(beads_dir.join("metadata.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(metadata["dolt_database"], "alpha");
    assert_eq!(metadata["dolt_mode"], "server");

    // Refinery's beads redirect resolves to the same logical directory.
    assert_eq!(
        resolve_beads_dir(&rig.join("refinery/rig")).unwrap(),
        beads_dir
    );

    // Registered.
    let registry = RigRegistry::load(town).unwrap();
    assert!(registry.rigs.contains_key("alpha"));

    // Second add of the same name is refused and leaves the rig alone.
    assert!(add_rig(
        town,
        &AddRigOptions {
            name: "alpha".to_owned(),
            git_url: url,
            ..Default::default()
        },
    )
    .is_err());
    assert!(rig.join(".repo.git/HEAD").is_file());
}

#[test]
fn add_rig_with_bad_branch_cleans_up() {
    require_git!();
    install_fake_tools();
    let fixture = TestTown::new();
    let (_seed, url) = seed();

    let err = add_rig(
        &fixture.town,
        &AddRigOptions {
            name: "beta".to_owned(),
            git_url: url,
            default_branch: Some("no-such-branch".to_owned()),
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(format!("{err}").contains("no-such-branch"));
    // Cleanup guard removed the partial rig.
    assert!(!fixture.town.rig_dir("beta").exists());
}

#[test]
fn register_adopts_existing_clone() {
    require_git!();
    install_fake_tools();
    let fixture = TestTown::new();
    let town = &fixture.town;
    let (_seed, url) = seed();

    // A rig directory with only a mayor clone, as a half-adopted repo
    // would look.
    let mayor = town.rig_dir("gamma").join("mayor/rig");
    std::fs::create_dir_all(mayor.parent().unwrap()).unwrap();
    let out = std::process::Command::new("git")
        .args(["clone", &url, &mayor.to_string_lossy()])
        .output()
        .unwrap();
    assert!(out.status.success());

    let config = register_rig(
        town,
        &RegisterRigOptions {
            name: "gamma".to_owned(),
            ..Default::default()
        },
    )
    .unwrap();
    // URL auto-detected from the clone's origin.
    assert_eq!(config.git_url, url);
    assert_eq!(config.beads.prefix, "ga");

    let registry = RigRegistry::load(town).unwrap();
    assert_eq!(registry.rigs["gamma"].git_url, url);
}

#[test]
fn tracked_beads_prefix_and_route() {
    require_git!();
    install_fake_tools();
    let fixture = TestTown::new();
    let town = &fixture.town;

    // Seed repo with a tracked .beads directory carrying a prefix.
    let seed_dir = TempDir::new().unwrap();
    seed_git_repo(seed_dir.path());
    std::fs::create_dir_all(seed_dir.path().join(".beads")).unwrap();
    std::fs::write(
        seed_dir.path().join(".beads/config.yaml"),
        "issue-prefix: gx-\n",
    )
    .unwrap();
    std::fs::write(
        seed_dir.path().join(".beads/issues.jsonl"),
        "{\"id\":\"gx-a2b3c\",\"title\":\"seed task\"}\n",
    )
    .unwrap();
    let add = std::process::Command::new("git")
        .args(["add", "."])
        .current_dir(seed_dir.path())
        .output()
        .unwrap();
    assert!(add.status.success());
    let commit = std::process::Command::new("git")
        .args(["commit", "-m", "track beads"])
        .current_dir(seed_dir.path())
        .output()
        .unwrap();
    assert!(commit.status.success());
    let url = format!("file://{}", seed_dir.path().display());

    let config = add_rig(
        town,
        &AddRigOptions {
            name: "delta".to_owned(),
            git_url: url,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(config.beads.prefix, "gx");

    // Tracked beads: the route points into the mayor clone.
    let table = routes::load(&town.beads_dir()).unwrap();
    assert!(table
        .iter()
        .any(|r| r.prefix == "gx-" && r.path == "delta/mayor/rig"));

    // Rig-level .beads is a redirect into the mayor clone.
    let redirect = town.rig_dir("delta").join(".beads/redirect");
    assert_eq!(
        std::fs::read_to_string(redirect).unwrap(),
        "mayor/rig/.beads\n"
    );
}

#[test]
fn hook_dir_resolution_follows_routes_not_redirects() {
    // A worktree's redirect and the town route table answer different
    // questions: the redirect finds the database, the route finds the
    // directory hooks must run in.
    let fixture = TestTown::new();
    let town = &fixture.town;

    let worktree = town.root().join("crew/max");
    std::fs::create_dir_all(worktree.join(".beads")).unwrap();
    std::fs::write(
        worktree.join(".beads/redirect"),
        "../../mayor/rig/.beads\n",
    )
    .unwrap();
    std::fs::create_dir_all(town.root().join("mayor/rig/.beads")).unwrap();

    assert_eq!(
        resolve_beads_dir(&worktree).unwrap(),
        town.root().join("mayor/rig/.beads")
    );

    routes::append_to_dir(&town.beads_dir(), routes::Route::new("gt-", ".")).unwrap();
    let hook_dir = routes::resolve_hook_dir(town, "gt-a2b3c", &worktree);
    assert_eq!(hook_dir, town.root());
    assert_ne!(hook_dir, worktree);
}

#[test]
fn town_discovery_from_deep_worktree() {
    let fixture = TestTown::new();
    let deep = fixture.root().join("alpha/polecats/nux/alpha/src");
    std::fs::create_dir_all(&deep).unwrap();
    assert_eq!(Town::find(&deep).unwrap().root(), fixture.root());
}
