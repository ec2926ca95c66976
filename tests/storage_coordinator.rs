//! Server lifecycle, read-only recovery, and the polecat merge pipeline,
//! driven against a fake dolt binary on PATH.

mod common;

use common::{install_fake_tools, TestTown};
use rigtown::dolt::branch::{merge_polecat_branch, MergeResult};
use rigtown::dolt::server::DoltServer;
use rigtown::dolt::sql::DoltSql;
use rigtown::dolt::{self, health};

fn town_with_database(name: &str) -> TestTown {
    install_fake_tools();
    let fixture = TestTown::new();
    std::fs::create_dir_all(dolt::database_dir(&fixture.town, name).join(".dolt")).unwrap();
    fixture
}

#[test]
fn server_start_stop_cycle() {
    let fixture = town_with_database("alpha");
    let server = DoltServer::with_defaults(fixture.town.clone());

    let pid = server.start().unwrap();
    assert!(dolt::server::process_alive(pid));
    assert_eq!(server.probe_running(), Some(pid));

    // Double-start refused while running.
    assert!(server.start().is_err());

    let state = server.load_state();
    assert!(state.running);
    assert_eq!(state.pid, Some(pid));
    assert_eq!(state.databases, vec!["alpha"]);

    server.stop().unwrap();
    assert!(server.probe_running().is_none());
    let state = server.load_state();
    assert!(!state.running);
    assert_eq!(state.history.len(), 1);
    assert_eq!(state.history[0].pid, pid);
}

#[test]
fn read_only_recovery_restarts_server() {
    // Scenario: the server degraded into read-only mode. Recovery must
    // stop it, start a replacement, and verify writability.
    let fixture = town_with_database("beta");
    let server = DoltServer::with_defaults(fixture.town.clone());
    let data_dir = fixture.town.dolt_data_dir();

    let old_pid = server.start().unwrap();
    std::fs::write(data_dir.join(".fake-read-only"), "").unwrap();
    assert!(health::probe_read_only(&fixture.town).unwrap());

    health::recover_read_only(&fixture.town, &server).unwrap();

    let new_pid = server.probe_running().expect("server running after recovery");
    assert_ne!(new_pid, old_pid);
    assert!(!health::probe_read_only(&fixture.town).unwrap());

    server.stop().unwrap();
}

#[test]
fn clean_merge_runs_one_phase_and_deletes_branch() {
    let fixture = town_with_database("gamma");
    let data_dir = fixture.town.dolt_data_dir();
    let sql = DoltSql::new(&data_dir);

    let result = merge_polecat_branch(&sql, "gamma", "polecat-nux-1738000000").unwrap();
    assert_eq!(result, MergeResult::Clean);

    let scripts = std::fs::read_to_string(data_dir.join("dolt-scripts.log")).unwrap();
    assert!(scripts.contains("USE `gamma`"));
    assert!(scripts.contains("DOLT_CHECKOUT('polecat-nux-1738000000')"));
    assert!(scripts.contains("DOLT_MERGE('polecat-nux-1738000000')"));
    assert!(!scripts.contains("DOLT_CONFLICTS_RESOLVE"));

    let invocations =
        std::fs::read_to_string(data_dir.join("dolt-invocations.log")).unwrap();
    assert!(invocations.contains("DOLT_BRANCH('-D', 'polecat-nux-1738000000')"));
}

#[test]
fn conflicted_merge_resolves_theirs_then_deletes_branch() {
    // Scenario: the branch conflicts with main. Phase 1 fails, phase 2
    // resolves in the polecat's favor, and only then is the branch
    // deleted.
    let fixture = town_with_database("delta");
    let data_dir = fixture.town.dolt_data_dir();
    std::fs::write(data_dir.join(".fake-conflict"), "").unwrap();
    let sql = DoltSql::new(&data_dir);

    let result = merge_polecat_branch(&sql, "delta", "polecat-ace-1738000001").unwrap();
    assert_eq!(result, MergeResult::ResolvedTheirs);

    let scripts = std::fs::read_to_string(data_dir.join("dolt-scripts.log")).unwrap();
    assert!(scripts.contains("DOLT_CONFLICTS_RESOLVE('--theirs', '.')"));
    assert!(scripts.contains("SET @@autocommit = 0"));

    let invocations =
        std::fs::read_to_string(data_dir.join("dolt-invocations.log")).unwrap();
    assert!(invocations.contains("DOLT_BRANCH('-D', 'polecat-ace-1738000001')"));
    // The conflict marker was consumed by the resolution phase.
    assert!(!data_dir.join(".fake-conflict").exists());
}

#[test]
fn failed_merge_preserves_branch() {
    // Both phases failing must leave the branch for inspection.
    let fixture = town_with_database("epsilon");
    let data_dir = fixture.town.dolt_data_dir();
    std::fs::write(data_dir.join(".fake-read-only"), "").unwrap();
    let sql = DoltSql::new(&data_dir);

    let err = merge_polecat_branch(&sql, "epsilon", "polecat-bad-1738000002").unwrap_err();
    assert!(err.subprocess_text().unwrap().contains("read only"));

    let invocations =
        std::fs::read_to_string(data_dir.join("dolt-invocations.log")).unwrap();
    assert!(!invocations.contains("'-D'"));
}

#[test]
fn init_rig_creates_database_locally_when_server_down() {
    install_fake_tools();
    let fixture = TestTown::new();
    std::fs::create_dir_all(fixture.town.rig_dir("zeta")).unwrap();

    dolt::init_rig(&fixture.town, "zeta").unwrap();
    assert!(dolt::database_dir(&fixture.town, "zeta").join(".dolt").is_dir());
    assert_eq!(dolt::list_databases(&fixture.town).unwrap(), vec!["zeta"]);
}
