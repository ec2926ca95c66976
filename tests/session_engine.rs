//! Session classification and start against a fake multiplexer.

mod common;

use common::{fake_tmux, TestTown};
use rigtown::error::TownError;
use rigtown::session::{
    classify, start_polecat, AgentProfile, Mux, SessionState, StartOptions,
};

struct MuxFixture {
    _town: TestTown,
    town: rigtown::Town,
    mux: Mux,
    state: std::path::PathBuf,
}

fn fixture() -> MuxFixture {
    let test_town = TestTown::new();
    let state = test_town.root().join("mux-state");
    std::fs::create_dir_all(&state).unwrap();
    let tmux = fake_tmux(&state);
    let mux = Mux::with_binary(tmux.to_string_lossy().into_owned());
    let town = test_town.town.clone();
    MuxFixture {
        _town: test_town,
        town,
        mux,
        state,
    }
}

impl MuxFixture {
    fn add_session(&self, id: &str, pane_pid: i32, pane_cmd: &str) {
        std::fs::write(self.state.join(format!("session-{id}")), "").unwrap();
        std::fs::write(self.state.join(format!("pane-pid-{id}")), format!("{pane_pid}\n"))
            .unwrap();
        std::fs::write(self.state.join(format!("pane-cmd-{id}")), format!("{pane_cmd}\n"))
            .unwrap();
    }

    fn polecat_work_dir(&self, rig: &str, name: &str, with_git: bool) -> std::path::PathBuf {
        let work_dir = self.town.rig_dir(rig).join("polecats").join(name).join(rig);
        std::fs::create_dir_all(&work_dir).unwrap();
        if with_git {
            std::fs::write(work_dir.join(".git"), "gitdir: ../../../.repo.git\n").unwrap();
        }
        work_dir
    }
}

#[test]
fn absent_session_is_fresh() {
    let fx = fixture();
    let work_dir = fx.polecat_work_dir("alpha", "nux", true);
    let state = classify(&fx.mux, "gt-alpha-nux", &work_dir, &AgentProfile::default());
    assert_eq!(state, SessionState::Fresh);
}

#[test]
fn dead_pane_process_is_stale() {
    let fx = fixture();
    let work_dir = fx.polecat_work_dir("alpha", "nux", true);
    fx.add_session("gt-alpha-nux", 9_999_999, "claude");
    let state = classify(&fx.mux, "gt-alpha-nux", &work_dir, &AgentProfile::default());
    assert_eq!(state, SessionState::Stale);
}

#[test]
fn missing_git_marker_is_zombie() {
    let fx = fixture();
    let work_dir = fx.polecat_work_dir("alpha", "nux", false);
    let own = std::process::id() as i32;
    fx.add_session("gt-alpha-nux", own, "claude");
    let state = classify(&fx.mux, "gt-alpha-nux", &work_dir, &AgentProfile::default());
    assert_eq!(state, SessionState::Zombie);
}

#[test]
fn missing_pane_is_broken() {
    let fx = fixture();
    let work_dir = fx.polecat_work_dir("alpha", "nux", true);
    std::fs::write(fx.state.join("session-gt-alpha-nux"), "").unwrap();
    // No pane-pid file: the session has no valid pane.
    let state = classify(&fx.mux, "gt-alpha-nux", &work_dir, &AgentProfile::default());
    assert_eq!(state, SessionState::Broken);
}

#[test]
fn foreign_pane_command_is_dead_agent() {
    let fx = fixture();
    let work_dir = fx.polecat_work_dir("alpha", "nux", true);
    let own = std::process::id() as i32;
    fx.add_session("gt-alpha-nux", own, "bash");
    let state = classify(&fx.mux, "gt-alpha-nux", &work_dir, &AgentProfile::default());
    assert_eq!(state, SessionState::DeadAgent);
}

#[test]
fn healthy_session_is_reusable() {
    let fx = fixture();
    let work_dir = fx.polecat_work_dir("alpha", "nux", true);
    let own = std::process::id() as i32;
    fx.add_session("gt-alpha-nux", own, "claude");
    let state = classify(&fx.mux, "gt-alpha-nux", &work_dir, &AgentProfile::default());
    assert_eq!(state, SessionState::Reusable);
}

#[test]
fn start_adopts_reusable_session() {
    let fx = fixture();
    fx.polecat_work_dir("alpha", "nux", true);
    let own = std::process::id() as i32;
    fx.add_session("gt-alpha-nux", own, "claude");

    let err = start_polecat(
        &fx.town,
        &fx.mux,
        &AgentProfile::default(),
        "alpha",
        "nux",
        &StartOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, TownError::SessionReused { .. }));
    // The session was not recreated: no command file was written.
    assert!(!fx.state.join("command-gt-alpha-nux").exists());
}

#[test]
fn start_replaces_dead_agent_session() {
    // Scenario: the pane is alive but runs no configured agent process.
    // Start must kill the session, create a fresh one, and NOT report
    // reuse.
    let fx = fixture();
    fx.polecat_work_dir("alpha", "Toast", true);

    // A live process the reaper may safely inspect: a sleeping child.
    let mut decoy = std::process::Command::new("sleep")
        .arg("300")
        .spawn()
        .unwrap();
    fx.add_session("gt-alpha-Toast", decoy.id() as i32, "vim");

    let started = start_polecat(
        &fx.town,
        &fx.mux,
        &AgentProfile::default(),
        "alpha",
        "Toast",
        &StartOptions::default(),
    )
    .unwrap();
    assert_eq!(started.session_id, "gt-alpha-Toast");

    // The new session's command exports the environment and runs the
    // agent with the startup beacon as its CLI prompt.
    let command =
        std::fs::read_to_string(fx.state.join("command-gt-alpha-Toast")).unwrap();
    assert!(command.contains("export GT_RIG='alpha'"));
    assert!(command.contains("GT_POLECAT='Toast'"));
    assert!(command.contains("GT_ROLE='alpha/polecats/Toast'"));
    assert!(command.contains("BD_ACTOR='gt-alpha-Toast'"));
    assert!(command.contains("claude"));
    assert!(command.contains("[beacon]"));

    // Session env was also set for respawned panes.
    assert!(fx.state.join("env-gt-alpha-Toast").exists());

    // PID tracked on disk for orphan cleanup.
    assert!(fx
        .town
        .daemon_dir()
        .join("sessions/gt-alpha-Toast.pid")
        .exists());

    let _ = decoy.kill();
    let _ = decoy.wait();
}

#[test]
fn start_missing_polecat_fails() {
    let fx = fixture();
    let err = start_polecat(
        &fx.town,
        &fx.mux,
        &AgentProfile::default(),
        "alpha",
        "ghost",
        &StartOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, TownError::PolecatNotFound { .. }));
}

#[test]
fn start_validates_issue_before_any_session_work() {
    common::install_fake_tools();
    let fx = fixture();
    let work_dir = fx.polecat_work_dir("alpha", "nux", true);

    // No route for the prefix, so validation runs in the work dir. The
    // issue is tombstoned: start must fail without creating the session.
    std::fs::write(work_dir.join(".fake-tombstone-al-a2b3c"), "").unwrap();

    let err = start_polecat(
        &fx.town,
        &fx.mux,
        &AgentProfile::default(),
        "alpha",
        "nux",
        &StartOptions {
            issue: Some("al-a2b3c".to_owned()),
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, TownError::IssueInvalid { .. }));
    assert!(!fx.state.join("session-gt-alpha-nux").exists());
}
