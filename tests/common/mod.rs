//! Shared helpers for integration tests.
//!
//! All tests run against temp directories; no side effects outside them.
//! External tools the core shells out to (dolt, bd, tmux) are faked via
//! PATH indirection or an explicit fake binary path; git is used for real
//! and tests skip gracefully when it is missing.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use rigtown::Town;
use tempfile::TempDir;

/// A temp town with the reserved children in place.
pub struct TestTown {
    pub dir: TempDir,
    pub town: Town,
}

impl TestTown {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let town = Town::create(dir.path()).expect("town create");
        Self { dir, town }
    }

    pub fn root(&self) -> &Path {
        self.town.root()
    }
}

/// Whether real git is runnable.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

/// Create a seed git repo with one commit on `main`; returns its path.
pub fn seed_git_repo(dir: &Path) {
    let run = |args: &[&str]| {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("git runs");
        assert!(
            out.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
    };
    run(&["init", "-b", "main"]);
    run(&["config", "user.email", "test@example.com"]);
    run(&["config", "user.name", "Test"]);
    std::fs::write(dir.join("README.md"), "seed\n").unwrap();
    run(&["add", "."]);
    run(&["commit", "-m", "initial"]);
}

/// Write an executable script.
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, body).expect("write script");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
}

/// Fake `dolt` that records invocations in its working directory.
///
/// Behavior, driven by marker files in the CWD (the data dir for `sql`,
/// the database dir for `init`):
/// - `sql-server`: clears `.fake-read-only` under its `--data-dir`, then
///   stays alive (the coordinator's liveness and cmdline checks pass).
/// - `init`: creates a `.dolt/` marker.
/// - `sql`: logs args to `dolt-invocations.log`; `--file` scripts are
///   appended to `dolt-scripts.log`. Fails read-only when
///   `.fake-read-only` exists; fails with `Merge conflict` when
///   `.fake-conflict` exists and the script is not the resolution phase.
pub const FAKE_DOLT: &str = r#"#!/bin/sh
cmd="$1"
if [ "$cmd" = "sql-server" ]; then
    shift
    while [ $# -gt 0 ]; do
        if [ "$1" = "--data-dir" ]; then rm -f "$2/.fake-read-only"; fi
        shift
    done
    while true; do sleep 1; done
fi
if [ "$cmd" = "init" ]; then
    mkdir -p .dolt
    echo '{}' > .dolt/config.json
    exit 0
fi
if [ "$cmd" = "sql" ]; then
    echo "$@" >> dolt-invocations.log
    script=""
    prev=""
    for arg in "$@"; do
        if [ "$prev" = "--file" ]; then script="$arg"; fi
        prev="$arg"
    done
    if [ -n "$script" ]; then
        cat "$script" >> dolt-scripts.log
        echo "---" >> dolt-scripts.log
    fi
    if [ -f .fake-read-only ]; then
        echo "database is read only" >&2
        exit 1
    fi
    if [ -f .fake-conflict ] && [ -n "$script" ]; then
        if grep -q "DOLT_CONFLICTS_RESOLVE" "$script"; then
            rm -f .fake-conflict
        else
            echo "error: Merge conflict in beads" >&2
            exit 1
        fi
    fi
    exit 0
fi
exit 0
"#;

/// Fake `bd` that records invocations to `bd.log` in its working
/// directory and answers `show` from `.fake-issue-*` markers.
pub const FAKE_BD: &str = r#"#!/bin/sh
echo "$@" >> bd.log
if [ "$1" = "show" ]; then
    id="$2"
    if [ -f ".fake-tombstone-$id" ]; then
        echo "{\"id\":\"$id\",\"status\":\"tombstone\"}"
        exit 0
    fi
    if [ -f ".fake-issue-$id" ]; then
        echo "{\"id\":\"$id\",\"status\":\"open\"}"
        exit 0
    fi
    echo "not found" >&2
    exit 1
fi
exit 0
"#;

/// Install fake `dolt` and `bd` onto PATH, once per test binary.
pub fn install_fake_tools() {
    static FAKES: OnceLock<PathBuf> = OnceLock::new();
    FAKES.get_or_init(|| {
        let dir = std::env::temp_dir().join(format!("gt-fakes-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("fake bin dir");
        write_script(&dir.join("dolt"), FAKE_DOLT);
        write_script(&dir.join("bd"), FAKE_BD);
        let path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{path}", dir.display()));
        dir
    });
}

/// A per-test fake tmux driven by a state directory baked into the
/// script. Session existence is a `session-<id>` file; pane pid and
/// current command are `pane-pid-<id>` / `pane-cmd-<id>` files. All
/// `send-keys` are appended to `keys-<id>`.
pub fn fake_tmux(state_dir: &Path) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
state="{state}"
cmd="$1"; shift
case "$cmd" in
    has-session)
        [ -f "$state/session-$2" ] || exit 1 ;;
    new-session)
        # -d -s <id> -c <dir> <command>
        id=""; prev=""
        for arg in "$@"; do
            if [ "$prev" = "-s" ]; then id="$arg"; fi
            prev="$arg"
        done
        touch "$state/session-$id"
        echo "$$" > "$state/pane-pid-$id"
        echo "claude" > "$state/pane-cmd-$id"
        # Last argument is the command line.
        for arg in "$@"; do last="$arg"; done
        printf '%s\n' "$last" > "$state/command-$id"
        ;;
    kill-session)
        rm -f "$state/session-$2" "$state/pane-pid-$2" "$state/pane-cmd-$2" ;;
    list-sessions)
        for f in "$state"/session-*; do
            [ -e "$f" ] || exit 0
            basename "$f" | sed 's/^session-//'
        done ;;
    list-panes)
        cat "$state/pane-pid-$2" 2>/dev/null || exit 1 ;;
    display-message)
        cat "$state/pane-cmd-$3" 2>/dev/null || exit 1 ;;
    capture-pane)
        cat "$state/capture-$2" 2>/dev/null || echo "" ;;
    send-keys)
        echo "$@" >> "$state/keys-$2" ;;
    set-environment)
        echo "$@" >> "$state/env-$2" ;;
    *)
        exit 0 ;;
esac
exit 0
"#,
        state = state_dir.display()
    );
    let path = state_dir.join("tmux-fake");
    write_script(&path, &script);
    path
}
