//! Session stop with descendant reaping.
//!
//! Agent tool use spawns shells that detach from the pane's process
//! group; a plain `kill-session` leaves them running. Every kill here
//! walks the pane's process tree first and terminates descendants
//! explicitly, then removes the session.

use std::process::{Command, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::dolt::server::process_alive;
use crate::error::Result;
use crate::town::Town;

use super::mux::Mux;

/// Options for [`stop_session`].
#[derive(Clone, Copy, Debug, Default)]
pub struct StopOptions {
    /// Send C-c first and give the agent a moment to shut down cleanly.
    pub interrupt: bool,
}

/// Stop a session: optional interrupt, then descendant reaping, then
/// session removal. Idempotent; a missing session is a no-op.
pub fn stop_session(town: &Town, mux: &Mux, session_id: &str, opts: StopOptions) -> Result<()> {
    if !mux.has_session(session_id) {
        remove_pid_record(town, session_id);
        return Ok(());
    }

    if opts.interrupt {
        let _ = mux.send_interrupt(session_id);
        // Give the agent a window to exit on its own.
        for _ in 0..10 {
            if !mux.has_session(session_id) {
                remove_pid_record(town, session_id);
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(300));
        }
    }

    reap_session(mux, session_id);
    remove_pid_record(town, session_id);
    Ok(())
}

/// Kill a session and every process descended from its pane.
pub fn reap_session(mux: &Mux, session_id: &str) {
    if let Some(root) = mux.pane_pid(session_id) {
        let descendants = descendant_pids(root);
        // Children first is not required; SIGTERM all, then sweep.
        for pid in &descendants {
            let _ = kill(Pid::from_raw(*pid), Signal::SIGTERM);
        }
        std::thread::sleep(Duration::from_millis(200));
        for pid in &descendants {
            if process_alive(*pid) {
                let _ = kill(Pid::from_raw(*pid), Signal::SIGKILL);
            }
        }
    }
    let _ = mux.kill_session(session_id);
}

/// All PIDs descended from `root` (excluding root itself, which the
/// multiplexer owns), from one `ps -eo pid,ppid` snapshot.
pub fn descendant_pids(root: i32) -> Vec<i32> {
    let Ok(output) = Command::new("ps")
        .args(["-eo", "pid,ppid"])
        .stdin(Stdio::null())
        .output()
    else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }
    let table = String::from_utf8_lossy(&output.stdout);
    let mut edges: Vec<(i32, i32)> = Vec::new();
    for line in table.lines().skip(1) {
        let mut parts = line.split_whitespace();
        let (Some(pid), Some(ppid)) = (parts.next(), parts.next()) else {
            continue;
        };
        if let (Ok(pid), Ok(ppid)) = (pid.parse(), ppid.parse()) {
            edges.push((pid, ppid));
        }
    }

    let mut result = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for (pid, ppid) in &edges {
            if *ppid == parent && !result.contains(pid) {
                result.push(*pid);
                frontier.push(*pid);
            }
        }
    }
    result
}

fn remove_pid_record(town: &Town, session_id: &str) {
    let path = town
        .daemon_dir()
        .join("sessions")
        .join(format!("{session_id}.pid"));
    let _ = std::fs::remove_file(path);
}
