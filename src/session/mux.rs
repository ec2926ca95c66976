//! Terminal-multiplexer adapter (tmux or compatible).
//!
//! One agent process per session. All queries go through tmux's formats
//! (`#{pane_pid}`, `#{pane_current_command}`) rather than scraping human
//! output. The binary name is overridable for compatible multiplexers.

use std::path::Path;
use std::process::{Command, Stdio};

use crate::error::{Result, TownError};

/// Adapter over the multiplexer binary.
#[derive(Clone, Debug)]
pub struct Mux {
    binary: String,
}

impl Default for Mux {
    fn default() -> Self {
        Self {
            binary: "tmux".to_owned(),
        }
    }
}

impl Mux {
    /// Use a specific multiplexer binary.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(TownError::Io)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(TownError::from_output(&self.binary, args, &output))
        }
    }

    /// Whether a session with this id exists.
    pub fn has_session(&self, session_id: &str) -> bool {
        Command::new(&self.binary)
            .args(["has-session", "-t", session_id])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    /// Create a detached session running `command` in `work_dir`.
    ///
    /// The command goes on the session's creation line, not through a
    /// follow-up `send-keys`; the latter races agent startup and can
    /// deliver keys to a half-initialized process.
    pub fn new_session(&self, session_id: &str, work_dir: &Path, command: &str) -> Result<()> {
        let dir = work_dir.to_string_lossy().into_owned();
        self.run(&[
            "new-session",
            "-d",
            "-s",
            session_id,
            "-c",
            dir.as_str(),
            command,
        ])?;
        Ok(())
    }

    /// Set an environment variable on the session, inherited by any pane
    /// respawned later.
    pub fn set_env(&self, session_id: &str, key: &str, value: &str) -> Result<()> {
        self.run(&["set-environment", "-t", session_id, key, value])?;
        Ok(())
    }

    /// Kill the session. Callers that need descendant reaping go through
    /// [`crate::session::stop`], never this directly.
    pub fn kill_session(&self, session_id: &str) -> Result<()> {
        self.run(&["kill-session", "-t", session_id])?;
        Ok(())
    }

    /// All live session names. An unreachable multiplexer server means no
    /// sessions.
    pub fn list_sessions(&self) -> Vec<String> {
        self.run(&["list-sessions", "-F", "#{session_name}"])
            .map(|out| out.lines().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    /// PID of the session's root pane process, when the pane is valid.
    pub fn pane_pid(&self, session_id: &str) -> Option<i32> {
        let out = self
            .run(&["list-panes", "-t", session_id, "-F", "#{pane_pid}"])
            .ok()?;
        out.lines().next()?.trim().parse().ok()
    }

    /// The command currently running in the session's pane.
    pub fn pane_current_command(&self, session_id: &str) -> Option<String> {
        let out = self
            .run(&[
                "display-message",
                "-p",
                "-t",
                session_id,
                "#{pane_current_command}",
            ])
            .ok()?;
        let cmd = out.trim();
        if cmd.is_empty() {
            None
        } else {
            Some(cmd.to_owned())
        }
    }

    /// Capture the session's pane content.
    pub fn capture_pane(&self, session_id: &str) -> Result<String> {
        self.run(&["capture-pane", "-t", session_id, "-p"])
    }

    /// Send literal text to the session (no key-name interpretation).
    pub fn send_text(&self, session_id: &str, text: &str) -> Result<()> {
        self.run(&["send-keys", "-t", session_id, "-l", text])?;
        Ok(())
    }

    /// Send the Enter key.
    pub fn send_enter(&self, session_id: &str) -> Result<()> {
        self.run(&["send-keys", "-t", session_id, "Enter"])?;
        Ok(())
    }

    /// Send an interrupt (C-c).
    pub fn send_interrupt(&self, session_id: &str) -> Result<()> {
        self.run(&["send-keys", "-t", session_id, "C-c"])?;
        Ok(())
    }
}
