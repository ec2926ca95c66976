//! `bd` (beads CLI) adapter.
//!
//! Beads are created, tracked, and mutated by the external `bd` tool; the
//! orchestrator only shells out to it. Args are constructed internally;
//! no user-supplied string reaches a shell. Every invocation carries a
//! 30-second deadline: a hung bead mutation must never wedge session
//! start or work dispatch.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Result, TownError};

/// Deadline for any bd invocation.
pub const BD_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle for running bd inside a beads-resolved working directory.
#[derive(Clone, Debug)]
pub struct BeadsCli {
    work_dir: PathBuf,
}

impl BeadsCli {
    pub fn in_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    /// Initialize bead storage in server mode against database `db`.
    pub fn init_server(&self, db: &str) -> Result<()> {
        self.run(&["init", "--backend", "dolt", "--mode", "server", "--db", db])?;
        Ok(())
    }

    /// Set the issue-id prefix (without the trailing hyphen).
    pub fn set_prefix(&self, prefix: &str) -> Result<()> {
        self.run(&["config", "set", "issue-prefix", prefix])?;
        Ok(())
    }

    /// Pin a bead to an agent: `status=hooked`, `assignee=<agent>`.
    pub fn hook_issue(&self, issue_id: &str, agent_id: &str) -> Result<()> {
        self.run(&[
            "update", issue_id, "--status", "hooked", "--assignee", agent_id,
        ])?;
        Ok(())
    }

    /// Fetch a bead as JSON, for validation before session start.
    pub fn show_issue(&self, issue_id: &str) -> Result<serde_json::Value> {
        let out = self.run(&["show", issue_id, "--json"])?;
        serde_json::from_str(&out).map_err(|e| TownError::Corrupt {
            path: self.work_dir.join(issue_id),
            detail: format!("bd show returned unparsable JSON: {e}"),
        })
    }

    /// Validate that `issue_id` names an existing, non-tombstoned bead.
    pub fn validate_issue(&self, issue_id: &str) -> Result<()> {
        let value = self.show_issue(issue_id).map_err(|_| TownError::IssueInvalid {
            id: issue_id.to_owned(),
            reason: "not found".to_owned(),
        })?;
        let status = value.get("status").and_then(|v| v.as_str()).unwrap_or("");
        if status == "tombstone" {
            return Err(TownError::IssueInvalid {
                id: issue_id.to_owned(),
                reason: "tombstoned".to_owned(),
            });
        }
        Ok(())
    }

    /// Create an agent bead with a structured id.
    pub fn create_agent_bead(&self, id: &str, title: &str) -> Result<()> {
        self.run(&["create", "--type", "agent", "--id", id, title])?;
        Ok(())
    }

    /// Seed the patrol molecules for a rig. Best-effort at call sites;
    /// a missing formula pack is not fatal to rig creation.
    pub fn seed_patrol_molecules(&self) -> Result<()> {
        self.run(&["molecule", "seed", "patrol"])?;
        Ok(())
    }

    /// Run bd with the standard deadline.
    pub fn run(&self, args: &[&str]) -> Result<String> {
        let mut child = Command::new("bd")
            .args(args)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(TownError::Io)?;

        let deadline = Instant::now() + BD_TIMEOUT;
        loop {
            match child.try_wait()? {
                Some(_) => break,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TownError::Subprocess {
                        program: "bd".to_owned(),
                        args: args.iter().map(|s| (*s).to_owned()).collect(),
                        stdout: String::new(),
                        stderr: format!("timed out after {}s", BD_TIMEOUT.as_secs()),
                        status: None,
                    });
                }
                None => std::thread::sleep(Duration::from_millis(25)),
            }
        }
        let output = child.wait_with_output()?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(TownError::from_output("bd", args, &output))
        }
    }
}

/// Ensure `issues.jsonl` exists in a beads directory.
///
/// The export path appends to this file; when it is missing some bd
/// versions fall back to writing into whatever JSONL they find, which can
/// corrupt unrelated files. An empty file pins the export target.
pub fn ensure_issues_jsonl(beads_dir: &Path) -> Result<bool> {
    let path = beads_dir.join("issues.jsonl");
    if path.exists() {
        return Ok(false);
    }
    std::fs::create_dir_all(beads_dir)?;
    std::fs::write(&path, "")?;
    Ok(true)
}
