//! Unified error type for town operations.
//!
//! Defines [`TownError`], the error type shared by the topology manager,
//! storage coordinator, session engine, and routing core. Error messages
//! are designed to be agent-friendly: each variant includes a clear
//! description of what went wrong and actionable guidance on how to fix it.
//!
//! Subprocess failures keep the raw captured output. Nothing in this module
//! interprets tool stderr; callers that need to recognize a tool condition
//! go through the predicate functions in the owning adapter module.

use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;

// ---------------------------------------------------------------------------
// TownError
// ---------------------------------------------------------------------------

/// Unified error type for orchestrator operations.
///
/// Each variant is self-contained: an agent receiving this error should be
/// able to understand what happened and what to do next without additional
/// context.
#[derive(Debug)]
pub enum TownError {
    /// The current directory is not inside a town.
    TownNotFound {
        /// Where the walk-up search started.
        start: PathBuf,
    },

    /// The requested rig is not registered or its directory is missing.
    RigNotFound {
        /// The rig name that was not found.
        name: String,
    },

    /// A rig with this name already exists on disk.
    RigExists {
        /// The rig name that already exists.
        name: String,
    },

    /// A rig name failed validation.
    InvalidRigName {
        /// The invalid name that was provided.
        name: String,
        /// Why the name is invalid.
        reason: String,
        /// A sanitized candidate that would pass validation, if one exists.
        suggestion: Option<String>,
    },

    /// A database branch name failed the safe-identifier check.
    InvalidBranchName {
        /// The invalid branch name.
        name: String,
        /// Why the name is invalid.
        reason: String,
    },

    /// The requested polecat directory does not exist.
    PolecatNotFound {
        /// The rig the polecat belongs to.
        rig: String,
        /// The polecat name.
        name: String,
    },

    /// The requested multiplexer session does not exist.
    SessionNotFound {
        /// The session id that was not found.
        session: String,
    },

    /// A healthy session already existed and was adopted instead of
    /// recreated. This is a sentinel, not a failure: the caller decides
    /// whether adoption is acceptable.
    SessionReused {
        /// The session id that was reused.
        session: String,
    },

    /// A bead id passed to an operation does not exist or is tombstoned.
    IssueInvalid {
        /// The offending bead id.
        id: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The requested logical database does not exist under `.dolt-data/`.
    DatabaseNotFound {
        /// The database name.
        name: String,
    },

    /// The SQL server is already running.
    ServerRunning {
        /// PID of the running server.
        pid: i32,
    },

    /// The SQL server is not running (or not reachable) when an operation
    /// required it.
    ServerNotRunning,

    /// An external tool invocation failed.
    ///
    /// Carries the full captured record. Callers must observe the raw text
    /// fields rather than pattern-match prose; the only sanctioned
    /// interpretations live in the adapter predicate functions.
    Subprocess {
        /// The program that was run (e.g. `"git"`).
        program: String,
        /// The full argument list.
        args: Vec<String>,
        /// Captured stdout.
        stdout: String,
        /// Captured stderr.
        stderr: String,
        /// The exit status, if the process ran at all.
        status: Option<ExitStatus>,
    },

    /// An on-disk record could not be parsed.
    ///
    /// Policy: callers log and skip individual corrupt records where the
    /// surrounding operation can continue; this variant surfaces only when
    /// the whole operation depends on the record.
    Corrupt {
        /// Path of the corrupt file.
        path: PathBuf,
        /// Human-readable description of the problem.
        detail: String,
    },

    /// A redirect chain resolved back to its own starting directory.
    ///
    /// The resolver removes the offending file before returning this.
    CircularRedirect {
        /// The worktree whose redirect was circular.
        path: PathBuf,
    },

    /// A redirect chain exceeded the maximum depth.
    RedirectTooDeep {
        /// The directory where resolution started.
        start: PathBuf,
        /// The maximum number of hops allowed.
        max_hops: usize,
    },

    /// An I/O error occurred during an orchestrator operation.
    Io(std::io::Error),
}

impl TownError {
    /// Build a [`TownError::Subprocess`] from a finished `Output`.
    pub fn from_output(program: &str, args: &[&str], output: &std::process::Output) -> Self {
        Self::Subprocess {
            program: program.to_owned(),
            args: args.iter().map(|s| (*s).to_owned()).collect(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            status: Some(output.status),
        }
    }

    /// The captured stderr of a subprocess failure, if this is one.
    pub fn subprocess_stderr(&self) -> Option<&str> {
        match self {
            Self::Subprocess { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// Combined raw output of a subprocess failure (stdout then stderr).
    ///
    /// dolt reports some failures on stdout and some on stderr; retry
    /// classification needs to see both.
    pub fn subprocess_text(&self) -> Option<String> {
        match self {
            Self::Subprocess { stdout, stderr, .. } => Some(format!("{stdout}\n{stderr}")),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Display; agent-friendly error messages
// ---------------------------------------------------------------------------

impl fmt::Display for TownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TownNotFound { start } => {
                write!(
                    f,
                    "no town found above {}.\n  A town root is marked by mayor/town.json.\n  To fix: cd into a town, or create one first.",
                    start.display()
                )
            }
            Self::RigNotFound { name } => {
                write!(
                    f,
                    "rig '{name}' not found.\n  To fix: check registered rigs:\n    gt rig list"
                )
            }
            Self::RigExists { name } => {
                write!(
                    f,
                    "rig '{name}' already exists.\n  To fix: use a different name, or adopt the existing directory:\n    gt rig register {name}"
                )
            }
            Self::InvalidRigName {
                name,
                reason,
                suggestion,
            } => {
                write!(f, "invalid rig name '{name}': {reason}")?;
                if let Some(s) = suggestion {
                    write!(f, "\n  Try: {s}")?;
                }
                write!(
                    f,
                    "\n  Rig names are lowercase with underscores (agent ids use '-' as a field separator)."
                )
            }
            Self::InvalidBranchName { name, reason } => {
                write!(f, "invalid branch name '{name}': {reason}")
            }
            Self::PolecatNotFound { rig, name } => {
                write!(
                    f,
                    "polecat '{name}' not found in rig '{rig}'.\n  To fix: list polecat worktrees under {rig}/polecats/ or spawn one first."
                )
            }
            Self::SessionNotFound { session } => {
                write!(
                    f,
                    "session '{session}' not found.\n  To fix: check live sessions:\n    gt session list"
                )
            }
            Self::SessionReused { session } => {
                write!(f, "session '{session}' is healthy and was reused")
            }
            Self::IssueInvalid { id, reason } => {
                write!(
                    f,
                    "bead '{id}' rejected: {reason}.\n  To fix: pass an open, non-tombstoned bead id."
                )
            }
            Self::DatabaseNotFound { name } => {
                write!(
                    f,
                    "database '{name}' not found under .dolt-data/.\n  To fix: initialize it:\n    gt dolt init {name}\n  or run `gt doctor --fix` to repair."
                )
            }
            Self::ServerRunning { pid } => {
                write!(
                    f,
                    "the SQL server is already running (pid {pid}).\n  To fix: stop it first:\n    gt dolt down"
                )
            }
            Self::ServerNotRunning => {
                write!(
                    f,
                    "the SQL server is not running.\n  To fix: start it:\n    gt dolt up"
                )
            }
            Self::Subprocess {
                program,
                args,
                stdout,
                stderr,
                status,
            } => {
                write!(f, "`{program} {}` failed", args.join(" "))?;
                if let Some(code) = status.and_then(|s| s.code()) {
                    write!(f, " (exit code {code})")?;
                }
                if !stderr.is_empty() {
                    write!(f, "\n  stderr: {stderr}")?;
                }
                if stderr.is_empty() && !stdout.is_empty() {
                    write!(f, "\n  stdout: {}", stdout.trim())?;
                }
                Ok(())
            }
            Self::Corrupt { path, detail } => {
                write!(
                    f,
                    "corrupt state in '{}': {detail}\n  To fix: run `gt doctor --fix` to repair.",
                    path.display()
                )
            }
            Self::CircularRedirect { path } => {
                write!(
                    f,
                    "circular beads redirect under '{}' (removed).\n  The worktree now resolves to its own .beads directory.",
                    path.display()
                )
            }
            Self::RedirectTooDeep { start, max_hops } => {
                write!(
                    f,
                    "beads redirect chain from '{}' exceeds {max_hops} hops.\n  To fix: run `gt doctor --fix` to flatten redirects.",
                    start.display()
                )
            }
            Self::Io(err) => {
                write!(
                    f,
                    "I/O error: {err}\n  To fix: check file permissions and disk space."
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// std::error::Error
// ---------------------------------------------------------------------------

impl std::error::Error for TownError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// From impls
// ---------------------------------------------------------------------------

impl From<std::io::Error> for TownError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Shorthand result type used throughout the library.
pub type Result<T, E = TownError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn display_town_not_found() {
        let err = TownError::TownNotFound {
            start: PathBuf::from("/tmp/nowhere"),
        };
        let msg = format!("{err}");
        assert!(msg.contains("/tmp/nowhere"));
        assert!(msg.contains("mayor/town.json"));
    }

    #[test]
    fn display_rig_not_found() {
        let err = TownError::RigNotFound {
            name: "ghost".to_owned(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("ghost"));
        assert!(msg.contains("gt rig list"));
    }

    #[test]
    fn display_rig_exists() {
        let err = TownError::RigExists {
            name: "alpha".to_owned(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("already exists"));
        assert!(msg.contains("gt rig register alpha"));
    }

    #[test]
    fn display_invalid_rig_name_with_suggestion() {
        let err = TownError::InvalidRigName {
            name: "op-baby".to_owned(),
            reason: "contains '-'".to_owned(),
            suggestion: Some("op_baby".to_owned()),
        };
        let msg = format!("{err}");
        assert!(msg.contains("op-baby"));
        assert!(msg.contains("op_baby"));
        assert!(msg.contains("field separator"));
    }

    #[test]
    fn display_invalid_rig_name_without_suggestion() {
        let err = TownError::InvalidRigName {
            name: "hq".to_owned(),
            reason: "reserved".to_owned(),
            suggestion: None,
        };
        let msg = format!("{err}");
        assert!(msg.contains("reserved"));
        assert!(!msg.contains("Try:"));
    }

    #[test]
    fn display_session_reused_is_not_alarming() {
        let err = TownError::SessionReused {
            session: "gt-alpha-Toast".to_owned(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("gt-alpha-Toast"));
        assert!(msg.contains("reused"));
        assert!(!msg.contains("To fix"));
    }

    #[test]
    fn display_issue_invalid() {
        let err = TownError::IssueInvalid {
            id: "gt-ab3de".to_owned(),
            reason: "tombstoned".to_owned(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("gt-ab3de"));
        assert!(msg.contains("tombstoned"));
    }

    #[test]
    fn display_subprocess_includes_stderr() {
        let err = TownError::Subprocess {
            program: "git".to_owned(),
            args: vec!["merge".to_owned(), "topic".to_owned()],
            stdout: String::new(),
            stderr: "fatal: refusing to merge".to_owned(),
            status: None,
        };
        let msg = format!("{err}");
        assert!(msg.contains("git merge topic"));
        assert!(msg.contains("refusing to merge"));
    }

    #[test]
    fn display_subprocess_falls_back_to_stdout() {
        let err = TownError::Subprocess {
            program: "dolt".to_owned(),
            args: vec!["sql".to_owned()],
            stdout: "merge conflict detected".to_owned(),
            stderr: String::new(),
            status: None,
        };
        let msg = format!("{err}");
        assert!(msg.contains("merge conflict detected"));
    }

    #[test]
    fn subprocess_text_combines_streams() {
        let err = TownError::Subprocess {
            program: "dolt".to_owned(),
            args: vec![],
            stdout: "out".to_owned(),
            stderr: "err".to_owned(),
            status: None,
        };
        let text = err.subprocess_text().unwrap();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[test]
    fn display_circular_redirect() {
        let err = TownError::CircularRedirect {
            path: Path::new("/town/alpha/crew/max").to_path_buf(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("circular"));
        assert!(msg.contains("crew/max"));
    }

    #[test]
    fn display_redirect_too_deep() {
        let err = TownError::RedirectTooDeep {
            start: PathBuf::from("/town/w/.beads"),
            max_hops: 3,
        };
        let msg = format!("{err}");
        assert!(msg.contains("3 hops"));
        assert!(msg.contains("doctor --fix"));
    }

    #[test]
    fn display_corrupt_points_at_doctor() {
        let err = TownError::Corrupt {
            path: PathBuf::from("/town/.beads/routes.jsonl"),
            detail: "bad json".to_owned(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("routes.jsonl"));
        assert!(msg.contains("doctor --fix"));
    }

    #[test]
    fn error_source_io() {
        let err = TownError::Io(std::io::Error::other("disk full"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn error_source_non_io_is_none() {
        let err = TownError::ServerNotRunning;
        assert!(std::error::Error::source(&err).is_none());
    }
}
