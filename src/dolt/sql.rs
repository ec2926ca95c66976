//! `dolt sql` CLI adapter.
//!
//! Statements run through the dolt binary from inside the data directory,
//! which routes them to the running server. Every invocation carries a
//! deadline; a child that outlives it is killed and reported as a timeout
//! rather than hanging the orchestrator.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Result, TownError};

/// Deadline for a single statement.
pub const STATEMENT_TIMEOUT: Duration = Duration::from_secs(15);
/// Deadline for a multi-statement script.
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for the connection-count query.
pub const PROCESSLIST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// DoltSql
// ---------------------------------------------------------------------------

/// Handle for issuing SQL through the dolt CLI.
#[derive(Clone, Debug)]
pub struct DoltSql {
    /// Directory the CLI runs in (the data directory, or one database).
    cwd: PathBuf,
}

impl DoltSql {
    /// Adapter rooted at `cwd`.
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }

    /// Run `dolt sql -q <query>`.
    pub fn query(&self, query: &str) -> Result<String> {
        self.run(&["sql", "-q", query], STATEMENT_TIMEOUT)
    }

    /// Run `dolt sql -r csv -q <query>` for machine-readable output.
    pub fn query_csv(&self, query: &str) -> Result<String> {
        self.run(&["sql", "-r", "csv", "-q", query], PROCESSLIST_TIMEOUT)
    }

    /// Run a multi-statement script through `dolt sql --file`.
    ///
    /// The whole script executes on ONE connection, which is what makes
    /// `DOLT_CHECKOUT` meaningful: the checked-out branch is
    /// connection-local state.
    pub fn script(&self, statements: &str) -> Result<String> {
        let mut tmp = tempfile::Builder::new()
            .prefix("gt-sql-")
            .suffix(".sql")
            .tempfile()?;
        tmp.write_all(statements.as_bytes())?;
        tmp.flush()?;
        let path = tmp.path().to_string_lossy().into_owned();
        self.run(&["sql", "--file", path.as_str()], SCRIPT_TIMEOUT)
    }

    /// Run `dolt init` in `dir` (embedded initialization, server down).
    pub fn init_in(dir: &Path) -> Result<()> {
        let adapter = Self::new(dir);
        adapter.run(&["init"], STATEMENT_TIMEOUT)?;
        Ok(())
    }

    /// Run an arbitrary dolt invocation with a deadline.
    pub fn run(&self, args: &[&str], timeout: Duration) -> Result<String> {
        let mut child = Command::new("dolt")
            .args(args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(TownError::Io)?;

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait()? {
                Some(_) => break,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TownError::Subprocess {
                        program: "dolt".to_owned(),
                        args: args.iter().map(|s| (*s).to_owned()).collect(),
                        stdout: String::new(),
                        stderr: format!("timed out after {}s", timeout.as_secs()),
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
            Err(TownError::from_output("dolt", args, &output))
        }
    }
}
