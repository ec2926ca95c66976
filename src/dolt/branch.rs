//! Per-worker write branches.
//!
//! Concurrent polecats writing one database would contend on the server's
//! optimistic locks. Instead each polecat gets a branch of the database
//! and merges it back at work completion. The merge is two single-script
//! phases, each on ONE connection (`DOLT_CHECKOUT` is connection-local):
//! a happy path, and a conflict path that resolves `--theirs`; the
//! polecat's final state is the later authoritative mutation and always
//! wins.
//!
//! The branch is deleted only after a successful merge; a doubly-failed
//! merge preserves it for inspection.
//!
//! Known, accepted edge: the commit step flushes every pending change on
//! the target branch, not just this polecat's, because the SQL client
//! cannot attribute writes. Bead rows are keyed by unique id, so
//! duplicates across branches merge cleanly.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

use crate::error::{Result, TownError};

use super::retry::{self, SCRIPT_POLICY, STATEMENT_POLICY};
use super::sql::DoltSql;

/// Safe-identifier shape for database branch names.
fn safe_ident() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._/-]+$").expect("static regex"))
}

/// Branch name for a polecat: `polecat-<lowercase name>-<unix seconds>`.
pub fn polecat_branch_name(polecat: &str) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| TownError::Io(std::io::Error::other("clock before epoch")))?
        .as_secs();
    branch_name_at(polecat, now)
}

/// [`polecat_branch_name`] with the timestamp injected, for tests.
pub fn branch_name_at(polecat: &str, unix_seconds: u64) -> Result<String> {
    let name = format!("polecat-{}-{unix_seconds}", polecat.to_lowercase());
    validate_branch_name(&name)?;
    Ok(name)
}

/// Validate a branch name against the safe-identifier shape.
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TownError::InvalidBranchName {
            name: name.to_owned(),
            reason: "empty".to_owned(),
        });
    }
    if !safe_ident().is_match(name) {
        return Err(TownError::InvalidBranchName {
            name: name.to_owned(),
            reason: "allowed characters are A-Z a-z 0-9 . _ / -".to_owned(),
        });
    }
    Ok(())
}

/// Environment a polecat's agent process needs for branch-confined writes.
pub fn branch_env(branch: &str) -> Vec<(String, String)> {
    vec![
        ("BD_BRANCH".to_owned(), branch.to_owned()),
        ("BD_DOLT_AUTO_COMMIT".to_owned(), "off".to_owned()),
    ]
}

// ---------------------------------------------------------------------------
// Branch lifecycle
// ---------------------------------------------------------------------------

/// Create the polecat's branch in `db`, with retry and read-only recovery.
pub fn create_branch(
    sql: &DoltSql,
    db: &str,
    branch: &str,
    recover: impl FnOnce() -> Result<()>,
) -> Result<()> {
    validate_branch_name(branch)?;
    let statement = format!("USE `{db}`; CALL DOLT_BRANCH('{branch}');");
    retry::with_recovery(
        STATEMENT_POLICY,
        || sql.query(&statement).map(|_| ()),
        recover,
    )
}

/// Whether merge output reports a content conflict.
///
/// `Merge conflict` is a documented capability of the dolt binary's stable
/// output; this predicate is the only place it is matched.
pub fn is_merge_conflict(err: &TownError) -> bool {
    err.subprocess_text()
        .is_some_and(|text| text.contains("Merge conflict"))
}

/// Phase 1: commit the polecat branch's working set and merge it to main.
fn happy_path_script(db: &str, branch: &str) -> String {
    format!(
        "USE `{db}`;\n\
         CALL DOLT_CHECKOUT('{branch}');\n\
         CALL DOLT_ADD('-A');\n\
         CALL DOLT_COMMIT('--allow-empty', '-m', 'polecat {branch} final state');\n\
         CALL DOLT_CHECKOUT('main');\n\
         CALL DOLT_MERGE('{branch}');\n"
    )
}

/// Phase 2: redo the merge with autocommit off so conflicts stage instead
/// of rolling back, then resolve them in the branch's favor.
fn conflict_script(db: &str, branch: &str) -> String {
    format!(
        "USE `{db}`;\n\
         SET @@autocommit = 0;\n\
         CALL DOLT_CHECKOUT('main');\n\
         CALL DOLT_MERGE('{branch}');\n\
         CALL DOLT_CONFLICTS_RESOLVE('--theirs', '.');\n\
         CALL DOLT_COMMIT('-m', 'merge {branch} (conflicts auto-resolved)');\n\
         SET @@autocommit = 1;\n"
    )
}

/// Outcome of a polecat merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeResult {
    /// Phase 1 merged cleanly.
    Clean,
    /// Phase 1 conflicted; phase 2 resolved in the polecat's favor.
    ResolvedTheirs,
}

/// Merge a polecat's branch into `main` and delete it on success.
///
/// Both phases run as single `--file` scripts. Phase 2 runs only when
/// phase 1 failed with a content conflict; any other failure surfaces
/// as-is and the branch is preserved.
pub fn merge_polecat_branch(sql: &DoltSql, db: &str, branch: &str) -> Result<MergeResult> {
    validate_branch_name(branch)?;

    let phase1 = retry::with_retry(SCRIPT_POLICY, || sql.script(&happy_path_script(db, branch)));
    let result = match phase1 {
        Ok(_) => MergeResult::Clean,
        Err(err) if is_merge_conflict(&err) => {
            tracing::info!(db, branch, "merge conflict; resolving theirs");
            retry::with_retry(SCRIPT_POLICY, || sql.script(&conflict_script(db, branch)))?;
            MergeResult::ResolvedTheirs
        }
        Err(err) => return Err(err),
    };

    delete_branch(sql, db, branch)?;
    Ok(result)
}

/// Delete a polecat branch after its merge landed.
pub fn delete_branch(sql: &DoltSql, db: &str, branch: &str) -> Result<()> {
    let statement = format!("USE `{db}`; CALL DOLT_BRANCH('-D', '{branch}');");
    retry::with_retry(STATEMENT_POLICY, || sql.query(&statement).map(|_| ()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_shape() {
        let name = branch_name_at("Nux", 1_738_000_000).unwrap();
        assert_eq!(name, "polecat-nux-1738000000");
        // The canonical shape all engine-created branches satisfy.
        let shape = Regex::new(r"^polecat-[a-z0-9._-]+-\d+$").unwrap();
        assert!(shape.is_match(&name));
    }

    #[test]
    fn branch_name_rejects_unsafe_chars() {
        assert!(branch_name_at("nux;drop", 1).is_err());
        assert!(branch_name_at("nux space", 1).is_err());
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("ok/branch-1.2_x").is_ok());
    }

    #[test]
    fn branch_env_confines_writes() {
        let env = branch_env("polecat-nux-1");
        assert!(env.contains(&("BD_BRANCH".to_owned(), "polecat-nux-1".to_owned())));
        assert!(env.contains(&("BD_DOLT_AUTO_COMMIT".to_owned(), "off".to_owned())));
    }

    #[test]
    fn happy_script_is_one_connection_worth() {
        let script = happy_path_script("alpha", "polecat-nux-1");
        // Order matters: USE first, checkout branch, commit, checkout main,
        // merge. A crash between USE and CHECKOUT must leave main alone.
        let use_pos = script.find("USE `alpha`").unwrap();
        let co_branch = script.find("DOLT_CHECKOUT('polecat-nux-1')").unwrap();
        let commit = script.find("DOLT_COMMIT").unwrap();
        let co_main = script.find("DOLT_CHECKOUT('main')").unwrap();
        let merge = script.find("DOLT_MERGE('polecat-nux-1')").unwrap();
        assert!(use_pos < co_branch && co_branch < commit);
        assert!(commit < co_main && co_main < merge);
        assert!(script.contains("'--allow-empty'"));
    }

    #[test]
    fn conflict_script_disables_autocommit_and_resolves_theirs() {
        let script = conflict_script("alpha", "polecat-nux-1");
        let off = script.find("SET @@autocommit = 0").unwrap();
        let merge = script.find("DOLT_MERGE").unwrap();
        let resolve = script.find("DOLT_CONFLICTS_RESOLVE('--theirs', '.')").unwrap();
        let commit = script.find("DOLT_COMMIT").unwrap();
        let on = script.find("SET @@autocommit = 1").unwrap();
        assert!(off < merge && merge < resolve && resolve < commit && commit < on);
    }

    #[test]
    fn merge_conflict_predicate() {
        let conflict = TownError::Subprocess {
            program: "dolt".to_owned(),
            args: vec![],
            stdout: "error: Merge conflict in beads".to_owned(),
            stderr: String::new(),
            status: None,
        };
        assert!(is_merge_conflict(&conflict));
        let other = TownError::Subprocess {
            program: "dolt".to_owned(),
            args: vec![],
            stdout: String::new(),
            stderr: "syntax error".to_owned(),
            status: None,
        };
        assert!(!is_merge_conflict(&other));
        assert!(!is_merge_conflict(&TownError::ServerNotRunning));
    }
}
