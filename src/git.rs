//! Thin adapter over the `git` binary.
//!
//! Every operation is a subprocess invocation with constructed arguments;
//! no user-supplied string ever reaches a shell. Failures carry the full
//! captured record (args, stdout, stderr, status) and are NOT interpreted
//! here: error prose is data, not a contract. The two sanctioned
//! interpretations are the stable exit-code contract of `show-ref --verify`
//! (0 = exists, 1 = missing) and integer parsing of `rev-list --count`.
//! Everything else that looks like "understanding" git output goes through
//! porcelain flags (`--porcelain`, `--diff-filter=U`, `--raw`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Result, TownError};

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

/// Handle to a repository (or bare repo) for subprocess git operations.
///
/// `work_dir` is where commands run; `git_dir` is passed as `--git-dir` for
/// bare-repository operation. Either may be unset.
#[derive(Clone, Debug, Default)]
pub struct Git {
    work_dir: Option<PathBuf>,
    git_dir: Option<PathBuf>,
}

impl Git {
    /// Operate inside a working tree.
    pub fn in_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: Some(work_dir.into()),
            git_dir: None,
        }
    }

    /// Operate on a bare repository.
    pub fn bare(git_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: None,
            git_dir: Some(git_dir.into()),
        }
    }

    /// Operate in no particular directory (clone, ls-remote).
    pub fn detached() -> Self {
        Self::default()
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        if let Some(git_dir) = &self.git_dir {
            cmd.arg("--git-dir").arg(git_dir);
        }
        cmd.args(args);
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run git, capture output, error on non-zero exit.
    pub fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.command(args).output().map_err(TownError::Io)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(TownError::from_output("git", args, &output))
        }
    }

    /// Run git with extra environment variables set for the child.
    pub fn run_with_env(&self, args: &[&str], env: &[(&str, &str)]) -> Result<String> {
        let mut cmd = self.command(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        let output = cmd.output().map_err(TownError::Io)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(TownError::from_output("git", args, &output))
        }
    }

    // -- branches -----------------------------------------------------------

    /// Whether a local branch exists.
    ///
    /// `show-ref --verify` has a stable exit-code contract: 0 = ref exists,
    /// 1 = ref missing. Anything else is a real failure.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{branch}");
        let args = ["show-ref", "--verify", "--quiet", refname.as_str()];
        let output = self.command(&args).output().map_err(TownError::Io)?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(TownError::from_output("git", &args, &output)),
        }
    }

    /// Whether a remote-tracking branch `origin/<branch>` is known locally.
    pub fn remote_branch_exists(&self, branch: &str) -> Result<bool> {
        let refname = format!("refs/remotes/origin/{branch}");
        let args = ["show-ref", "--verify", "--quiet", refname.as_str()];
        let output = self.command(&args).output().map_err(TownError::Io)?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(TownError::from_output("git", &args, &output)),
        }
    }

    /// Create a branch at `start_point` (or HEAD).
    pub fn create_branch(&self, branch: &str, start_point: Option<&str>) -> Result<()> {
        match start_point {
            Some(start) => self.run(&["branch", branch, start])?,
            None => self.run(&["branch", branch])?,
        };
        Ok(())
    }

    /// Delete a branch. `force` uses `-D`; otherwise the safe `-d`, which
    /// refuses unmerged branches (the caller reports, never destroys).
    pub fn delete_branch(&self, branch: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run(&["branch", flag, branch])?;
        Ok(())
    }

    /// Current branch name, or `None` on a detached HEAD.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim();
        if name.is_empty() || name == "HEAD" {
            Ok(None)
        } else {
            Ok(Some(name.to_owned()))
        }
    }

    /// Number of commits in `range` (e.g. `"main..topic"`).
    ///
    /// Integer parsing of `rev-list --count` output is part of git's stable
    /// plumbing contract.
    pub fn rev_list_count(&self, range: &str) -> Result<u64> {
        let out = self.run(&["rev-list", "--count", range])?;
        out.trim().parse().map_err(|_| TownError::Corrupt {
            path: PathBuf::from(range),
            detail: format!("rev-list --count returned non-integer: {:?}", out.trim()),
        })
    }

    /// Hard-reset the working tree to `target`.
    pub fn reset_hard(&self, target: &str) -> Result<()> {
        self.run(&["reset", "--hard", target])?;
        Ok(())
    }

    // -- sync ---------------------------------------------------------------

    /// Fetch from origin.
    pub fn fetch(&self) -> Result<()> {
        self.run(&["fetch", "origin"])?;
        Ok(())
    }

    /// Push `refspec` to origin. `env` carries extra variables through to
    /// repo-local hooks (e.g. an integration-land signal).
    pub fn push(&self, refspec: &str, env: &[(&str, &str)]) -> Result<()> {
        self.run_with_env(&["push", "origin", refspec], env)?;
        Ok(())
    }

    /// Merge `branch` into the current branch.
    pub fn merge(&self, branch: &str, message: Option<&str>) -> Result<()> {
        match message {
            Some(msg) => self.run(&["merge", "--no-edit", "-m", msg, branch])?,
            None => self.run(&["merge", "--no-edit", branch])?,
        };
        Ok(())
    }

    /// Squash-merge `branch` into the current branch (leaves the result
    /// staged, not committed).
    pub fn merge_squash(&self, branch: &str) -> Result<()> {
        self.run(&["merge", "--squash", branch])?;
        Ok(())
    }

    /// Rebase the current branch onto `upstream`.
    pub fn rebase(&self, upstream: &str) -> Result<()> {
        self.run(&["rebase", upstream])?;
        Ok(())
    }

    /// Attempt a merge without committing; report conflicts via porcelain.
    ///
    /// On conflict the file list comes from `diff --name-only
    /// --diff-filter=U`; never from parsing the error text. Any merge in
    /// progress is aborted before returning, so the working tree is left
    /// the way it was found.
    pub fn try_merge(&self, branch: &str) -> Result<MergeOutcome> {
        let merge = self.run(&["merge", "--no-commit", "--no-ff", branch]);
        match merge {
            Ok(_) => {
                // --no-commit leaves the merge staged; back out.
                let _ = self.run(&["merge", "--abort"]);
                Ok(MergeOutcome::Clean)
            }
            Err(_) => {
                let conflicts = self
                    .run(&["diff", "--name-only", "--diff-filter=U"])
                    .map(|out| {
                        out.lines()
                            .filter(|l| !l.trim().is_empty())
                            .map(|l| PathBuf::from(l.trim()))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                let _ = self.run(&["merge", "--abort"]);
                Ok(MergeOutcome::Conflicts(conflicts))
            }
        }
    }

    /// Whether the working tree has uncommitted changes (staged, unstaged,
    /// or untracked).
    pub fn has_uncommitted_work(&self) -> Result<bool> {
        let out = self.run(&["status", "--porcelain"])?;
        Ok(!out.trim().is_empty())
    }

    // -- worktrees ----------------------------------------------------------

    /// Add a worktree at `path` on `branch`, creating the branch from
    /// `start_point` when it does not exist yet.
    pub fn worktree_add(&self, path: &Path, branch: &str, start_point: Option<&str>) -> Result<()> {
        let path_str = path.to_string_lossy();
        if self.branch_exists(branch)? {
            self.run(&["worktree", "add", path_str.as_ref(), branch])?;
        } else {
            let start = start_point.unwrap_or("HEAD");
            self.run(&["worktree", "add", "-b", branch, path_str.as_ref(), start])?;
        }
        Ok(())
    }

    /// Remove a worktree. Falls back to manual directory removal plus prune
    /// when git refuses (broken administrative state).
    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<()> {
        let path_str = path.to_string_lossy();
        let result = if force {
            self.run(&["worktree", "remove", "--force", path_str.as_ref()])
        } else {
            self.run(&["worktree", "remove", path_str.as_ref()])
        };
        if result.is_err() && force {
            if path.exists() {
                std::fs::remove_dir_all(path)?;
            }
            self.worktree_prune()?;
            return Ok(());
        }
        result.map(|_| ())
    }

    /// Prune stale worktree administrative entries.
    pub fn worktree_prune(&self) -> Result<()> {
        self.run(&["worktree", "prune"])?;
        Ok(())
    }

    /// Paths of all worktrees, from `worktree list --porcelain`.
    pub fn worktree_paths(&self) -> Result<Vec<PathBuf>> {
        let out = self.run(&["worktree", "list", "--porcelain"])?;
        Ok(out
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect())
    }

    // -- config & detection -------------------------------------------------

    /// Read a config value; `None` when unset (exit code 1 contract of
    /// `git config --get`).
    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let args = ["config", "--get", key];
        let output = self.command(&args).output().map_err(TownError::Io)?;
        match output.status.code() {
            Some(0) => Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_owned(),
            )),
            Some(1) => Ok(None),
            _ => Err(TownError::from_output("git", &args, &output)),
        }
    }

    /// Set a config value.
    pub fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.run(&["config", key, value])?;
        Ok(())
    }

    /// The default branch of the remote, from the symbolic
    /// `refs/remotes/origin/HEAD`, if the clone recorded one.
    pub fn remote_default_branch(&self) -> Option<String> {
        let out = self
            .run(&["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])
            .ok()?;
        out.trim().strip_prefix("origin/").map(str::to_owned)
    }

    /// The URL of `origin`, if configured.
    pub fn origin_url(&self) -> Result<Option<String>> {
        self.config_get("remote.origin.url")
    }

    /// Whether sparse checkout is enabled.
    pub fn sparse_checkout_enabled(&self) -> bool {
        matches!(
            self.config_get("core.sparseCheckout"),
            Ok(Some(v)) if v.eq_ignore_ascii_case("true")
        )
    }

    /// Disable sparse checkout, restoring a full working tree.
    pub fn sparse_checkout_disable(&self) -> Result<()> {
        self.run(&["sparse-checkout", "disable"])?;
        Ok(())
    }

    /// After a bare clone, worktrees cannot resolve `origin/<branch>`
    /// because the default refspec is missing. Install it and fetch.
    pub fn fix_bare_refspec(&self) -> Result<()> {
        self.config_set(
            "remote.origin.fetch",
            "+refs/heads/*:refs/remotes/origin/*",
        )?;
        self.fetch()
    }

    /// Whether the bare-clone refspec is present and correct.
    pub fn bare_refspec_ok(&self) -> bool {
        matches!(
            self.config_get("remote.origin.fetch"),
            Ok(Some(v)) if v == "+refs/heads/*:refs/remotes/origin/*"
        )
    }

    // -- stale-branch pruning -----------------------------------------------

    /// Delete local branches matching `pattern` that are either fully merged
    /// into `origin/<default_branch>` or gone from the remote.
    ///
    /// The safe delete flag is used throughout, so an unmerged branch with
    /// no remote counterpart is reported, not destroyed. With `dry_run`,
    /// nothing is deleted and the candidate list is returned.
    pub fn prune_stale_branches(
        &self,
        pattern: &str,
        default_branch: &str,
        dry_run: bool,
    ) -> Result<BranchPruneReport> {
        let glob = format!("refs/heads/{pattern}");
        let out = self.run(&["for-each-ref", "--format=%(refname:short)", glob.as_str()])?;
        let current = self.current_branch()?;

        let mut report = BranchPruneReport::default();
        for branch in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if branch == default_branch || Some(branch) == current.as_deref() {
                continue;
            }
            let merged = self
                .rev_list_count(&format!("origin/{default_branch}..{branch}"))
                .map(|n| n == 0)
                .unwrap_or(false);
            let on_remote = self.remote_branch_exists(branch)?;
            if !merged && on_remote {
                continue;
            }
            if dry_run {
                report.candidates.push(branch.to_owned());
                continue;
            }
            match self.delete_branch(branch, false) {
                Ok(()) => report.deleted.push(branch.to_owned()),
                Err(err) => {
                    tracing::warn!(branch, %err, "stale branch not deleted");
                    report.kept.push(branch.to_owned());
                }
            }
        }
        Ok(report)
    }

    // -- submodules ---------------------------------------------------------

    /// Submodule pointer changes between two commits.
    ///
    /// `diff --raw` lists gitlink entries with mode `160000`; all-zero SHAs
    /// mark a missing side (added or removed). URLs come from `.gitmodules`
    /// at `head_ref`, read with git's own config parser rather than ad-hoc
    /// text matching.
    pub fn submodule_changes(&self, from: &str, to: &str) -> Result<Vec<SubmoduleChange>> {
        let range = format!("{from}..{to}");
        let out = self.run(&["diff", "--raw", &range])?;

        let mut changes = Vec::new();
        for line in out.lines() {
            // :<old mode> <new mode> <old sha> <new sha> <status>\t<path>
            let Some(rest) = line.strip_prefix(':') else {
                continue;
            };
            let Some((meta, path)) = rest.split_once('\t') else {
                continue;
            };
            let parts: Vec<&str> = meta.split_whitespace().collect();
            if parts.len() < 4 {
                continue;
            }
            let (old_mode, new_mode) = (parts[0], parts[1]);
            if old_mode != "160000" && new_mode != "160000" {
                continue;
            }
            changes.push(SubmoduleChange {
                path: PathBuf::from(path),
                old_sha: strip_zero_sha(parts[2]),
                new_sha: strip_zero_sha(parts[3]),
                url: None,
            });
        }

        if changes.is_empty() {
            return Ok(changes);
        }

        let urls = self.gitmodules_urls(to).unwrap_or_default();
        for change in &mut changes {
            change.url = urls.get(&change.path).cloned();
        }
        Ok(changes)
    }

    /// Map of submodule path → URL from `.gitmodules` at `head_ref`.
    ///
    /// The file is materialized to a temp file and read back with
    /// `git config -f`, finding each section by its `path` entry.
    fn gitmodules_urls(&self, head_ref: &str) -> Result<BTreeMap<PathBuf, String>> {
        let spec = format!("{head_ref}:.gitmodules");
        let content = match self.run(&["show", spec.as_str()]) {
            Ok(c) => c,
            // No .gitmodules at that ref.
            Err(_) => return Ok(BTreeMap::new()),
        };

        let mut tmp = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(&mut tmp, content.as_bytes())?;
        let tmp_path = tmp.path().to_string_lossy().into_owned();

        let out = self.run(&[
            "config",
            "-f",
            tmp_path.as_str(),
            "--get-regexp",
            r"submodule\..*\.path",
        ])?;

        let mut urls = BTreeMap::new();
        for line in out.lines() {
            let Some((key, path)) = line.split_once(' ') else {
                continue;
            };
            let Some(name) = key
                .strip_prefix("submodule.")
                .and_then(|k| k.strip_suffix(".path"))
            else {
                continue;
            };
            let url_key = format!("submodule.{name}.url");
            if let Ok(url) = self.run(&["config", "-f", tmp_path.as_str(), "--get", &url_key]) {
                urls.insert(PathBuf::from(path.trim()), url.trim().to_owned());
            }
        }
        Ok(urls)
    }
}

fn strip_zero_sha(sha: &str) -> Option<String> {
    if sha.chars().all(|c| c == '0') {
        None
    } else {
        Some(sha.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Outcome of [`Git::try_merge`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The merge would apply cleanly.
    Clean,
    /// The merge conflicts in these files.
    Conflicts(Vec<PathBuf>),
}

/// Outcome of [`Git::prune_stale_branches`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BranchPruneReport {
    /// Branches that would be deleted (dry-run only).
    pub candidates: Vec<String>,
    /// Branches actually deleted.
    pub deleted: Vec<String>,
    /// Branches matching the pattern that the safe delete refused.
    pub kept: Vec<String>,
}

/// One submodule pointer change between two commits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmoduleChange {
    /// Path of the submodule in the superproject.
    pub path: PathBuf,
    /// Old gitlink SHA; `None` when the submodule was added.
    pub old_sha: Option<String>,
    /// New gitlink SHA; `None` when the submodule was removed.
    pub new_sha: Option<String>,
    /// URL from `.gitmodules` at the head ref, when present.
    pub url: Option<String>,
}

// ---------------------------------------------------------------------------
// Clone with isolation
// ---------------------------------------------------------------------------

/// How to clone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloneKind {
    /// Plain clone with a working tree.
    Normal,
    /// Bare clone (`--bare`), for the shared rig repository.
    Bare,
}

/// Clone `url` into `dest`.
///
/// The clone runs inside a private temporary directory with
/// `GIT_CEILING_DIRECTORIES` pointed at it, so the invoking process's own
/// git context (worktree, config discovery) cannot leak into the clone.
/// The finished repository is then moved into place atomically where the
/// filesystem allows.
///
/// `reference` enables `--reference ... --dissociate` acceleration; when
/// the reference clone fails, the caller is expected to retry without it.
pub fn clone_isolated(
    url: &str,
    dest: &Path,
    kind: CloneKind,
    reference: Option<&Path>,
) -> Result<()> {
    if dest.exists() {
        return Err(TownError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("clone destination exists: {}", dest.display()),
        )));
    }
    let parent = dest.parent().ok_or_else(|| {
        TownError::Io(std::io::Error::other("clone destination has no parent"))
    })?;
    std::fs::create_dir_all(parent)?;

    let staging = tempfile::Builder::new()
        .prefix(".gt-clone-")
        .tempdir_in(parent)?;
    let staged = staging.path().join("repo");
    let staged_str = staged.to_string_lossy().into_owned();

    let mut args: Vec<&str> = vec!["clone"];
    if kind == CloneKind::Bare {
        args.push("--bare");
    }
    let reference_str = reference.map(|p| p.to_string_lossy().into_owned());
    if let Some(r) = reference_str.as_deref() {
        args.push("--reference");
        args.push(r);
        args.push("--dissociate");
    }
    args.push(url);
    args.push(staged_str.as_str());

    let ceiling = staging.path().to_string_lossy().into_owned();
    let mut cmd = Command::new("git");
    cmd.args(&args)
        .current_dir(staging.path())
        .env("GIT_CEILING_DIRECTORIES", &ceiling);
    let output = cmd.output().map_err(TownError::Io)?;
    if !output.status.success() {
        return Err(TownError::from_output("git", &args, &output));
    }

    move_dir(&staged, dest)?;

    if kind == CloneKind::Bare {
        Git::bare(dest).fix_bare_refspec()?;
    }
    Ok(())
}

/// Clone preferring `--reference` acceleration, falling back to a plain
/// clone when the reference attempt fails.
pub fn clone_with_fallback(
    url: &str,
    dest: &Path,
    kind: CloneKind,
    reference: Option<&Path>,
) -> Result<()> {
    if let Some(local) = reference {
        match clone_isolated(url, dest, kind, Some(local)) {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::warn!(%err, "reference clone failed; retrying plain");
                if dest.exists() {
                    std::fs::remove_dir_all(dest)?;
                }
            }
        }
    }
    clone_isolated(url, dest, kind, None)
}

// ---------------------------------------------------------------------------
// Cross-filesystem move
// ---------------------------------------------------------------------------

/// Move a directory, surviving filesystem boundaries.
///
/// Tries `rename` first; on `EXDEV` (or any rename failure with the source
/// still present) falls back to a recursive platform copy plus delete:
/// `cp -a` on POSIX, `robocopy /E /MOVE` on Windows (exit codes 0–7 are
/// success by robocopy's contract).
pub fn move_dir(src: &Path, dest: &Path) -> Result<()> {
    match std::fs::rename(src, dest) {
        Ok(()) => return Ok(()),
        Err(err) => {
            tracing::debug!(%err, "rename failed; falling back to copy+delete");
        }
    }

    #[cfg(unix)]
    {
        let src_s = src.to_string_lossy().into_owned();
        let dest_s = dest.to_string_lossy().into_owned();
        let args = ["-a", src_s.as_str(), dest_s.as_str()];
        let output = Command::new("cp")
            .args(args)
            .output()
            .map_err(TownError::Io)?;
        if !output.status.success() {
            return Err(TownError::from_output("cp", &args, &output));
        }
    }

    #[cfg(windows)]
    {
        let src_s = src.to_string_lossy().into_owned();
        let dest_s = dest.to_string_lossy().into_owned();
        let args = [
            src_s.as_str(),
            dest_s.as_str(),
            "/E",
            "/MOVE",
            "/R:1",
            "/W:1",
        ];
        let output = Command::new("robocopy")
            .args(args)
            .output()
            .map_err(TownError::Io)?;
        // Robocopy exit codes 0-7 indicate success.
        if output.status.code().is_none_or(|c| c > 7) {
            return Err(TownError::from_output("robocopy", &args, &output));
        }
    }

    if src.exists() {
        std::fs::remove_dir_all(src)?;
    }
    Ok(())
}

/// Convert an HTTPS git URL to SSH form, for auth-failure suggestions.
pub fn https_to_ssh_url(url: &str) -> Option<String> {
    let rest = url.strip_prefix("https://")?;
    let (host, path) = rest.split_once('/')?;
    Some(format!("git@{host}:{path}"))
}

// ---------------------------------------------------------------------------
// Tests (skipped gracefully when git is unavailable)
// ---------------------------------------------------------------------------
