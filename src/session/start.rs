//! Session start: classification, environment injection, and the
//! startup-nudge fallback matrix.
//!
//! Starting an agent is mostly deciding what to do about the session that
//! may already exist. Classification produces one of six states and a
//! single transition table acts on it; the checks never interleave with
//! the actions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bd::BeadsCli;
use crate::dolt::server::process_alive;
use crate::error::{Result, TownError};
use crate::git::Git;
use crate::routes;
use crate::town::Town;

use super::mux::Mux;
use super::names;
use super::nudge::{self, Nudge};

/// Commands that mean "still a shell, agent not yet running".
const KNOWN_SHELLS: &[&str] = &["bash", "zsh", "sh", "fish", "dash", "ksh"];

// ---------------------------------------------------------------------------
// Agent profile
// ---------------------------------------------------------------------------

/// Capabilities and identity of the configured agent program.
#[derive(Clone, Debug)]
pub struct AgentProfile {
    /// Display name of the agent program.
    pub name: String,
    /// The command line that starts the agent.
    pub command: String,
    /// Process names that count as "the agent is running" in a pane.
    pub process_names: Vec<String>,
    /// Whether the agent fires session hooks (work arrives by itself).
    pub supports_hooks: bool,
    /// Whether the agent accepts an initial prompt argument on its CLI.
    pub supports_cli_prompt: bool,
    /// How long to wait for the pane to leave the shell.
    pub start_timeout: Duration,
    /// Settling time for hook-based delivery before nudging.
    pub hook_sync_delay: Duration,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            name: "claude".to_owned(),
            command: "claude".to_owned(),
            process_names: vec!["claude".to_owned(), "node".to_owned()],
            supports_hooks: true,
            supports_cli_prompt: true,
            start_timeout: Duration::from_secs(30),
            hook_sync_delay: Duration::from_secs(2),
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// What an existing (or absent) session turned out to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No session with this id.
    Fresh,
    /// Session exists but its root pane process is dead.
    Stale,
    /// Session alive, but the work dir is not a git worktree anymore.
    Zombie,
    /// Session alive, worktree fine, but no valid pane.
    Broken,
    /// Pane alive, but no configured agent process is running in it.
    DeadAgent,
    /// Everything checks out; adopt instead of recreating.
    Reusable,
}

impl SessionState {
    /// Whether the transition table kills this session before creating.
    pub fn needs_replacement(self) -> bool {
        matches!(
            self,
            Self::Stale | Self::Zombie | Self::Broken | Self::DeadAgent
        )
    }
}

/// Classify the session with id `session_id` against its work dir and the
/// configured agent.
pub fn classify(
    mux: &Mux,
    session_id: &str,
    work_dir: &Path,
    profile: &AgentProfile,
) -> SessionState {
    if !mux.has_session(session_id) {
        return SessionState::Fresh;
    }
    let pane_pid = mux.pane_pid(session_id);
    if let Some(pid) = pane_pid {
        if !process_alive(pid) {
            return SessionState::Stale;
        }
    }
    if !work_dir.join(".git").exists() {
        return SessionState::Zombie;
    }
    if pane_pid.is_none() {
        return SessionState::Broken;
    }
    let current = mux.pane_current_command(session_id).unwrap_or_default();
    let agent_running = profile
        .process_names
        .iter()
        .any(|name| current.contains(name.as_str()));
    if !agent_running {
        return SessionState::DeadAgent;
    }
    SessionState::Reusable
}

// ---------------------------------------------------------------------------
// Startup beacon
// ---------------------------------------------------------------------------

/// The structured text posted to an agent at start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartupBeacon {
    pub recipient: String,
    pub sender: String,
    pub topic: String,
    pub attached_molecule: Option<String>,
}

impl std::fmt::Display for StartupBeacon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[beacon] to: {} | from: {} | topic: {}",
            self.recipient, self.sender, self.topic
        )?;
        if let Some(molecule) = &self.attached_molecule {
            write!(f, " | molecule: {molecule}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Nudge fallback matrix
// ---------------------------------------------------------------------------

/// How beacon and work text reach the agent, by capability.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartupPlan {
    /// Prompt passed on the agent's command line, when supported.
    pub cli_prompt: Option<String>,
    /// Nudges sent after the agent is ready, in order.
    pub nudges: Vec<Nudge>,
}

/// Decide beacon/work delivery for the agent's capabilities.
pub fn plan_startup(
    profile: &AgentProfile,
    beacon: &StartupBeacon,
    work_text: Option<&str>,
) -> StartupPlan {
    let beacon_text = beacon.to_string();
    match (profile.supports_hooks, profile.supports_cli_prompt) {
        // Hooks deliver the work; beacon rides the command line.
        (true, true) => StartupPlan {
            cli_prompt: Some(beacon_text),
            nudges: Vec::new(),
        },
        // One combined nudge after the hook layer settles.
        (true, false) => {
            let text = match work_text {
                Some(work) => format!("{beacon_text}\n{work}"),
                None => beacon_text,
            };
            StartupPlan {
                cli_prompt: None,
                nudges: vec![Nudge {
                    text,
                    delay: profile.hook_sync_delay,
                }],
            }
        }
        // Beacon on the CLI; work as a delayed nudge.
        (false, true) => StartupPlan {
            cli_prompt: Some(beacon_text),
            nudges: work_text
                .map(|work| {
                    vec![Nudge {
                        text: work.to_owned(),
                        delay: profile.hook_sync_delay,
                    }]
                })
                .unwrap_or_default(),
        },
        // Everything by nudge: beacon first, work after a delay.
        (false, false) => {
            let mut nudges = vec![Nudge {
                text: beacon_text,
                delay: Duration::ZERO,
            }];
            if let Some(work) = work_text {
                nudges.push(Nudge {
                    text: work.to_owned(),
                    delay: profile.hook_sync_delay,
                });
            }
            StartupPlan {
                cli_prompt: None,
                nudges,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

/// Options for [`start_polecat`].
#[derive(Clone, Debug, Default)]
pub struct StartOptions {
    /// Bead to hook on start. Validated before any multiplexer work; a
    /// bad id handed to a running agent produces a CPU-spinning retry
    /// loop, so it must never get that far.
    pub issue: Option<String>,
    /// Explicit work dir override.
    pub work_dir: Option<PathBuf>,
    /// Database branch for branch-per-polecat writes.
    pub db_branch: Option<String>,
    /// Work text delivered per the nudge matrix.
    pub work_text: Option<String>,
    /// Molecule bonded to the work, named in the startup beacon.
    pub molecule: Option<String>,
}

/// Outcome of a successful (non-reused) start.
#[derive(Clone, Debug)]
pub struct StartedSession {
    pub session_id: String,
    pub work_dir: PathBuf,
    pub pane_pid: Option<i32>,
}

/// Start (or adopt) the session for a polecat.
///
/// Returns [`TownError::SessionReused`] when a healthy session was
/// adopted; the caller distinguishes that from a fresh start.
pub fn start_polecat(
    town: &Town,
    mux: &Mux,
    profile: &AgentProfile,
    rig: &str,
    polecat: &str,
    opts: &StartOptions,
) -> Result<StartedSession> {
    let polecat_dir = town.rig_dir(rig).join("polecats").join(polecat);
    if !polecat_dir.is_dir() {
        return Err(TownError::PolecatNotFound {
            rig: rig.to_owned(),
            name: polecat.to_owned(),
        });
    }

    let work_dir = resolve_work_dir(&polecat_dir, rig, opts.work_dir.as_deref());
    let session_id = names::rig_session_id(rig, polecat);

    let state = classify(mux, &session_id, &work_dir, profile);
    tracing::debug!(session = session_id, ?state, "session classified");
    match state {
        SessionState::Reusable => {
            if let Some(issue) = &opts.issue {
                hook_issue(town, issue, &session_id, &work_dir);
            }
            return Err(TownError::SessionReused {
                session: session_id,
            });
        }
        state if state.needs_replacement() => {
            tracing::info!(session = session_id, ?state, "replacing unhealthy session");
            super::stop::reap_session(mux, &session_id);
        }
        _ => {}
    }

    // Validate the issue BEFORE creating anything.
    if let Some(issue) = &opts.issue {
        let beads_dir = routes::resolve_hook_dir(town, issue, &work_dir);
        BeadsCli::in_dir(&beads_dir).validate_issue(issue)?;
    }

    crate::rig::hooks::ensure_role_settings(
        &town.rig_dir(rig).join("settings"),
        "polecat",
    )?;

    let beacon = StartupBeacon {
        recipient: format!("{rig}/{polecat}"),
        sender: "mayor".to_owned(),
        topic: opts
            .issue
            .clone()
            .unwrap_or_else(|| "standing by for work".to_owned()),
        attached_molecule: opts.molecule.clone(),
    };
    log_attached_molecule(&session_id, opts.molecule.as_deref());
    let plan = plan_startup(profile, &beacon, opts.work_text.as_deref());

    let env = agent_env(rig, polecat, &work_dir, opts.db_branch.as_deref());
    let command = build_agent_command(profile, &env, plan.cli_prompt.as_deref());

    mux.new_session(&session_id, &work_dir, &command)?;
    // Session-level env too, so respawned panes inherit it.
    for (key, value) in &env {
        let _ = mux.set_env(&session_id, key, value);
    }

    wait_for_agent(mux, &session_id, profile);
    accept_bypass_dialog(mux, &session_id);

    for planned in &plan.nudges {
        nudge::send_nudge(mux, &session_id, planned);
    }

    if !mux.has_session(&session_id) {
        return Err(TownError::SessionNotFound {
            session: session_id,
        });
    }

    if let Some(issue) = &opts.issue {
        hook_issue(town, issue, &session_id, &work_dir);
    }

    let pane_pid = mux.pane_pid(&session_id);
    track_session_pid(town, &session_id, pane_pid)?;

    Ok(StartedSession {
        session_id,
        work_dir,
        pane_pid,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The conventional work dir: `<rig>/polecats/<name>/<rig>/`, falling back
/// to the legacy flat layout only when that directory is itself a git
/// worktree.
pub fn resolve_work_dir(polecat_dir: &Path, rig: &str, explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    let nested = polecat_dir.join(rig);
    if nested.is_dir() {
        return nested;
    }
    if polecat_dir.join(".git").exists() {
        return polecat_dir.to_path_buf();
    }
    nested
}

/// Environment injected into the agent session.
fn agent_env(
    rig: &str,
    polecat: &str,
    work_dir: &Path,
    db_branch: Option<&str>,
) -> Vec<(String, String)> {
    let agent_id = names::rig_session_id(rig, polecat);
    let mut env = vec![
        ("GT_RIG".to_owned(), rig.to_owned()),
        ("GT_POLECAT".to_owned(), polecat.to_owned()),
        (
            "GT_ROLE".to_owned(),
            format!("{rig}/polecats/{polecat}"),
        ),
        (
            "GT_POLECAT_PATH".to_owned(),
            work_dir.to_string_lossy().into_owned(),
        ),
        ("GT_AGENT".to_owned(), agent_id.clone()),
        ("BD_ACTOR".to_owned(), agent_id),
        ("GIT_AUTHOR_NAME".to_owned(), polecat.to_owned()),
    ];
    if let Ok(Some(branch)) = Git::in_dir(work_dir).current_branch() {
        env.push(("GT_BRANCH".to_owned(), branch));
    }
    if let Some(branch) = db_branch {
        for pair in crate::dolt::branch::branch_env(branch) {
            env.push(pair);
        }
    }
    env
}

/// The agent command with `export`-prefixed environment.
///
/// Env goes through the shell (`export K=V && cmd`), not only through the
/// multiplexer's own environment: exported vars survive agent respawns in
/// the same pane, `set-environment` only reaches new panes.
fn build_agent_command(
    profile: &AgentProfile,
    env: &[(String, String)],
    cli_prompt: Option<&str>,
) -> String {
    let mut command = String::from("export");
    for (key, value) in env {
        command.push(' ');
        command.push_str(key);
        command.push('=');
        command.push_str(&shell_quote(value));
    }
    command.push_str(" && ");
    command.push_str(&profile.command);
    if let Some(prompt) = cli_prompt {
        command.push(' ');
        command.push_str(&shell_quote(prompt));
    }
    command
}

/// Single-quote a value for POSIX shells.
fn shell_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Poll until the pane is no longer running a bare shell, bounded by the
/// profile's start timeout.
fn wait_for_agent(mux: &Mux, session_id: &str, profile: &AgentProfile) {
    let deadline = std::time::Instant::now() + profile.start_timeout;
    while std::time::Instant::now() < deadline {
        match mux.pane_current_command(session_id) {
            Some(cmd) if !KNOWN_SHELLS.contains(&cmd.as_str()) => return,
            None => return,
            _ => std::thread::sleep(Duration::from_millis(200)),
        }
    }
    tracing::debug!(session = session_id, "agent did not leave the shell before timeout");
}

/// Accept a permissions warning dialog if the agent shows one.
fn accept_bypass_dialog(mux: &Mux, session_id: &str) {
    let Ok(pane) = mux.capture_pane(session_id) else {
        return;
    };
    if pane.to_lowercase().contains("bypass permissions") {
        tracing::debug!(session = session_id, "accepting bypass-permissions dialog");
        let _ = mux.send_enter(session_id);
    }
}

/// Hook a bead to an agent. Failure is logged, never fatal: the agent is
/// already running and a human can hook by hand.
fn hook_issue(town: &Town, issue_id: &str, agent_id: &str, work_dir: &Path) {
    let beads_dir = routes::resolve_hook_dir(town, issue_id, work_dir);
    if let Err(err) = BeadsCli::in_dir(&beads_dir).hook_issue(issue_id, agent_id) {
        tracing::warn!(issue = issue_id, agent = agent_id, %err, "bead hook failed");
    }
}

/// Test observability sink: record which molecule a session was started
/// with when `GT_TEST_ATTACHED_MOLECULE_LOG` names a file.
fn log_attached_molecule(session_id: &str, molecule: Option<&str>) {
    let Some(molecule) = molecule else { return };
    let Ok(path) = std::env::var("GT_TEST_ATTACHED_MOLECULE_LOG") else {
        return;
    };
    if path.is_empty() {
        return;
    }
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    {
        use std::io::Write;
        let _ = writeln!(file, "{session_id}\t{molecule}");
    }
}

/// Record the session's pane PID for orphan cleanup defense-in-depth.
fn track_session_pid(town: &Town, session_id: &str, pane_pid: Option<i32>) -> Result<()> {
    let dir = town.daemon_dir().join("sessions");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{session_id}.pid"));
    match pane_pid {
        Some(pid) => std::fs::write(&path, format!("{pid}\n"))?,
        None => {
            let _ = std::fs::remove_file(&path);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
