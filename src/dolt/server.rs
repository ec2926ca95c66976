//! SQL-server process lifecycle.
//!
//! One `dolt sql-server` per town, serving every database under
//! `.dolt-data/` on a single port. PID, state, and log live under
//! `<town>/daemon/`. Starts are serialized by an advisory file lock so two
//! processes cannot race a double-start; stops work on servers this
//! coordinator did not start (the PID file or the port tells us who to
//! signal).

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use fs2::FileExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TownError};
use crate::town::{write_json_atomic, Town};

/// Default server port.
pub const DEFAULT_PORT: u16 = 3307;
/// Default maximum simultaneous connections.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 50;
/// The server binary's own default, used when configured as 0.
const SERVER_DEFAULT_MAX_CONNECTIONS: u32 = 1000;

// ---------------------------------------------------------------------------
// Config & state
// ---------------------------------------------------------------------------

/// Server configuration.
#[derive(Clone, Copy, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl ServerConfig {
    /// Effective connection limit: a configured 0 clamps to the server's
    /// own default rather than "no connections".
    pub fn effective_max_connections(&self) -> u32 {
        if self.max_connections == 0 {
            SERVER_DEFAULT_MAX_CONNECTIONS
        } else {
            self.max_connections
        }
    }
}

/// Persisted server state (`daemon/dolt-state.json`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerState {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    pub data_dir: String,
    #[serde(default)]
    pub databases: Vec<String>,
    /// Prior runs, newest last. Preserved across stop/start cycles.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ServerRunRecord>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One completed run in the state history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerRunRecord {
    pub pid: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    pub stopped_at: String,
}

// ---------------------------------------------------------------------------
// DoltServer
// ---------------------------------------------------------------------------

/// Coordinator handle for the town's SQL server.
#[derive(Clone, Debug)]
pub struct DoltServer {
    town: Town,
    config: ServerConfig,
}

impl DoltServer {
    pub fn new(town: Town, config: ServerConfig) -> Self {
        Self { town, config }
    }

    pub fn with_defaults(town: Town) -> Self {
        Self::new(town, ServerConfig::default())
    }

    pub fn config(&self) -> ServerConfig {
        self.config
    }

    fn pid_path(&self) -> PathBuf {
        self.town.daemon_dir().join("dolt.pid")
    }

    fn state_path(&self) -> PathBuf {
        self.town.daemon_dir().join("dolt-state.json")
    }

    fn log_path(&self) -> PathBuf {
        self.town.daemon_dir().join("dolt.log")
    }

    fn lock_path(&self) -> PathBuf {
        self.town.daemon_dir().join("dolt.lock")
    }

    // -- probes -------------------------------------------------------------

    /// PID from the pid file, if present and parsable.
    pub fn recorded_pid(&self) -> Option<i32> {
        let content = std::fs::read_to_string(self.pid_path()).ok()?;
        content.trim().parse().ok()
    }

    /// Whether the server is running.
    ///
    /// Primary: the recorded PID is alive AND its command line names both
    /// `dolt` and `sql-server` (a recycled PID fails this check). Fallback:
    /// any dolt sql-server process found listening on the port.
    pub fn probe_running(&self) -> Option<i32> {
        if let Some(pid) = self.recorded_pid() {
            if process_alive(pid) && cmdline_is_dolt_server(pid) {
                return Some(pid);
            }
        }
        self.find_listener_pid()
    }

    /// Locate a dolt sql-server process listening on our port, via lsof.
    fn find_listener_pid(&self) -> Option<i32> {
        let spec = format!("TCP:{}", self.config.port);
        let output = Command::new("lsof")
            .args(["-t", "-i", spec.as_str(), "-s", "TCP:LISTEN"])
            .stdin(Stdio::null())
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .find(|pid| cmdline_is_dolt_server(*pid))
    }

    /// Whether the server accepts TCP connections. Write paths must see
    /// this succeed before trusting "running"; a live PID whose socket is
    /// wedged is not a usable server.
    pub fn is_reachable(&self) -> bool {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.config.port));
        TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok()
    }

    // -- start --------------------------------------------------------------

    /// Start the server.
    ///
    /// Serialized by an exclusive advisory lock on `daemon/dolt.lock`.
    /// Refuses when a server is already running. Requires at least one
    /// valid database under the data directory.
    pub fn start(&self) -> Result<i32> {
        std::fs::create_dir_all(self.town.daemon_dir())?;
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;
        lock_file.lock_exclusive()?;
        let result = self.start_locked();
        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    fn start_locked(&self) -> Result<i32> {
        if let Some(pid) = self.probe_running() {
            return Err(TownError::ServerRunning { pid });
        }

        let data_dir = self.town.dolt_data_dir();
        std::fs::create_dir_all(&data_dir)?;
        let databases = super::list_databases(&self.town)?;
        if databases.is_empty() {
            return Err(TownError::DatabaseNotFound {
                name: "(any)".to_owned(),
            });
        }

        for db in &databases {
            clean_stale_lock_files(&super::database_dir(&self.town, db));
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        let log_err = log.try_clone()?;

        let port = self.config.port.to_string();
        let max_conns = self.config.effective_max_connections().to_string();
        let data_dir_str = data_dir.to_string_lossy().into_owned();
        let args = [
            "sql-server",
            "--port",
            port.as_str(),
            "--data-dir",
            data_dir_str.as_str(),
            "--max-connections",
            max_conns.as_str(),
        ];

        let child = Command::new("dolt")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(TownError::Io)?;
        let pid = i32::try_from(child.id()).unwrap_or(i32::MAX);

        std::fs::write(self.pid_path(), format!("{pid}\n"))?;
        self.persist_state(|state| {
            state.running = true;
            state.pid = Some(pid);
            state.port = self.config.port;
            state.started_at = Some(chrono::Utc::now().to_rfc3339());
            state.data_dir = data_dir_str.clone();
            state.databases = databases.clone();
        })?;

        // Give the server a beat, then confirm it survived startup.
        std::thread::sleep(Duration::from_millis(500));
        if !process_alive(pid) {
            self.persist_state(|state| {
                state.running = false;
                state.pid = None;
            })?;
            return Err(TownError::Subprocess {
                program: "dolt".to_owned(),
                args: args.iter().map(|s| (*s).to_owned()).collect(),
                stdout: String::new(),
                stderr: format!(
                    "server exited during startup; see {}",
                    self.log_path().display()
                ),
                status: None,
            });
        }
        tracing::info!(pid, port = self.config.port, "sql server started");
        Ok(pid)
    }

    // -- stop ---------------------------------------------------------------

    /// Stop the server: SIGTERM, poll up to ~5 s, SIGKILL if stubborn.
    ///
    /// Works for servers this coordinator did not start; any PID found by
    /// the running probe is fair game. No-op when nothing is running.
    pub fn stop(&self) -> Result<()> {
        let Some(pid) = self.probe_running() else {
            let _ = std::fs::remove_file(self.pid_path());
            return Ok(());
        };

        let target = Pid::from_raw(pid);
        let _ = kill(target, Signal::SIGTERM);
        let mut alive = true;
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(500));
            if !process_alive(pid) {
                alive = false;
                break;
            }
        }
        if alive {
            let _ = kill(target, Signal::SIGKILL);
        }

        let _ = std::fs::remove_file(self.pid_path());
        self.persist_state(|state| {
            let record = ServerRunRecord {
                pid,
                started_at: state.started_at.take(),
                stopped_at: chrono::Utc::now().to_rfc3339(),
            };
            state.history.push(record);
            state.running = false;
            state.pid = None;
        })?;
        tracing::info!(pid, "sql server stopped");
        Ok(())
    }

    // -- state --------------------------------------------------------------

    /// Read the persisted state; missing file yields a default.
    pub fn load_state(&self) -> ServerState {
        std::fs::read_to_string(self.state_path())
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    fn persist_state(&self, update: impl FnOnce(&mut ServerState)) -> Result<()> {
        let mut state = self.load_state();
        update(&mut state);
        write_json_atomic(&self.state_path(), &state)
    }
}

// ---------------------------------------------------------------------------
// Process helpers
// ---------------------------------------------------------------------------

/// Signal-0 liveness probe. EPERM means the process exists but belongs
/// to someone else; still alive.
pub fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether a PID's command line names both `dolt` and `sql-server`.
fn cmdline_is_dolt_server(pid: i32) -> bool {
    let pid_str = pid.to_string();
    let Ok(output) = Command::new("ps")
        .args(["-p", pid_str.as_str(), "-o", "args="])
        .stdin(Stdio::null())
        .output()
    else {
        return false;
    };
    if !output.status.success() {
        return false;
    }
    let args = String::from_utf8_lossy(&output.stdout);
    args.contains("dolt") && args.contains("sql-server")
}

/// Remove LOCK files with no live holder from a database directory.
///
/// A crashed server leaves `LOCK` files that wedge the next start. `lsof`
/// exit 1 with no output means nobody holds the file; only then is it
/// removed. When lsof cannot run at all the holder is unknown and the
/// file stays; never destroy evidence.
fn clean_stale_lock_files(db_dir: &std::path::Path) {
    let candidates = ["LOCK", "sql-server.lock"];
    let mut paths = Vec::new();
    for name in candidates {
        paths.push(db_dir.join(".dolt").join(name));
        paths.push(db_dir.join(".dolt").join("noms").join(name));
    }
    for path in paths {
        if !path.is_file() {
            continue;
        }
        let path_str = path.to_string_lossy().into_owned();
        let Ok(output) = Command::new("lsof")
            .arg(path_str.as_str())
            .stdin(Stdio::null())
            .output()
        else {
            tracing::debug!(path = %path.display(), "lsof unavailable; keeping LOCK file");
            continue;
        };
        let held = output.status.success() && !output.stdout.is_empty();
        if held {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::warn!(path = %path.display(), "removed stale LOCK file"),
            Err(err) => tracing::warn!(path = %path.display(), %err, "stale LOCK not removed"),
        }
    }
}
