//! Server health probes and read-only self-healing.
//!
//! The server degrades into read-only mode under concurrent write stress
//! and does not recover on its own; the only cure is a restart. The
//! probes here feed both `gt dolt status` and the doctor.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::{Result, TownError};
use crate::town::Town;

use super::retry;
use super::server::DoltServer;
use super::sql::DoltSql;

/// Fraction of the connection limit above which worker spawn is refused.
const CAPACITY_THRESHOLD: f64 = 0.8;

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// One snapshot of server health.
#[derive(Clone, Debug, Default)]
pub struct HealthReport {
    /// `SELECT 1` round-trip, when the server answered.
    pub latency: Option<Duration>,
    /// Live connection count from `information_schema.PROCESSLIST`.
    pub active_connections: Option<u32>,
    /// Total bytes under the data directory.
    pub disk_usage: u64,
    /// Whether the write probe hit read-only mode.
    pub read_only: bool,
    /// Rolled-up verdict.
    pub healthy: bool,
    /// Human-readable findings.
    pub warnings: Vec<String>,
}

/// Collect a health snapshot. Individual probe failures become warnings
/// rather than errors; health reporting must not itself fall over.
pub fn collect(town: &Town, server: &DoltServer) -> Result<HealthReport> {
    let mut report = HealthReport::default();

    if server.probe_running().is_none() {
        report.warnings.push("sql server is not running".to_owned());
        report.disk_usage = dir_size(&town.dolt_data_dir());
        return Ok(report);
    }
    if !server.is_reachable() {
        report
            .warnings
            .push("sql server process is alive but the port does not accept connections".to_owned());
    }

    let sql = DoltSql::new(town.dolt_data_dir());

    let started = Instant::now();
    match sql.query("SELECT 1;") {
        Ok(_) => report.latency = Some(started.elapsed()),
        Err(err) => report.warnings.push(format!("latency probe failed: {err}")),
    }

    match connection_count(&sql) {
        Ok(count) => report.active_connections = Some(count),
        Err(err) => report
            .warnings
            .push(format!("connection-count probe failed: {err}")),
    }

    report.disk_usage = dir_size(&town.dolt_data_dir());

    match probe_read_only(town) {
        Ok(read_only) => report.read_only = read_only,
        Err(err) => report
            .warnings
            .push(format!("read-only probe failed: {err}")),
    }
    if report.read_only {
        report
            .warnings
            .push("server is in read-only mode; restart required".to_owned());
    }

    report.healthy = report.warnings.is_empty() && !report.read_only;
    Ok(report)
}

/// Live connection count via the CSV-formatted PROCESSLIST query.
fn connection_count(sql: &DoltSql) -> Result<u32> {
    let out = sql.query_csv("SELECT COUNT(*) FROM information_schema.PROCESSLIST;")?;
    // CSV: header line, then the count.
    let value = out
        .lines()
        .nth(1)
        .map(str::trim)
        .unwrap_or_default()
        .parse::<u32>()
        .map_err(|_| TownError::Corrupt {
            path: std::path::PathBuf::from("information_schema.PROCESSLIST"),
            detail: format!("unexpected CSV output: {out:?}"),
        })?;
    Ok(value)
}

/// Attempt a tiny write in any database; a failure whose message matches
/// the read-only pattern means the server has degraded.
pub fn probe_read_only(town: &Town) -> Result<bool> {
    let Some(db) = super::list_databases(town)?.into_iter().next() else {
        return Ok(false);
    };
    let sql = DoltSql::new(town.dolt_data_dir());
    let script = format!(
        "USE `{db}`;\n\
         CREATE TABLE IF NOT EXISTS __probe(v INT PRIMARY KEY);\n\
         REPLACE INTO __probe VALUES(1);\n\
         DROP TABLE IF EXISTS __probe;\n"
    );
    match sql.script(&script) {
        Ok(_) => Ok(false),
        Err(err) if retry::is_read_only(&err) => Ok(true),
        Err(err) => Err(err),
    }
}

// ---------------------------------------------------------------------------
// Capacity gate
// ---------------------------------------------------------------------------

/// Fail-closed gate consulted before spawning more workers.
///
/// Allows when the live connection count is under 80% of the configured
/// maximum. Any probe failure refuses; spawning into a saturated or
/// unknown server is worse than waiting.
pub fn has_connection_capacity(town: &Town, server: &DoltServer) -> (bool, Option<u32>) {
    if server.probe_running().is_none() || !server.is_reachable() {
        return (false, None);
    }
    let sql = DoltSql::new(town.dolt_data_dir());
    match connection_count(&sql) {
        Ok(count) => {
            let limit = f64::from(server.config().effective_max_connections());
            let allowed = f64::from(count) < limit * CAPACITY_THRESHOLD;
            (allowed, Some(count))
        }
        Err(err) => {
            tracing::warn!(%err, "capacity probe failed; refusing spawn");
            (false, None)
        }
    }
}

// ---------------------------------------------------------------------------
// Read-only recovery
// ---------------------------------------------------------------------------

/// Restart the server out of read-only mode and verify it writes again.
///
/// Announce, stop, settle, start, then verify with exponential backoff:
/// attempts 1..=5, delays `500ms · 2^(n-1)` capped at 8 s. Failure after
/// the final attempt surfaces.
pub fn recover_read_only(town: &Town, server: &DoltServer) -> Result<()> {
    eprintln!("sql server is read-only; restarting it");
    tracing::warn!("sql server read-only; beginning restart recovery");

    server.stop()?;
    std::thread::sleep(Duration::from_secs(1));
    server.start()?;

    let policy = retry::RetryPolicy {
        attempts: 5,
        base: Duration::from_millis(500),
        cap: Duration::from_secs(8),
    };
    let mut last_err: Option<TownError> = None;
    for attempt in 1..=policy.attempts {
        match probe_read_only(town) {
            Ok(false) => {
                tracing::info!(attempt, "server writable again after restart");
                return Ok(());
            }
            Ok(true) => {
                last_err = Some(TownError::Subprocess {
                    program: "dolt".to_owned(),
                    args: vec!["sql".to_owned()],
                    stdout: String::new(),
                    stderr: "still read-only after restart".to_owned(),
                    status: None,
                });
            }
            Err(err) => last_err = Some(err),
        }
        if attempt < policy.attempts {
            std::thread::sleep(policy.delay(attempt));
        }
    }
    Err(last_err.unwrap_or(TownError::ServerNotRunning))
}

// ---------------------------------------------------------------------------
// Disk usage
// ---------------------------------------------------------------------------

/// Total size in bytes of all files under `dir`. Missing dir is 0.
fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            total += dir_size(&path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}
