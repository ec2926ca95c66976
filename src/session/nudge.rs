//! Debounced nudges into agent sessions.
//!
//! A nudge is literal text plus Enter, paced so that consecutive inputs
//! never overlap in the agent's input buffer: the Enter waits out a delay
//! proportional to the text size.
//!
//! Work dispatch: after spawning or dispatching into a rig, the witness
//! gets a nudge; after a merge-request bead is created, the refinery gets
//! its own. `GT_TEST_NO_NUDGE` suppresses delivery in tests;
//! `GT_TEST_NUDGE_LOG` appends every would-be nudge to a log file either
//! way, as the observability sink.

use std::io::Write;
use std::time::Duration;

use super::mux::Mux;
use super::names;

/// Base settle delay before confirming a nudge.
const BASE_DELAY: Duration = Duration::from_millis(200);
/// Additional delay per KiB of text.
const PER_KIB_DELAY: Duration = Duration::from_millis(100);
/// Upper bound on the settle delay.
const MAX_DELAY: Duration = Duration::from_millis(1500);

/// One planned nudge: text plus a pre-send delay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nudge {
    pub text: String,
    /// Waited before sending (e.g. hook-sync settling).
    pub delay: Duration,
}

/// Settle delay for a text of `len` bytes: base plus 100 ms per KiB,
/// capped at 1.5 s.
pub fn debounce_delay(len: usize) -> Duration {
    let kib = len / 1024;
    let delay = BASE_DELAY + PER_KIB_DELAY * u32::try_from(kib).unwrap_or(u32::MAX);
    delay.min(MAX_DELAY)
}

/// Deliver a nudge to a session, honoring the test sinks.
pub fn send_nudge(mux: &Mux, session_id: &str, nudge: &Nudge) {
    log_nudge(session_id, &nudge.text);
    if nudges_disabled() {
        return;
    }
    if !nudge.delay.is_zero() {
        std::thread::sleep(nudge.delay);
    }
    if mux.send_text(session_id, &nudge.text).is_err() {
        tracing::debug!(session = session_id, "nudge text not delivered");
        return;
    }
    std::thread::sleep(debounce_delay(nudge.text.len()));
    let _ = mux.send_enter(session_id);
}

/// Nudge the rig's witness after new work lands.
pub fn nudge_witness(mux: &Mux, rig: &str, message: &str) {
    let session = names::rig_session_id(rig, "witness");
    dispatch(mux, &session, message);
}

/// Nudge the rig's refinery after a merge-request bead is created.
pub fn nudge_refinery(mux: &Mux, rig: &str, message: &str) {
    let session = names::rig_session_id(rig, "refinery");
    dispatch(mux, &session, message);
}

fn dispatch(mux: &Mux, session_id: &str, message: &str) {
    if !mux.has_session(session_id) && !nudges_disabled() {
        tracing::debug!(session = session_id, "dispatch target session not running");
        return;
    }
    send_nudge(
        mux,
        session_id,
        &Nudge {
            text: message.to_owned(),
            delay: Duration::ZERO,
        },
    );
}

fn nudges_disabled() -> bool {
    std::env::var("GT_TEST_NO_NUDGE").is_ok_and(|v| !v.is_empty() && v != "0")
}

/// Append to the nudge observability sink when configured.
fn log_nudge(session_id: &str, text: &str) {
    let Ok(path) = std::env::var("GT_TEST_NUDGE_LOG") else {
        return;
    };
    if path.is_empty() {
        return;
    }
    let entry = format!("{session_id}\t{}\n", text.replace('\n', "\\n"));
    if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        let _ = file.write_all(entry.as_bytes());
    }
}
