//! Session lifecycle engine.
//!
//! Agents live in multiplexer sessions, one process per session. This
//! module classifies what already exists, starts agents with injected
//! environment and the startup-nudge fallback matrix, stops them with
//! descendant reaping, and dispatches nudges to the witness and refinery
//! when work moves.

pub mod mux;
pub mod names;
pub mod nudge;
pub mod start;
pub mod stop;

pub use mux::Mux;
pub use start::{
    classify, plan_startup, start_polecat, AgentProfile, SessionState, StartOptions,
    StartedSession, StartupBeacon, StartupPlan,
};
pub use stop::{reap_session, stop_session, StopOptions};
