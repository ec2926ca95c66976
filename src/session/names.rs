//! Session-id grammar.
//!
//! Rig-level agents: `gt-<rig>-<name>` (witness, refinery, polecats and
//! crew by their own names). Town singletons: `gt-<role>`. The name
//! portion must not itself start with the rig name; `gt-alpha-alpha-1`
//! is the double-prefix bug, logged as a warning but tolerated so
//! existing sessions keep working.

/// Session-id prefix for everything this tool creates.
pub const SESSION_PREFIX: &str = "gt";

/// Session id for a rig-level agent.
pub fn rig_session_id(rig: &str, name: &str) -> String {
    if name == rig || name.starts_with(&format!("{rig}-")) {
        tracing::warn!(
            rig,
            name,
            "double-prefixed session name; recreate the agent with `gt dog rm` / `gt dog add`"
        );
    }
    format!("{SESSION_PREFIX}-{rig}-{name}")
}

/// Session id for a town-level singleton role (mayor, deacon).
pub fn town_session_id(role: &str) -> String {
    format!("{SESSION_PREFIX}-{role}")
}

/// Split a session id into (rig, name) if it has rig-level shape.
pub fn parse_rig_session(session_id: &str) -> Option<(&str, &str)> {
    let rest = session_id.strip_prefix(&format!("{SESSION_PREFIX}-"))?;
    let (rig, name) = rest.split_once('-')?;
    if rig.is_empty() || name.is_empty() {
        return None;
    }
    Some((rig, name))
}

/// Whether a session id belongs to this tool at all.
pub fn is_ours(session_id: &str) -> bool {
    session_id.starts_with(&format!("{SESSION_PREFIX}-"))
}

/// Names handed to polecats spawned without one.
const POLECAT_NAMES: &[&str] = &[
    "nux", "toast", "dag", "slit", "ace", "rictus", "capable", "cheedo", "furiosa", "valkyrie",
    "morsov", "scrotus", "gutgash", "keeper", "dementus",
];

/// Generate a polecat name: a themed word plus a short numeric tag, so
/// collisions across spawns stay unlikely without any registry lookup.
pub fn random_polecat_name() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let word = POLECAT_NAMES[rng.random_range(0..POLECAT_NAMES.len())];
    format!("{word}{}", rng.random_range(10..100))
}
