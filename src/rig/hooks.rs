//! Hook-settings scaffolding and layered merge.
//!
//! Agent hook settings are JSON files holding, per event type, an ordered
//! list of `{matcher, hooks: [command, ...]}` entries. A role's effective
//! settings are the base file merged with role and rig/role overrides.
//!
//! Merge semantics, per event type:
//! - override entry with a matcher present in base → replaces that entry
//!   entirely, in place;
//! - override entry with a new matcher → appended after the base entries;
//! - override entry with an EMPTY hook list → explicit disable, the base
//!   entry is removed;
//! - event types absent from the override are preserved from base.
//!
//! Top-level fields outside the managed event types ride through merges
//! and rewrites untouched.

use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use crate::error::{Result, TownError};

/// Event types the merge manages. Anything else in the file is opaque.
pub const MANAGED_EVENTS: &[&str] = &[
    "PreToolUse",
    "PostToolUse",
    "SessionStart",
    "Stop",
    "PreCompact",
    "UserPromptSubmit",
];

/// Merge `override_v` onto `base`, returning the effective settings.
pub fn merge_hook_settings(base: &Value, override_v: &Value) -> Value {
    let base_map = base.as_object().cloned().unwrap_or_default();
    let override_map = override_v.as_object().cloned().unwrap_or_default();
    let mut out = base_map.clone();

    for event in MANAGED_EVENTS {
        let Some(override_entries) = override_map.get(*event).and_then(Value::as_array) else {
            continue;
        };
        let mut entries: Vec<Value> = base_map
            .get(*event)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for override_entry in override_entries {
            let matcher = override_entry.get("matcher").cloned().unwrap_or(Value::Null);
            let hooks_empty = override_entry
                .get("hooks")
                .and_then(Value::as_array)
                .is_some_and(Vec::is_empty);
            let position = entries
                .iter()
                .position(|e| e.get("matcher") == Some(&matcher));

            match (position, hooks_empty) {
                (Some(i), true) => {
                    entries.remove(i);
                }
                (Some(i), false) => {
                    entries[i] = override_entry.clone();
                }
                (None, true) => {}
                (None, false) => entries.push(override_entry.clone()),
            }
        }
        out.insert((*event).to_owned(), Value::Array(entries));
    }

    // Unmanaged top-level fields from the override win over base's copy.
    for (key, value) in override_map {
        if !MANAGED_EVENTS.contains(&key.as_str()) {
            out.insert(key, value);
        }
    }
    Value::Object(out)
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// Read a settings file; a missing file is an empty object.
pub fn load_settings(path: &Path) -> Result<Value> {
    if !path.is_file() {
        return Ok(json!({}));
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| TownError::Corrupt {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// Write a settings file atomically.
pub fn save_settings(path: &Path, settings: &Value) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    crate::town::write_json_atomic(path, settings)
}

/// Path of a role's settings file inside a settings directory.
pub fn role_settings_path(settings_dir: &Path, role: &str) -> PathBuf {
    settings_dir.join(format!("{role}.json"))
}

/// Scaffold a role's settings file if absent. Returns `true` when the
/// file was created.
pub fn ensure_role_settings(settings_dir: &Path, role: &str) -> Result<bool> {
    let path = role_settings_path(settings_dir, role);
    if path.is_file() {
        return Ok(false);
    }
    save_settings(&path, &default_role_settings(role))?;
    Ok(true)
}

/// Default settings for a role: a session-start hook that syncs the
/// agent's hook bead, and an empty tool-use matcher list for overrides to
/// fill in.
fn default_role_settings(role: &str) -> Value {
    json!({
        "SessionStart": [
            { "matcher": "*", "hooks": [format!("gt hook sync --role {role}")] }
        ],
        "PreToolUse": [],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base() -> Value {
        json!({
            "PreToolUse": [
                { "matcher": "Bash", "hooks": ["gt guard bash"] },
                { "matcher": "Edit", "hooks": ["gt guard edit"] },
            ],
            "Stop": [
                { "matcher": "*", "hooks": ["gt session on-stop"] }
            ],
            "custom_field": { "theme": "rust" },
        })
    }

    #[test]
    fn same_matcher_replaces_entry() {
        let override_v = json!({
            "PreToolUse": [
                { "matcher": "Bash", "hooks": ["gt guard bash --strict"] }
            ]
        });
        let merged = merge_hook_settings(&base(), &override_v);
        let entries = merged["PreToolUse"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["hooks"][0], "gt guard bash --strict");
        assert_eq!(entries[1]["matcher"], "Edit");
    }

    #[test]
    fn new_matcher_appends_after_base() {
        let override_v = json!({
            "PreToolUse": [
                { "matcher": "Write", "hooks": ["gt guard write"] }
            ]
        });
        let merged = merge_hook_settings(&base(), &override_v);
        let entries = merged["PreToolUse"].as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2]["matcher"], "Write");
    }

    #[test]
    fn empty_hooks_disables_entry() {
        let override_v = json!({
            "PreToolUse": [
                { "matcher": "Edit", "hooks": [] }
            ]
        });
        let merged = merge_hook_settings(&base(), &override_v);
        let entries = merged["PreToolUse"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["matcher"], "Bash");
    }

    #[test]
    fn disable_of_unknown_matcher_is_noop() {
        let override_v = json!({
            "PreToolUse": [
                { "matcher": "Ghost", "hooks": [] }
            ]
        });
        let merged = merge_hook_settings(&base(), &override_v);
        assert_eq!(merged["PreToolUse"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn absent_event_types_preserved() {
        let override_v = json!({
            "PreToolUse": [
                { "matcher": "Bash", "hooks": ["x"] }
            ]
        });
        let merged = merge_hook_settings(&base(), &override_v);
        assert_eq!(merged["Stop"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn unknown_top_level_fields_survive() {
        let merged = merge_hook_settings(&base(), &json!({}));
        assert_eq!(merged["custom_field"]["theme"], "rust");
    }

    #[test]
    fn settings_file_roundtrip_preserves_unknown_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"PreToolUse":[],"vendor_extension":{"x":1}}"#,
        )
        .unwrap();

        let loaded = load_settings(&path).unwrap();
        save_settings(&path, &loaded).unwrap();
        let reread = load_settings(&path).unwrap();
        assert_eq!(reread["vendor_extension"]["x"], 1);
    }

    #[test]
    fn ensure_role_settings_scaffolds_once() {
        let dir = TempDir::new().unwrap();
        assert!(ensure_role_settings(dir.path(), "polecat").unwrap());
        let path = role_settings_path(dir.path(), "polecat");
        assert!(path.is_file());
        let value = load_settings(&path).unwrap();
        assert!(value["SessionStart"][0]["hooks"][0]
            .as_str()
            .unwrap()
            .contains("polecat"));
        assert!(!ensure_role_settings(dir.path(), "polecat").unwrap());
    }
}
