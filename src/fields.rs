//! Structured `key: value` fields embedded in bead descriptions.
//!
//! A bead's description is free-form text; the orchestrator threads state
//! through it as `key: value` lines. Keys are matched case-insensitively
//! across snake, kebab, and camel spellings (`convoy_id`, `convoy-id`,
//! `convoyId` all hit the same field) and always written back in canonical
//! snake_case. Lines the codec does not recognize pass through untouched.
//!
//! Each field family (merge-request, attachment, synthesis, role-config,
//! agent) provides the same three operations:
//!
//! - `parse`: scan the description; `None` when no recognized key occurs.
//! - `format`: one line per non-empty field, canonical order.
//! - `set`: replace recognized lines, preserving everything else. The
//!   formatted block lands first, separated from the rest by a blank line.

use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Key folding and scanning
// ---------------------------------------------------------------------------

/// Fold a key to its match form: lowercase with separators stripped, so
/// snake/kebab/camel spellings of the same key collide.
fn fold_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Forgiving integer scan in the manner of `%d`: optional sign, then as
/// many digits as are there. `None` when no digit is found; malformed
/// values are skipped silently rather than erroring.
fn scan_int(value: &str) -> Option<i64> {
    let value = value.trim();
    let (sign, rest) = match value.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, value.strip_prefix('+').unwrap_or(value)),
    };
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<i64>().ok().map(|n| sign * n)
}

/// Split a description line into `(key, value)` if it has the shape of a
/// field line. Lines without a colon are content, not fields.
fn split_field_line(line: &str) -> Option<(&str, &str)> {
    let stripped = line.trim();
    if stripped.is_empty() {
        return None;
    }
    let (key, value) = stripped.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, value.trim()))
}

// ---------------------------------------------------------------------------
// Table-driven core
// ---------------------------------------------------------------------------

/// Scan `desc` for lines whose folded key is in `keys` (canonical
/// snake_case). Returns `None` when nothing matched; otherwise the map of
/// canonical key → raw value. Empty values are treated as absent.
fn parse_block(desc: &str, keys: &[&str]) -> Option<BTreeMap<String, String>> {
    let mut found = BTreeMap::new();
    let mut matched_any = false;
    for line in desc.lines() {
        let Some((key, value)) = split_field_line(line) else {
            continue;
        };
        let folded = fold_key(key);
        if let Some(canonical) = keys.iter().find(|k| fold_key(k) == folded) {
            matched_any = true;
            if !value.is_empty() {
                found.insert((*canonical).to_owned(), value.to_owned());
            }
        }
    }
    matched_any.then_some(found)
}

/// Emit one `key: value` line per present field, in `keys` order.
fn format_block(keys: &[&str], values: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for key in keys {
        if let Some(value) = values.get(*key) {
            if !value.is_empty() {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(key);
                out.push_str(": ");
                out.push_str(value);
            }
        }
    }
    out
}

/// Replace this family's lines in `desc` with a freshly formatted block.
///
/// Unrelated lines keep their order and internal blank-line structure;
/// leading/trailing blank runs are trimmed. The block goes first, then a
/// blank line, then the remainder.
fn set_block(desc: &str, keys: &[&str], values: &BTreeMap<String, String>) -> String {
    let remainder: Vec<&str> = desc
        .lines()
        .filter(|line| {
            split_field_line(line).is_none_or(|(key, _)| {
                let folded = fold_key(key);
                !keys.iter().any(|k| fold_key(k) == folded)
            })
        })
        .collect();

    // Trim blank lines at both ends, keep interior structure.
    let start = remainder
        .iter()
        .position(|l| !l.trim().is_empty())
        .unwrap_or(remainder.len());
    let end = remainder
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .map_or(start, |i| i + 1);
    let remainder = remainder[start..end].join("\n");

    let block = format_block(keys, values);
    match (block.is_empty(), remainder.is_empty()) {
        (true, _) => remainder,
        (false, true) => block,
        (false, false) => format!("{block}\n\n{remainder}"),
    }
}

// ---------------------------------------------------------------------------
// Family definition macro
// ---------------------------------------------------------------------------

/// Define a field family: a struct of optional fields plus parse/format/set
/// built on the table-driven core. `str` fields hold trimmed strings, `int`
/// fields go through the forgiving scanner.
macro_rules! field_family {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $field:ident : $kind:tt ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, PartialEq, Eq)]
        pub struct $name {
            $( pub $field: field_family!(@ty $kind), )+
        }

        impl $name {
            const KEYS: &'static [&'static str] = &[ $( stringify!($field) ),+ ];

            /// Parse the family out of a description. `None` when no
            /// recognized key occurs at all.
            pub fn parse(desc: &str) -> Option<Self> {
                let values = parse_block(desc, Self::KEYS)?;
                let mut out = Self::default();
                $( field_family!(@read out, values, $field, $kind); )+
                Some(out)
            }

            /// Canonical block for these fields (no trailing newline).
            pub fn format(&self) -> String {
                format_block(Self::KEYS, &self.to_map())
            }

            /// Rewrite `desc` with this family's block replacing any prior
            /// occurrence; unrelated content is preserved.
            pub fn set(&self, desc: &str) -> String {
                set_block(desc, Self::KEYS, &self.to_map())
            }

            fn to_map(&self) -> BTreeMap<String, String> {
                let mut map = BTreeMap::new();
                $( field_family!(@write self, map, $field, $kind); )+
                map
            }
        }
    };

    (@ty str) => { Option<String> };
    (@ty int) => { Option<i64> };

    (@read $out:ident, $values:ident, $field:ident, str) => {
        $out.$field = $values.get(stringify!($field)).cloned();
    };
    (@read $out:ident, $values:ident, $field:ident, int) => {
        $out.$field = $values.get(stringify!($field)).and_then(|v| scan_int(v));
    };

    (@write $self:expr, $map:ident, $field:ident, str) => {
        if let Some(v) = &$self.$field {
            if !v.is_empty() {
                $map.insert(stringify!($field).to_owned(), v.clone());
            }
        }
    };
    (@write $self:expr, $map:ident, $field:ident, int) => {
        if let Some(v) = $self.$field {
            $map.insert(stringify!($field).to_owned(), v.to_string());
        }
    };
}

// ---------------------------------------------------------------------------
// Families
// ---------------------------------------------------------------------------

field_family! {
    /// Fields the refinery reads off a merge-request bead.
    ///
    /// Convoy tracking (`convoy_id`, `convoy_created_at`) feeds priority
    /// scoring so convoys cannot starve; the conflict fields drive the
    /// refinery's retry policy.
    MergeRequestFields {
        source_branch: str,
        target_branch: str,
        worktree: str,
        convoy_id: str,
        convoy_created_at: str,
        retry_count: int,
        last_conflict_sha: str,
        conflict_task_id: str,
    }
}

field_family! {
    /// Molecule attachment on a work bead.
    AttachmentFields {
        attached_molecule: str,
        attached_at: str,
        attached_by: str,
    }
}

field_family! {
    /// Provenance fields on beads produced by synthesis.
    SynthesisFields {
        source_bead: str,
        synthesis_round: int,
    }
}

field_family! {
    /// Role configuration carried on an agent bead.
    RoleConfigFields {
        role: str,
        rig: str,
        runner: str,
    }
}

field_family! {
    /// Live-state fields on an agent bead.
    AgentFields {
        hook_bead: str,
        session: str,
        last_seen: str,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
