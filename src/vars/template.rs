//! Template token substitution.
//!
//! Two token forms exist in the DSL:
//!
//! - `{{#node_id.name#}}` — a variable-pool reference, substituted with
//!   the stringified value (JSON encoding for non-strings) or the empty
//!   string when unknown;
//! - `{{ name }}` — a local variable of the template-transform node.
//!
//! The parser walks bytes rather than using a regex so unterminated
//! tokens pass through verbatim, matching the pool's contract that
//! rendering is total.

use serde_json::Value;

use crate::types::VarMap;

/// Stringify a value for template output: strings verbatim, everything
/// else JSON-encoded.
#[must_use]
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitute `{{#node_id.name#}}` tokens using `lookup`. A `None` from
/// the lookup renders as the empty string.
pub fn substitute_pool_refs<F>(template: &str, mut lookup: F) -> String
where
    F: FnMut(&str, &str) -> Option<String>,
{
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;
    while i < bytes.len() {
        if template[i..].starts_with("{{#") {
            if let Some(end) = template[i + 3..].find("#}}") {
                let reference = &template[i + 3..i + 3 + end];
                if let Some((node_id, var_name)) = reference.split_once('.') {
                    if let Some(rendered) = lookup(node_id, var_name) {
                        out.push_str(&rendered);
                    }
                }
                i = i + 3 + end + 3;
                continue;
            }
        }
        // Advance one whole UTF-8 character, not one byte.
        let ch_len = template[i..].chars().next().map_or(1, char::len_utf8);
        out.push_str(&template[i..i + ch_len]);
        i += ch_len;
    }
    out
}

/// Substitute `{{ name }}` tokens from `locals`, leaving `{{#...#}}`
/// pool references untouched. Unknown locals render as the empty string.
#[must_use]
pub fn substitute_locals(template: &str, locals: &VarMap) -> String {
    let mut out = String::with_capacity(template.len());
    let mut i = 0;
    while i < template.len() {
        if template[i..].starts_with("{{#") {
            if let Some(end) = template[i + 3..].find("#}}") {
                out.push_str(&template[i..i + 3 + end + 3]);
                i = i + 3 + end + 3;
                continue;
            }
        }
        if template[i..].starts_with("{{") {
            if let Some(end) = template[i + 2..].find("}}") {
                let name = template[i + 2..i + 2 + end].trim();
                if let Some(value) = locals.get(name) {
                    out.push_str(&value_to_string(value));
                }
                i = i + 2 + end + 2;
                continue;
            }
        }
        let ch_len = template[i..].chars().next().map_or(1, char::len_utf8);
        out.push_str(&template[i..i + ch_len]);
        i += ch_len;
    }
    out
}

/// Render a template against both the variable pool and a local map:
/// pool references first, then locals.
#[must_use]
pub fn render_with_pool(
    template: &str,
    locals: &VarMap,
    pool: &super::VariablePool,
) -> String {
    let resolved = pool.resolve_template(template);
    substitute_locals(&resolved, locals)
}
