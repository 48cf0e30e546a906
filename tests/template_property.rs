//! Property tests for template rendering.

use proptest::prelude::*;
use serde_json::json;

use flowweave::vars::VariablePool;

fn pool_with(entries: &[(String, String, String)]) -> VariablePool {
    let pool = VariablePool::new();
    for (node, name, value) in entries {
        pool.set(node, name, json!(value));
    }
    pool
}

proptest! {
    /// Rendering is a pure function of (template, pool snapshot):
    /// re-rendering with an unchanged snapshot yields an identical
    /// string.
    #[test]
    fn rendering_is_deterministic(
        entries in proptest::collection::vec(
            ("[a-z]{1,8}", "[a-z]{1,8}", "[ -~]{0,16}"),
            0..4
        ),
        filler in "[ -~]{0,32}",
    ) {
        let entries: Vec<(String, String, String)> = entries;
        let pool = pool_with(&entries);

        let mut template = filler.clone();
        for (node, name, _) in &entries {
            template.push_str(&format!(" {{{{#{node}.{name}#}}}}"));
        }

        let first = pool.resolve_template(&template);
        let second = pool.resolve_template(&template);
        prop_assert_eq!(first, second);
    }

    /// Unknown references always render as the empty string and never
    /// leak the token.
    #[test]
    fn unknown_refs_render_empty(node in "[a-z]{1,8}", name in "[a-z]{1,8}") {
        let pool = VariablePool::new();
        let template = format!("[{{{{#{node}.{name}#}}}}]");
        prop_assert_eq!(pool.resolve_template(&template), "[]");
    }

    /// Text without any template tokens passes through untouched.
    #[test]
    fn plain_text_is_identity(text in "[^{}]*") {
        let pool = VariablePool::new();
        prop_assert_eq!(pool.resolve_template(&text), text);
    }
}
