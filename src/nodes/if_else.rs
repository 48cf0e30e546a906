//! If-else branch node.
//!
//! Evaluates an ordered list of conditions, each a list of comparisons
//! combined by `and` / `or`. The first matching condition wins and its id
//! becomes the `__branch__` output; otherwise the node outputs
//! `{__branch__: "false", result: false}` and the else edge is followed.
//!
//! A missing variable behaves as empty/absent for the existence and
//! emptiness operators, and as a non-match for everything else.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::dsl::NodeData;
use crate::events::NodeEvent;
use crate::nodes::{
    delegate_base, run_with_events, BaseNode, NodeBuildError, NodeError, NodeRunResult,
    WorkflowNode,
};
use crate::types::{new_var_map, ExecutionClass, NodeType, VariableSelector, BRANCH_OUTPUT_KEY};
use crate::vars::template::value_to_string;
use crate::vars::VariablePool;

#[derive(Clone, Debug, Deserialize)]
struct IfElseNodeData {
    #[serde(default)]
    title: String,
    #[serde(default)]
    conditions: Vec<Condition>,
}

/// One condition branch: comparisons combined with a logical operator.
#[derive(Clone, Debug, Deserialize)]
pub struct Condition {
    pub id: String,
    #[serde(default, rename = "logical_operator")]
    pub logical_op: String,
    #[serde(default, rename = "conditions")]
    pub comparisons: Vec<Comparison>,
}

/// A single comparison against a variable-pool value.
#[derive(Clone, Debug, Deserialize)]
pub struct Comparison {
    #[serde(default)]
    pub variable_selector: VariableSelector,
    #[serde(rename = "comparison_operator")]
    pub operator: String,
    #[serde(default)]
    pub value: String,
}

pub struct IfElseNode {
    base: BaseNode,
    conditions: Vec<Condition>,
}

pub(crate) fn build(
    id: &str,
    raw: &Value,
    envelope: &NodeData,
) -> Result<Arc<dyn WorkflowNode>, NodeBuildError> {
    let data: IfElseNodeData =
        serde_json::from_value(raw.clone()).map_err(|source| NodeBuildError::Parse {
            node_id: id.to_string(),
            source,
        })?;
    Ok(Arc::new(IfElseNode {
        base: BaseNode::new(id, NodeType::IfElse, &data.title, ExecutionClass::Branch)
            .with_strategy_from(envelope),
        conditions: data.conditions,
    }))
}

impl IfElseNode {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeRunResult, NodeError> {
        for condition in &self.conditions {
            if evaluate_condition(condition, &ctx.variable_pool) {
                let mut outputs = new_var_map();
                outputs.insert(
                    BRANCH_OUTPUT_KEY.to_string(),
                    Value::String(condition.id.clone()),
                );
                outputs.insert("result".to_string(), Value::Bool(true));
                return Ok(NodeRunResult::succeeded(outputs));
            }
        }

        let mut outputs = new_var_map();
        outputs.insert(
            BRANCH_OUTPUT_KEY.to_string(),
            Value::String("false".to_string()),
        );
        outputs.insert("result".to_string(), Value::Bool(false));
        Ok(NodeRunResult::succeeded(outputs))
    }
}

#[async_trait]
impl WorkflowNode for IfElseNode {
    delegate_base!();

    async fn run(self: Arc<Self>, ctx: ExecutionContext) -> flume::Receiver<NodeEvent> {
        let node = self.clone();
        run_with_events(
            self.id().to_string(),
            self.node_type(),
            self.title().to_string(),
            async move { node.execute(ctx).await },
        )
    }
}

fn evaluate_condition(condition: &Condition, pool: &VariablePool) -> bool {
    if condition.comparisons.is_empty() {
        return false;
    }

    let is_and = condition.logical_op.to_lowercase() != "or";

    for comparison in &condition.comparisons {
        let matched = evaluate_comparison(comparison, pool);
        if is_and && !matched {
            return false;
        }
        if !is_and && matched {
            return true;
        }
    }

    is_and
}

fn evaluate_comparison(comparison: &Comparison, pool: &VariablePool) -> bool {
    let value = pool.get(&comparison.variable_selector);

    let Some(value) = value else {
        // Missing variable: emptiness/absence operators hold, the rest
        // cannot match.
        return matches!(
            comparison.operator.as_str(),
            "empty" | "is-empty" | "null" | "is-null" | "not-exist"
        );
    };

    let actual = value_to_string(&value);
    let expected = comparison.value.as_str();

    match comparison.operator.as_str() {
        // String operators.
        "contains" => actual.contains(expected),
        "not-contains" => !actual.contains(expected),
        "starts-with" | "start-with" => actual.starts_with(expected),
        "ends-with" | "end-with" => actual.ends_with(expected),
        "equal" | "is" => actual == expected,
        "not-equal" | "is-not" => actual != expected,
        "empty" | "is-empty" => actual.is_empty(),
        "not-empty" | "is-not-empty" => !actual.is_empty(),

        // Existence.
        "null" | "is-null" | "not-exist" => value.is_null(),
        "not-null" | "is-not-null" | "exist" => !value.is_null(),

        // Numeric comparisons.
        "gt" | ">" => to_f64(&value) > parse_f64(expected),
        "ge" | "gte" | ">=" => to_f64(&value) >= parse_f64(expected),
        "lt" | "<" => to_f64(&value) < parse_f64(expected),
        "le" | "lte" | "<=" => to_f64(&value) <= parse_f64(expected),
        "eq" | "==" => to_f64(&value) == parse_f64(expected),
        "ne" | "!=" => to_f64(&value) != parse_f64(expected),

        _ => false,
    }
}

fn to_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => parse_f64(s),
        Value::Bool(true) => 1.0,
        _ => 0.0,
    }
}

fn parse_f64(s: &str) -> f64 {
    s.trim().parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pool_with(vars: &[(&str, &str, Value)]) -> VariablePool {
        let pool = VariablePool::new();
        for (node, name, value) in vars {
            pool.set(node, name, value.clone());
        }
        pool
    }

    fn comparison(selector: (&str, &str), op: &str, value: &str) -> Comparison {
        Comparison {
            variable_selector: VariableSelector::new(selector.0, selector.1),
            operator: op.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn numeric_operators() {
        let pool = pool_with(&[("s", "age", json!(25))]);
        assert!(evaluate_comparison(&comparison(("s", "age"), "ge", "18"), &pool));
        assert!(evaluate_comparison(&comparison(("s", "age"), "gt", "24"), &pool));
        assert!(!evaluate_comparison(&comparison(("s", "age"), "lt", "18"), &pool));
        assert!(evaluate_comparison(&comparison(("s", "age"), "eq", "25"), &pool));
        assert!(evaluate_comparison(&comparison(("s", "age"), "ne", "30"), &pool));
    }

    #[test]
    fn string_operators() {
        let pool = pool_with(&[("s", "city", json!("Tokyo Tower"))]);
        assert!(evaluate_comparison(&comparison(("s", "city"), "contains", "Tower"), &pool));
        assert!(evaluate_comparison(&comparison(("s", "city"), "starts-with", "Tokyo"), &pool));
        assert!(evaluate_comparison(&comparison(("s", "city"), "ends-with", "Tower"), &pool));
        assert!(evaluate_comparison(&comparison(("s", "city"), "not-equal", "Kyoto"), &pool));
        assert!(evaluate_comparison(&comparison(("s", "city"), "not-empty", ""), &pool));
    }

    #[test]
    fn missing_variable_semantics() {
        let pool = VariablePool::new();
        assert!(evaluate_comparison(&comparison(("s", "gone"), "empty", ""), &pool));
        assert!(evaluate_comparison(&comparison(("s", "gone"), "not-exist", ""), &pool));
        assert!(!evaluate_comparison(&comparison(("s", "gone"), "exist", ""), &pool));
        assert!(!evaluate_comparison(&comparison(("s", "gone"), "equal", "x"), &pool));
    }

    #[test]
    fn and_or_combinators() {
        let pool = pool_with(&[("s", "a", json!(5)), ("s", "b", json!("yes"))]);

        let both = Condition {
            id: "c1".into(),
            logical_op: "and".into(),
            comparisons: vec![
                comparison(("s", "a"), "gt", "1"),
                comparison(("s", "b"), "equal", "yes"),
            ],
        };
        assert!(evaluate_condition(&both, &pool));

        let either = Condition {
            id: "c2".into(),
            logical_op: "or".into(),
            comparisons: vec![
                comparison(("s", "a"), "gt", "100"),
                comparison(("s", "b"), "equal", "yes"),
            ],
        };
        assert!(evaluate_condition(&either, &pool));

        let neither = Condition {
            id: "c3".into(),
            logical_op: "or".into(),
            comparisons: vec![comparison(("s", "a"), "gt", "100")],
        };
        assert!(!evaluate_condition(&neither, &pool));
    }

    #[test]
    fn empty_condition_never_matches() {
        let pool = VariablePool::new();
        let empty = Condition {
            id: "c".into(),
            logical_op: "and".into(),
            comparisons: vec![],
        };
        assert!(!evaluate_condition(&empty, &pool));
    }
}
