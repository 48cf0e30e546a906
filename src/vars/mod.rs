//! The variable pool — the sole data channel between nodes.
//!
//! Every node writes its outputs into its own sub-map and reads its
//! inputs through `[node_id, variable_name]` selectors. The reserved
//! `sys` namespace carries the workflow inputs. Reads hand back clones so
//! callers never alias data that a concurrent writer may touch; writers
//! only hold the exclusive lock for the duration of a single sub-map
//! mutation, so unrelated nodes can interleave freely.

pub mod template;

use std::sync::RwLock;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::types::{new_var_map, VarMap, VariableSelector};

/// Reserved namespace for workflow inputs.
pub const SYS_NODE_ID: &str = "sys";

#[derive(Debug, Default)]
struct PoolInner {
    /// node_id -> variable_name -> value
    variables: FxHashMap<String, VarMap>,
    system: VarMap,
}

/// Thread-safe keyed store of per-node output maps plus system variables.
#[derive(Debug, Default)]
pub struct VariablePool {
    inner: RwLock<PoolInner>,
}

impl VariablePool {
    #[must_use]
    pub fn new() -> Self {
        VariablePool::default()
    }

    /// Create a pool pre-seeded with workflow inputs in the `sys`
    /// namespace.
    #[must_use]
    pub fn with_inputs(inputs: VarMap) -> Self {
        let pool = VariablePool::new();
        {
            let mut inner = pool.inner.write().expect("variable pool poisoned");
            inner.system = inputs;
        }
        pool
    }

    /// Read a value by selector. Returns a point-in-time clone.
    #[must_use]
    pub fn get(&self, selector: &VariableSelector) -> Option<Value> {
        if !selector.is_valid() {
            return None;
        }
        let inner = self.inner.read().expect("variable pool poisoned");
        if selector.node_id() == SYS_NODE_ID {
            return inner.system.get(selector.var_name()).cloned();
        }
        inner
            .variables
            .get(selector.node_id())
            .and_then(|vars| vars.get(selector.var_name()))
            .cloned()
    }

    /// Set a single variable on a node's sub-map.
    pub fn set(&self, node_id: &str, var_name: &str, value: Value) {
        let mut inner = self.inner.write().expect("variable pool poisoned");
        inner
            .variables
            .entry(node_id.to_string())
            .or_default()
            .insert(var_name.to_string(), value);
    }

    /// Bulk-write a node's outputs into its sub-map.
    pub fn set_node_outputs(&self, node_id: &str, outputs: VarMap) {
        let mut inner = self.inner.write().expect("variable pool poisoned");
        let vars = inner.variables.entry(node_id.to_string()).or_default();
        for (k, v) in outputs {
            vars.insert(k, v);
        }
    }

    /// Copy of a node's full output map, if any.
    #[must_use]
    pub fn node_outputs(&self, node_id: &str) -> Option<VarMap> {
        let inner = self.inner.read().expect("variable pool poisoned");
        inner.variables.get(node_id).cloned()
    }

    /// Set a system (workflow input) variable.
    pub fn set_system(&self, key: &str, value: Value) {
        let mut inner = self.inner.write().expect("variable pool poisoned");
        inner.system.insert(key.to_string(), value);
    }

    /// Read a system variable.
    #[must_use]
    pub fn get_system(&self, key: &str) -> Option<Value> {
        let inner = self.inner.read().expect("variable pool poisoned");
        inner.system.get(key).cloned()
    }

    /// Point-in-time dump of all variables, with the system namespace
    /// nested under `__system__`.
    #[must_use]
    pub fn snapshot(&self) -> VarMap {
        let inner = self.inner.read().expect("variable pool poisoned");
        let mut dump = new_var_map();
        for (node_id, vars) in &inner.variables {
            let map: serde_json::Map<String, Value> =
                vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            dump.insert(node_id.clone(), Value::Object(map));
        }
        let system: serde_json::Map<String, Value> = inner
            .system
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        dump.insert("__system__".to_string(), Value::Object(system));
        dump
    }

    /// Substitute every `{{#node_id.name#}}` token with the stringified
    /// value of the referenced variable, leaving unknown references as
    /// the empty string. The pool is read under a shared lock for the
    /// whole render so the result is a pure function of one snapshot.
    #[must_use]
    pub fn resolve_template(&self, template: &str) -> String {
        let inner = self.inner.read().expect("variable pool poisoned");
        template::substitute_pool_refs(template, |node_id, var_name| {
            let value = if node_id == SYS_NODE_ID {
                inner.system.get(var_name)
            } else {
                inner.variables.get(node_id).and_then(|vars| vars.get(var_name))
            };
            value.map(template::value_to_string)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sys_namespace_reads() {
        let mut inputs = new_var_map();
        inputs.insert("name".into(), json!("Hello World"));
        let pool = VariablePool::with_inputs(inputs);

        let sel = VariableSelector::new("sys", "name");
        assert_eq!(pool.get(&sel), Some(json!("Hello World")));
        assert_eq!(pool.get(&VariableSelector::new("sys", "missing")), None);
    }

    #[test]
    fn node_outputs_are_copied_not_aliased() {
        let pool = VariablePool::new();
        let mut outputs = new_var_map();
        outputs.insert("result".into(), json!({"nested": [1, 2, 3]}));
        pool.set_node_outputs("node_1", outputs);

        let copy = pool.node_outputs("node_1").unwrap();
        pool.set("node_1", "result", json!("overwritten"));
        assert_eq!(copy["result"], json!({"nested": [1, 2, 3]}));
    }

    #[test]
    fn bulk_write_merges_into_existing_submap() {
        let pool = VariablePool::new();
        pool.set("n", "a", json!(1));
        let mut more = new_var_map();
        more.insert("b".into(), json!(2));
        pool.set_node_outputs("n", more);

        assert_eq!(pool.get(&VariableSelector::new("n", "a")), Some(json!(1)));
        assert_eq!(pool.get(&VariableSelector::new("n", "b")), Some(json!(2)));
    }

    #[test]
    fn template_resolution_stringifies_and_blanks_unknowns() {
        let pool = VariablePool::new();
        pool.set("start_1", "name", json!("Ada"));
        pool.set("calc", "stats", json!({"count": 2}));

        let rendered =
            pool.resolve_template("hi {{#start_1.name#}}, stats={{#calc.stats#}}, x={{#no.body#}}!");
        assert_eq!(rendered, "hi Ada, stats={\"count\":2}, x=!");
    }

    #[test]
    fn snapshot_includes_system_namespace() {
        let mut inputs = new_var_map();
        inputs.insert("k".into(), json!(true));
        let pool = VariablePool::with_inputs(inputs);
        pool.set("n", "v", json!(7));

        let dump = pool.snapshot();
        assert_eq!(dump["__system__"]["k"], json!(true));
        assert_eq!(dump["n"]["v"], json!(7));
    }
}
