//! End-to-end scenarios over the runner: DSL in, event stream out.

mod common;

use serde_json::json;

use common::{collect_events, function_registry, inputs, node_ids_of};
use flowweave::dsl::GraphConfig;
use flowweave::engine::EngineConfig;
use flowweave::events::EventKind;
use flowweave::runner::{RunOptions, WorkflowRunner};
use flowweave::types::{NodeExecutionStatus, RunStatus};

fn runner() -> WorkflowRunner {
    WorkflowRunner::new(EngineConfig::default()).with_functions(function_registry())
}

fn config(value: serde_json::Value) -> GraphConfig {
    serde_json::from_value(value).unwrap()
}

#[tokio::test]
async fn start_end_passthrough() {
    let config = config(json!({
        "nodes": [
            {"id": "start_1", "data": {"type": "start", "title": "Start",
                "variables": [{"variable": "name", "type": "string", "required": true}]}},
            {"id": "end_1", "data": {"type": "end", "title": "End",
                "outputs": [{"variable": "result", "value_selector": ["start_1", "name"]}]}}
        ],
        "edges": [{"source": "start_1", "target": "end_1"}]
    }));

    let result = runner()
        .run_sync(
            &config,
            inputs(&[("name", json!("Hello World"))]),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.outputs["result"], json!("Hello World"));
}

#[tokio::test]
async fn stream_is_framed_by_started_and_terminal() {
    let config = config(json!({
        "nodes": [
            {"id": "start_1", "data": {"type": "start", "title": "Start",
                "variables": [{"variable": "name", "type": "string"}]}},
            {"id": "end_1", "data": {"type": "end", "title": "End",
                "outputs": [{"variable": "result", "value_selector": ["start_1", "name"]}]}}
        ],
        "edges": [{"source": "start_1", "target": "end_1"}]
    }));

    let workflow = runner()
        .start(&config, inputs(&[("name", json!("x"))]), RunOptions::default())
        .await
        .unwrap();
    let events = collect_events(workflow.events).await;

    assert_eq!(events.first().unwrap().kind, EventKind::GraphRunStarted);
    assert_eq!(events.last().unwrap().kind, EventKind::GraphRunSucceeded);
    let terminal_count = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminal_count, 1);

    // Per-node ordering: started strictly precedes the terminal event.
    for node_id in ["start_1", "end_1"] {
        let started = common::event_index(&events, EventKind::NodeRunStarted, node_id).unwrap();
        let succeeded = common::event_index(&events, EventKind::NodeRunSucceeded, node_id).unwrap();
        assert!(started < succeeded);
    }
}

fn if_else_config() -> GraphConfig {
    config(json!({
        "nodes": [
            {"id": "start_1", "data": {"type": "start", "title": "Start",
                "variables": [{"variable": "age", "type": "number", "required": true}]}},
            {"id": "if_1", "data": {"type": "if-else", "title": "Age gate",
                "conditions": [{
                    "id": "adult",
                    "logical_operator": "and",
                    "conditions": [{
                        "variable_selector": ["start_1", "age"],
                        "comparison_operator": "ge",
                        "value": "18"
                    }]
                }]}},
            {"id": "answer_adult", "data": {"type": "answer", "title": "Adult",
                "answer": "adult path"}},
            {"id": "answer_minor", "data": {"type": "answer", "title": "Minor",
                "answer": "minor path"}}
        ],
        "edges": [
            {"source": "start_1", "target": "if_1"},
            {"source": "if_1", "target": "answer_adult", "sourceHandle": "adult"},
            {"source": "if_1", "target": "answer_minor", "sourceHandle": "false"}
        ]
    }))
}

#[tokio::test]
async fn if_else_routes_adults() {
    let result = runner()
        .run_sync(&if_else_config(), inputs(&[("age", json!(25))]), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.outputs["answer"], json!("adult path"));
    let ran: Vec<String> = result
        .node_executions
        .iter()
        .map(|e| e.node_id.clone())
        .collect();
    assert!(ran.contains(&"answer_adult".to_string()));
    assert!(!ran.contains(&"answer_minor".to_string()));
}

#[tokio::test]
async fn if_else_routes_minors() {
    let result = runner()
        .run_sync(&if_else_config(), inputs(&[("age", json!(15))]), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.outputs["answer"], json!("minor path"));
}

#[tokio::test]
async fn function_default_value_fallback() {
    let config = config(json!({
        "nodes": [
            {"id": "start_1", "data": {"type": "start", "title": "Start",
                "variables": [{"variable": "query", "type": "string"}]}},
            {"id": "code_1", "data": {"type": "func", "title": "Doomed",
                "function_ref": "always_fails",
                "error_strategy": "default-value",
                "default_value": {"result": "fallback_value"},
                "inputs": [{"name": "text", "type": "string", "required": false,
                            "value_selector": ["start_1", "query"]}],
                "outputs": [{"name": "result", "type": "string", "required": true}]}},
            {"id": "end_1", "data": {"type": "end", "title": "End",
                "outputs": [{"variable": "result", "value_selector": ["code_1", "result"]}]}}
        ],
        "edges": [
            {"source": "start_1", "target": "code_1"},
            {"source": "code_1", "target": "end_1"}
        ]
    }));

    let result = runner()
        .run_sync(&config, inputs(&[("query", json!("hi"))]), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.outputs["result"], json!("fallback_value"));

    let synthetic = result
        .node_executions
        .iter()
        .find(|e| e.node_id == "code_1" && e.status == NodeExecutionStatus::Succeeded)
        .expect("synthetic success for code_1");
    assert_eq!(
        synthetic.metadata.as_ref().unwrap()["used_default_value"],
        json!(true)
    );
}

#[tokio::test]
async fn function_fail_branch_routing() {
    let config = config(json!({
        "nodes": [
            {"id": "start_1", "data": {"type": "start", "title": "Start",
                "variables": [{"variable": "query", "type": "string"}]}},
            {"id": "code_1", "data": {"type": "func", "title": "Doomed",
                "function_ref": "always_fails",
                "error_strategy": "fail-branch",
                "inputs": [{"name": "text", "type": "string", "required": false,
                            "value_selector": ["start_1", "query"]}],
                "outputs": [{"name": "result", "type": "string", "required": true}]}},
            {"id": "end_ok", "data": {"type": "end", "title": "Ok",
                "outputs": [{"variable": "result", "value_selector": ["start_1", "query"]}]}},
            {"id": "end_err", "data": {"type": "end", "title": "Err",
                "outputs": [{"variable": "error_msg", "value_selector": ["code_1", "__error__"]}]}}
        ],
        "edges": [
            {"source": "start_1", "target": "code_1"},
            {"source": "code_1", "target": "end_ok", "sourceHandle": "success-branch"},
            {"source": "code_1", "target": "end_err", "sourceHandle": "fail-branch"}
        ]
    }));

    let workflow = runner()
        .start(&config, inputs(&[("query", json!("q"))]), RunOptions::default())
        .await
        .unwrap();
    let events = collect_events(workflow.events).await;

    let terminal = events.last().unwrap();
    assert_eq!(terminal.kind, EventKind::GraphRunSucceeded);

    // Only the fail-branch end node ran.
    let succeeded = node_ids_of(&events, EventKind::NodeRunSucceeded);
    assert!(succeeded.contains(&"end_err".to_string()));
    assert!(!succeeded.contains(&"end_ok".to_string()));

    let outputs = terminal.outputs.as_ref().unwrap();
    let error_msg = outputs["error_msg"].as_str().unwrap();
    assert!(error_msg.contains("function execution failed"));
    assert!(error_msg.contains("intentional failure"));
    assert!(outputs.get("result").is_none());
}

#[tokio::test]
async fn iteration_accumulates_items() {
    let config = config(json!({
        "nodes": [
            {"id": "start_1", "data": {"type": "start", "title": "Start",
                "variables": [{"variable": "names", "type": "array", "required": true}]}},
            {"id": "iter_1", "data": {"type": "iteration", "title": "Each name",
                "iterator": ["start_1", "names"],
                "output_variable": "processed"}},
            {"id": "end_1", "data": {"type": "end", "title": "End",
                "outputs": [
                    {"variable": "items", "value_selector": ["iter_1", "processed"]},
                    {"variable": "count", "value_selector": ["iter_1", "count"]}
                ]}}
        ],
        "edges": [
            {"source": "start_1", "target": "iter_1"},
            {"source": "iter_1", "target": "end_1"}
        ]
    }));

    let result = runner()
        .run_sync(
            &config,
            inputs(&[("names", json!(["Alice", "Bob", "Charlie"]))]),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.outputs["count"], json!(3));
    assert_eq!(result.outputs["items"], json!(["Alice", "Bob", "Charlie"]));
}

#[tokio::test]
async fn template_transform_renders_locals_and_pool_refs() {
    let config = config(json!({
        "nodes": [
            {"id": "start_1", "data": {"type": "start", "title": "Start",
                "variables": [
                    {"variable": "name", "type": "string"},
                    {"variable": "city", "type": "string"}
                ]}},
            {"id": "tpl_1", "data": {"type": "template-transform", "title": "Greeting",
                "template": "Hello {{ name }} from {{#start_1.city#}}!",
                "variables": [{"variable": "name", "value_selector": ["start_1", "name"]}]}},
            {"id": "end_1", "data": {"type": "end", "title": "End",
                "outputs": [{"variable": "greeting", "value_selector": ["tpl_1", "output"]}]}}
        ],
        "edges": [
            {"source": "start_1", "target": "tpl_1"},
            {"source": "tpl_1", "target": "end_1"}
        ]
    }));

    let result = runner()
        .run_sync(
            &config,
            inputs(&[("name", json!("Ada")), ("city", json!("London"))]),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.outputs["greeting"], json!("Hello Ada from London!"));
}

#[tokio::test]
async fn retry_strategy_recovers_from_transient_failures() {
    use common::FlakyFunction;
    use flowweave::nodes::function::FunctionRegistry;
    use std::sync::Arc;

    let functions = FunctionRegistry::new();
    let flaky = Arc::new(FlakyFunction::new(2));
    functions.register(flaky.clone()).unwrap();

    let runner =
        WorkflowRunner::new(EngineConfig::default()).with_functions(Arc::new(functions));

    let config = config(json!({
        "nodes": [
            {"id": "start_1", "data": {"type": "start", "title": "Start",
                "variables": [{"variable": "query", "type": "string"}]}},
            {"id": "code_1", "data": {"type": "func", "title": "Flaky",
                "function_ref": "flaky",
                "error_strategy": "retry",
                "retry": {"max_retries": 3, "retry_interval": 10},
                "inputs": [{"name": "text", "type": "string", "required": false,
                            "value_selector": ["start_1", "query"]}],
                "outputs": [{"name": "result", "type": "string", "required": true}]}},
            {"id": "end_1", "data": {"type": "end", "title": "End",
                "outputs": [{"variable": "result", "value_selector": ["code_1", "result"]}]}}
        ],
        "edges": [
            {"source": "start_1", "target": "code_1"},
            {"source": "code_1", "target": "end_1"}
        ]
    }));

    let result = runner
        .run_sync(&config, inputs(&[("query", json!("retry me"))]), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.outputs["result"], json!("retry me"));
    assert_eq!(flaky.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
}

#[tokio::test]
async fn unhandled_node_failure_fails_the_run() {
    let config = config(json!({
        "nodes": [
            {"id": "start_1", "data": {"type": "start", "title": "Start",
                "variables": [{"variable": "query", "type": "string"}]}},
            {"id": "code_1", "data": {"type": "func", "title": "Doomed",
                "function_ref": "always_fails",
                "inputs": [{"name": "text", "type": "string", "required": false,
                            "value_selector": ["start_1", "query"]}],
                "outputs": [{"name": "result", "type": "string", "required": true}]}},
            {"id": "end_1", "data": {"type": "end", "title": "End",
                "outputs": [{"variable": "result", "value_selector": ["code_1", "result"]}]}}
        ],
        "edges": [
            {"source": "start_1", "target": "code_1"},
            {"source": "code_1", "target": "end_1"}
        ]
    }));

    let result = runner()
        .run_sync(&config, inputs(&[("query", json!("q"))]), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    let error = result.error.unwrap();
    assert!(error.contains("node code_1 failed"));
    // The end node never ran.
    assert!(!result.node_executions.iter().any(|e| e.node_id == "end_1"));
}

#[tokio::test]
async fn max_node_steps_guard_fails_the_run() {
    let runner = WorkflowRunner::new(EngineConfig::default().with_max_node_steps(1))
        .with_functions(function_registry());

    let config = config(json!({
        "nodes": [
            {"id": "start_1", "data": {"type": "start", "title": "Start",
                "variables": [{"variable": "name", "type": "string"}]}},
            {"id": "tpl_1", "data": {"type": "template-transform", "title": "T",
                "template": "x", "variables": []}},
            {"id": "end_1", "data": {"type": "end", "title": "End", "outputs": []}}
        ],
        "edges": [
            {"source": "start_1", "target": "tpl_1"},
            {"source": "tpl_1", "target": "end_1"}
        ]
    }));

    let result = runner
        .run_sync(&config, inputs(&[("name", json!("x"))]), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.unwrap().contains("max node steps"));
}

#[tokio::test]
async fn node_coverage_is_stable_across_worker_counts() {
    for workers in 1..=4 {
        let runner = WorkflowRunner::new(EngineConfig::default().with_max_workers(workers))
            .with_functions(function_registry());

        let result = runner
            .run_sync(&if_else_config(), inputs(&[("age", json!(30))]), RunOptions::default())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Succeeded, "workers={workers}");
        let mut ran: Vec<String> = result
            .node_executions
            .iter()
            .map(|e| e.node_id.clone())
            .collect();
        ran.sort();
        assert_eq!(
            ran,
            vec!["answer_adult", "if_1", "start_1"],
            "workers={workers}"
        );
    }
}
