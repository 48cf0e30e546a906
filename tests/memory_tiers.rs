//! Memory-tier behaviour through the coordinator and the LLM node.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{function_registry, inputs, provider_registry, ScriptedProvider};
use flowweave::dsl::GraphConfig;
use flowweave::engine::EngineConfig;
use flowweave::memory::{
    CompressionLock, ConversationSummary, GatewayCompressor, InMemoryCompressLock, InMemoryMtmStore,
    InMemoryStm, MemorizeRequest, MemoryConfig, MemoryCoordinator, ShortTermMemory,
    SimpleTokenEstimator, SummaryGenerator,
};
use flowweave::message::{Message, Role};
use flowweave::runner::{RunOptions, WorkflowRunner};
use flowweave::types::RunStatus;

fn memory_config(value: serde_json::Value) -> MemoryConfig {
    serde_json::from_value(value).unwrap()
}

fn memorize_request(config: &MemoryConfig, i: usize) -> MemorizeRequest {
    MemorizeRequest {
        conversation_id: "conv-1".to_string(),
        config: config.clone(),
        user_message: Message::user(format!("question {i}")),
        assistant_message: Message::assistant(format!("answer {i}")),
        scope: None,
    }
}

#[tokio::test]
async fn append_linearizability_over_memorize() {
    let stm = Arc::new(InMemoryStm::new());
    let coordinator = Arc::new(MemoryCoordinator::new(stm.clone()));
    let config = memory_config(json!({"short_term": {"enabled": true}}));

    for i in 0..5 {
        coordinator
            .clone()
            .memorize(memorize_request(&config, i))
            .await
            .unwrap();
    }

    let state = stm.load_state("conv-1").await.unwrap();
    assert_eq!(state.version, 5);
    assert_eq!(state.recent_messages.len(), 10);
}

#[tokio::test]
async fn recall_degrades_silently_without_tiers() {
    let coordinator = MemoryCoordinator::new(Arc::new(InMemoryStm::new()));
    let config = memory_config(json!({
        "short_term": {"enabled": true},
        "mid_term": {"enabled": true}
    }));

    // Mid-term enabled but no store attached: recall still returns the
    // short-term portion.
    let result = coordinator.recall("conv-1", &config, None).await;
    assert!(result.short_term_messages.is_empty());
    assert!(result.mid_term_summary.is_empty());
}

#[tokio::test]
async fn recall_applies_window_size() {
    let stm = Arc::new(InMemoryStm::new());
    let coordinator = Arc::new(MemoryCoordinator::new(stm.clone()));
    let config = memory_config(json!({"short_term": {"enabled": true, "window_size": 2}}));

    for i in 0..6 {
        coordinator
            .clone()
            .memorize(memorize_request(&config, i))
            .await
            .unwrap();
    }

    let result = coordinator.recall("conv-1", &config, None).await;
    assert_eq!(result.short_term_messages.len(), 4);
    assert_eq!(result.short_term_messages[0].content, "question 4");
}

/// A summary generator that counts invocations.
struct CountingSummarizer {
    calls: std::sync::atomic::AtomicU32,
}

#[async_trait::async_trait]
impl SummaryGenerator for CountingSummarizer {
    async fn summarize(
        &self,
        messages: &[Message],
        _existing: &str,
    ) -> Result<String, flowweave::memory::MemoryError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(format!("summary of {} messages", messages.len()))
    }
}

#[tokio::test]
async fn mid_term_summary_triggers_on_threshold_with_freshness_guard() {
    let stm = Arc::new(InMemoryStm::new());
    let mtm = Arc::new(InMemoryMtmStore::new());
    let summarizer = Arc::new(CountingSummarizer {
        calls: std::sync::atomic::AtomicU32::new(0),
    });
    let coordinator = Arc::new(
        MemoryCoordinator::new(stm.clone()).with_mid_term(mtm.clone(), summarizer.clone()),
    );
    let config = memory_config(json!({
        "short_term": {"enabled": true},
        "mid_term": {"enabled": true, "summary_threshold": 2}
    }));

    // Below threshold: no summary.
    coordinator
        .clone()
        .memorize(memorize_request(&config, 0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(summarizer.calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    // Threshold reached: one async summarization.
    coordinator
        .clone()
        .memorize(memorize_request(&config, 1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(summarizer.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    use flowweave::memory::MidTermMemory;
    let summary = mtm.load_summary(None, "conv-1").await.unwrap().unwrap();
    assert_eq!(summary.turns_covered, 2);

    // Turn 3: covered(2) >= 3 - 2/2 fails only when turns advance
    // further; the freshness guard still suppresses regeneration here.
    coordinator
        .clone()
        .memorize(memorize_request(&config, 2))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(summarizer.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    // Turn 4: the summary is stale enough and regenerates.
    coordinator
        .clone()
        .memorize(memorize_request(&config, 3))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(summarizer.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
}

fn gateway_coordinator(
    stm: Arc<InMemoryStm>,
    provider: Arc<ScriptedProvider>,
) -> Arc<MemoryCoordinator> {
    let gateway = Arc::new(GatewayCompressor::new(
        provider,
        "compressor-model",
        Arc::new(SimpleTokenEstimator),
    ));
    Arc::new(
        MemoryCoordinator::new(stm).with_gateway(gateway, Arc::new(InMemoryCompressLock::new())),
    )
}

fn tiny_window_config() -> MemoryConfig {
    memory_config(json!({
        "short_term": {
            "enabled": true,
            "gateway_compress": {
                "enabled": true,
                "context_window_size": 60,
                "token_threshold_ratio": 0.5,
                "min_recent_turns": 1,
                "extract_key_facts": true
            }
        }
    }))
}

#[tokio::test]
async fn gateway_compression_rewrites_summary_and_trims_history() {
    let stm = Arc::new(InMemoryStm::new());
    let provider = Arc::new(ScriptedProvider::new("compressor"));
    provider.push_text(
        "{\"compressed_summary\": \"user is planning a trip\", \"key_facts\": {\"city\": \"Tokyo\"}}",
    );
    let coordinator = gateway_coordinator(stm.clone(), provider.clone());
    let config = tiny_window_config();

    // Two turns push the estimate past the 30-token threshold.
    for i in 0..2 {
        coordinator
            .clone()
            .memorize(memorize_request(&config, i))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let state = stm.load_state("conv-1").await.unwrap();
    assert_eq!(state.gateway_summary, "user is planning a trip");
    assert_eq!(state.key_facts.get("city").map(String::as_str), Some("Tokyo"));
    // min_recent_turns = 1 keeps exactly the last turn.
    assert_eq!(state.recent_messages.len(), 2);
    assert!(state.compressed_turn_count >= 1);
    assert!(state.last_compressed_at > 0);
    // The CAS write bumped the version past the two appends.
    assert!(state.version > 2);
}

#[tokio::test]
async fn concurrent_append_discards_compression_result() {
    let stm = Arc::new(InMemoryStm::new());
    // Slow compressor: an append lands while it "thinks".
    let provider = Arc::new(ScriptedProvider::new("compressor").with_delay(Duration::from_millis(200)));
    provider.push_text("{\"compressed_summary\": \"stale summary\"}");
    let coordinator = gateway_coordinator(stm.clone(), provider.clone());
    let config = tiny_window_config();

    for i in 0..3 {
        coordinator
            .clone()
            .memorize(memorize_request(&config, i))
            .await
            .unwrap();
    }

    // While compression is in flight, another turn arrives.
    tokio::time::sleep(Duration::from_millis(50)).await;
    stm.append(
        "conv-1",
        vec![Message::user("interleaved"), Message::assistant("turn")],
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    let state = stm.load_state("conv-1").await.unwrap();
    assert_eq!(state.gateway_summary, "", "stale compression must be discarded");
    assert_eq!(state.recent_messages.len(), 8);
}

#[tokio::test]
async fn compression_lock_is_exclusive_per_conversation() {
    let lock = InMemoryCompressLock::new();
    assert!(lock.acquire("conv-1").await.unwrap());
    assert!(!lock.acquire("conv-1").await.unwrap());
    lock.release("conv-1").await.unwrap();
    assert!(lock.acquire("conv-1").await.unwrap());
}

fn llm_workflow() -> GraphConfig {
    serde_json::from_value(json!({
        "nodes": [
            {"id": "start_1", "data": {"type": "start", "title": "Start",
                "variables": [{"variable": "question", "type": "string", "required": true}]}},
            {"id": "llm_1", "data": {"type": "llm", "title": "Assistant",
                "model": {"provider": "scripted", "name": "test-model", "temperature": 0.7},
                "prompts": [
                    {"role": "system", "text": "You are a helpful travel agent."},
                    {"role": "user", "text": "{{#start_1.question#}}"}
                ],
                "memory": {"short_term": {"enabled": true},
                           "mid_term": {"enabled": true, "summary_threshold": 10}}}},
            {"id": "end_1", "data": {"type": "end", "title": "End",
                "outputs": [{"variable": "text", "value_selector": ["llm_1", "text"]}]}}
        ],
        "edges": [
            {"source": "start_1", "target": "llm_1"},
            {"source": "llm_1", "target": "end_1"}
        ]
    }))
    .unwrap()
}

#[tokio::test]
async fn llm_node_assembles_memory_in_contract_order() {
    let stm = Arc::new(InMemoryStm::new());
    let mtm = Arc::new(InMemoryMtmStore::new());

    // Seed prior state: history, gateway summary, key facts, mid-term
    // summary.
    let mut state = stm.load_state("conv-9").await.unwrap();
    state.recent_messages = vec![
        Message::user("earlier question"),
        Message::assistant("earlier answer"),
    ];
    state.gateway_summary = "compressed context".to_string();
    state
        .key_facts
        .insert("destination".to_string(), "Kyoto".to_string());
    state.version = 1;
    stm.save_state_if_version("conv-9", &state, 0).await.unwrap();

    use flowweave::memory::MidTermMemory;
    mtm.save_summary(None, "conv-9", &ConversationSummary::new("mid-term recap", 4))
        .await
        .unwrap();

    let summarizer = Arc::new(CountingSummarizer {
        calls: std::sync::atomic::AtomicU32::new(0),
    });
    let coordinator =
        Arc::new(MemoryCoordinator::new(stm.clone()).with_mid_term(mtm, summarizer));

    let provider = Arc::new(ScriptedProvider::new("scripted"));
    provider.push_text("Sure, Kyoto it is.");

    let runner = WorkflowRunner::new(EngineConfig::default())
        .with_functions(function_registry())
        .with_providers(provider_registry(provider.clone()))
        .with_memory(coordinator);

    let options = RunOptions {
        conversation_id: Some("conv-9".to_string()),
        ..RunOptions::default()
    };
    let result = runner
        .run_sync(
            &llm_workflow(),
            inputs(&[("question", json!("book the trip"))]),
            options,
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.outputs["text"], json!("Sure, Kyoto it is."));

    let requests = provider.recorded_requests();
    let request = requests.first().expect("one provider request");
    let messages = &request.messages;

    // Contract order: system prompts, key facts, mid-term, gateway,
    // history, current user input.
    assert_eq!(messages[0].role, Role::System);
    assert_eq!(messages[0].content, "You are a helpful travel agent.");
    assert!(messages[1].content.contains("destination: Kyoto"));
    assert!(messages[2].content.contains("mid-term recap"));
    assert!(messages[3].content.contains("compressed context"));
    assert_eq!(messages[4].content, "earlier question");
    assert_eq!(messages[5].content, "earlier answer");
    assert_eq!(messages.last().unwrap().role, Role::User);
    assert_eq!(messages.last().unwrap().content, "book the trip");

    // Fire-and-forget memorize appended the new turn.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let state = stm.load_state("conv-9").await.unwrap();
    assert_eq!(state.recent_messages.len(), 4);
    assert_eq!(
        state.recent_messages.last().unwrap().content,
        "Sure, Kyoto it is."
    );

    // The trace metadata reached the node execution record.
    let llm_exec = result
        .node_executions
        .iter()
        .find(|e| e.node_id == "llm_1")
        .unwrap();
    let trace = &llm_exec.metadata.as_ref().unwrap()["llm_trace"];
    assert_eq!(trace["model"], json!("test-model"));
    assert_eq!(trace["response"], json!("Sure, Kyoto it is."));
}

#[tokio::test]
async fn llm_agent_loop_executes_tools_and_merges_args() {
    use common::SpyTool;
    use flowweave::provider::{ToolCall, ToolCallFunction};
    use flowweave::tool::ToolRegistry;

    let provider = Arc::new(ScriptedProvider::new("scripted"));
    provider.push_tool_calls(vec![ToolCall {
        id: "call_1".to_string(),
        kind: "function".to_string(),
        function: ToolCallFunction {
            name: "spy_search".to_string(),
            arguments: "{\"query\": \"ryokan\"}".to_string(),
        },
    }]);
    provider.push_text("Found a ryokan for you.");

    let spy = Arc::new(SpyTool::new("three results"));
    let mut tools = ToolRegistry::new();
    tools.register(spy.clone());

    let workflow: GraphConfig = serde_json::from_value(json!({
        "nodes": [
            {"id": "start_1", "data": {"type": "start", "title": "Start",
                "variables": [{"variable": "question", "type": "string"}]}},
            {"id": "llm_1", "data": {"type": "llm", "title": "Agent",
                "model": {"provider": "scripted", "name": "test-model"},
                "prompts": [{"role": "user", "text": "{{#start_1.question#}}"}],
                "tools": [{"name": "spy_search",
                           "description": "Search accommodation listings",
                           "args": {"top_k": 3}}]}},
            {"id": "end_1", "data": {"type": "end", "title": "End",
                "outputs": [{"variable": "text", "value_selector": ["llm_1", "text"]}]}}
        ],
        "edges": [
            {"source": "start_1", "target": "llm_1"},
            {"source": "llm_1", "target": "end_1"}
        ]
    }))
    .unwrap();

    let runner = WorkflowRunner::new(EngineConfig::default())
        .with_providers(provider_registry(provider.clone()))
        .with_tools(Arc::new(tools));

    let result = runner
        .run_sync(
            &workflow,
            inputs(&[("question", json!("find lodging"))]),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.outputs["text"], json!("Found a ryokan for you."));

    // DSL static args merged under the model's arguments.
    let invocations = spy.invocations.lock().unwrap().clone();
    assert_eq!(invocations.len(), 1);
    let args: serde_json::Value = serde_json::from_str(&invocations[0]).unwrap();
    assert_eq!(args["query"], json!("ryokan"));
    assert_eq!(args["top_k"], json!(3));

    let requests = provider.recorded_requests();
    // Round 1 carried the tool definitions with the DSL description.
    assert_eq!(requests[0].tools.len(), 1);
    assert_eq!(
        requests[0].tools[0].function.description,
        "Search accommodation listings"
    );
    assert_eq!(requests[0].tool_choice.as_deref(), Some("auto"));
    // Round 2 carried the assistant tool_calls message and the tool
    // result, in order.
    let round2 = &requests[1].messages;
    let assistant = round2
        .iter()
        .find(|m| m.role == Role::Assistant && m.tool_calls.is_some())
        .unwrap();
    assert_eq!(assistant.tool_calls.as_ref().unwrap()[0].id, "call_1");
    let tool_msg = round2.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(tool_msg.content, "three results");
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
}
