//! Integration tests for the JSON tool boundary.
//!
//! Calls go through `ToolHandler::call_tool` exactly as the serve loop issues
//! them, so ownership checks, resolver runs and history recording are covered.

use agent_tasks::cli::serve::serve_lines;
use agent_tasks::config::Config;
use agent_tasks::coordinator::Coordinator;
use agent_tasks::store::{FileStore, Store};
use agent_tasks::tools::{ToolContext, ToolHandler};
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::BufReader;

/// Helper to create a tool handler over a file store in a temp directory
fn setup_handler() -> (TempDir, ToolHandler) {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn Store> = Arc::new(FileStore::open(dir.path(), Default::default()).unwrap());
    let coordinator = Coordinator::with_store(store, &Config::default());
    (dir, ToolHandler::new(Arc::new(coordinator)))
}

fn as_agent(id: &str) -> ToolContext {
    ToolContext::new(id)
}

async fn call(handler: &ToolHandler, agent: &str, tool: &str, args: Value) -> Value {
    handler.call_tool(&as_agent(agent), tool, args).await
}

fn task_id(response: &Value) -> String {
    assert_eq!(response["success"], true, "unexpected failure: {}", response);
    response["task"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_tool_list_has_schemas() {
    let (_dir, handler) = setup_handler();
    let tools = handler.get_tools();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    for expected in [
        "create_task",
        "batch_create_tasks",
        "update_task",
        "get_task",
        "list_tasks",
        "claim_task",
        "complete_task",
        "fail_task",
        "cancel_task",
        "release_task",
        "list_agents",
        "get_history",
    ] {
        assert!(names.contains(&expected), "missing tool {}", expected);
    }
    for tool in &tools {
        assert_eq!(tool.input_schema["type"], "object");
    }
}

#[tokio::test]
async fn test_create_claim_complete_flow() {
    let (_dir, handler) = setup_handler();

    let created = call(
        &handler,
        "planner",
        "create_task",
        json!({"title": "Index docs", "metadata": {"area": "search"}}),
    )
    .await;
    let id = task_id(&created);
    assert_eq!(created["task"]["status"], "pending");
    assert_eq!(created["task"]["created_by"], "planner");

    let dependent = call(
        &handler,
        "planner",
        "create_task",
        json!({"title": "Publish index", "dependencies": [id]}),
    )
    .await;
    let dependent_id = task_id(&dependent);
    assert_eq!(dependent["task"]["status"], "blocked");

    let claimed = call(&handler, "agent-1", "claim_task", json!({"task_id": id})).await;
    assert_eq!(claimed["task"]["status"], "in_progress");
    assert_eq!(claimed["task"]["assigned_to"], "agent-1");

    let completed = call(&handler, "agent-1", "complete_task", json!({"task_id": id})).await;
    assert_eq!(completed["success"], true);
    assert_eq!(completed["promoted"], json!([dependent_id]));

    let fetched = call(&handler, "agent-2", "get_task", json!({"task_id": dependent_id})).await;
    assert_eq!(fetched["task"]["status"], "pending");
}

#[tokio::test]
async fn test_only_the_assignee_may_finish() {
    let (_dir, handler) = setup_handler();
    let id = task_id(&call(&handler, "planner", "create_task", json!({"title": "Mine"})).await);
    call(&handler, "agent-1", "claim_task", json!({"task_id": id})).await;

    for tool in ["complete_task", "fail_task", "release_task"] {
        let response = call(&handler, "agent-2", tool, json!({"task_id": id})).await;
        assert_eq!(response["success"], false);
        assert_eq!(response["code"], "NOT_OWNER", "{} by non-owner", tool);
    }

    let released = call(&handler, "agent-1", "release_task", json!({"task_id": id})).await;
    assert_eq!(released["task"]["status"], "pending");
}

#[tokio::test]
async fn test_only_the_creator_may_cancel() {
    let (_dir, handler) = setup_handler();
    let id = task_id(&call(&handler, "planner", "create_task", json!({"title": "Plan"})).await);

    let denied = call(&handler, "agent-1", "cancel_task", json!({"task_id": id})).await;
    assert_eq!(denied["code"], "NOT_OWNER");

    let cancelled = call(&handler, "planner", "cancel_task", json!({"task_id": id})).await;
    assert_eq!(cancelled["task"]["status"], "cancelled");

    let twice = call(&handler, "planner", "cancel_task", json!({"task_id": id})).await;
    assert_eq!(twice["code"], "INVALID_STATE");
}

#[tokio::test]
async fn test_stale_expected_version_is_rejected() {
    let (_dir, handler) = setup_handler();
    let id = task_id(&call(&handler, "planner", "create_task", json!({"title": "Racy"})).await);

    let stale = call(
        &handler,
        "agent-1",
        "claim_task",
        json!({"task_id": id, "expected_version": 3}),
    )
    .await;
    assert_eq!(stale["code"], "VERSION_CONFLICT");

    let bad_type = call(
        &handler,
        "agent-1",
        "claim_task",
        json!({"task_id": id, "expected_version": "zero"}),
    )
    .await;
    assert_eq!(bad_type["code"], "INVALID_FIELD_VALUE");
}

#[tokio::test]
async fn test_batch_create_resolves_in_one_call() {
    let (_dir, handler) = setup_handler();
    let response = call(
        &handler,
        "planner",
        "batch_create_tasks",
        json!({"tasks": [
            {"id": "fetch", "title": "Fetch data"},
            {"id": "clean", "title": "Clean data", "dependencies": ["fetch"]},
            {"id": "report", "title": "Report", "dependencies": ["clean", "fetch"]},
        ]}),
    )
    .await;
    assert_eq!(response["success"], true, "{}", response);
    assert_eq!(response["count"], 3);
    let statuses: Vec<&str> = response["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["pending", "blocked", "blocked"]);
}

#[tokio::test]
async fn test_batch_cycle_is_reported_with_created_ids() {
    let (_dir, handler) = setup_handler();
    let response = call(
        &handler,
        "planner",
        "batch_create_tasks",
        json!({"tasks": [
            {"id": "x", "title": "X", "dependencies": ["z"]},
            {"id": "y", "title": "Y", "dependencies": ["x"]},
            {"id": "z", "title": "Z", "dependencies": ["y"]},
        ]}),
    )
    .await;
    assert_eq!(response["success"], false);
    assert_eq!(response["code"], "DEPENDENCY_CYCLE");
    assert_eq!(response["details"]["created"], json!(["x", "y", "z"]));
    let cycle = response["details"]["cycle"].as_array().unwrap();
    assert_eq!(cycle.first(), cycle.last());

    // The tasks exist; the caller decides whether to cancel them.
    let fetched = call(&handler, "planner", "get_task", json!({"task_id": "y"})).await;
    assert_eq!(fetched["task"]["status"], "blocked");
}

#[tokio::test]
async fn test_self_dependency_is_refused_before_writing() {
    let (_dir, handler) = setup_handler();
    let response = call(
        &handler,
        "planner",
        "create_task",
        json!({"id": "loop", "title": "Loop", "dependencies": ["loop"]}),
    )
    .await;
    assert_eq!(response["success"], false);
    assert_eq!(response["code"], "DEPENDENCY_CYCLE");
    assert_eq!(response["details"]["cycle"], json!(["loop", "loop"]));
    assert_eq!(response["details"]["created"], json!([]));

    let fetched = call(&handler, "planner", "get_task", json!({"task_id": "loop"})).await;
    assert_eq!(fetched["code"], "TASK_NOT_FOUND");
}

#[tokio::test]
async fn test_create_closing_a_cycle_is_refused() {
    let (_dir, handler) = setup_handler();
    // "first" waits on an id nobody has created yet.
    let first = call(
        &handler,
        "planner",
        "create_task",
        json!({"id": "first", "title": "First", "dependencies": ["second"]}),
    )
    .await;
    assert_eq!(task_id(&first), "first");

    let second = call(
        &handler,
        "planner",
        "create_task",
        json!({"id": "second", "title": "Second", "dependencies": ["first"]}),
    )
    .await;
    assert_eq!(second["code"], "DEPENDENCY_CYCLE");
    assert_eq!(second["details"]["cycle"], json!(["second", "first", "second"]));

    let fetched = call(&handler, "planner", "get_task", json!({"task_id": "second"})).await;
    assert_eq!(fetched["code"], "TASK_NOT_FOUND");
    let listed = call(&handler, "planner", "list_tasks", json!({})).await;
    assert_eq!(listed["count"], 1);
}

#[tokio::test]
async fn test_batch_validates_before_writing() {
    let (_dir, handler) = setup_handler();
    let response = call(
        &handler,
        "planner",
        "batch_create_tasks",
        json!({"tasks": [
            {"id": "ok", "title": "Fine"},
            {"id": "bad"},
        ]}),
    )
    .await;
    assert_eq!(response["code"], "MISSING_REQUIRED_FIELD");
    assert_eq!(response["field"], "tasks[1].title");

    let listed = call(&handler, "planner", "list_tasks", json!({})).await;
    assert_eq!(listed["count"], 0);
}

#[tokio::test]
async fn test_batch_reports_partial_creation() {
    let (_dir, handler) = setup_handler();
    call(&handler, "planner", "create_task", json!({"id": "taken", "title": "First"})).await;

    let response = call(
        &handler,
        "planner",
        "batch_create_tasks",
        json!({"tasks": [
            {"id": "fresh", "title": "Fresh"},
            {"id": "taken", "title": "Duplicate"},
        ]}),
    )
    .await;
    assert_eq!(response["code"], "INVALID_STATE");
    assert_eq!(response["details"]["failed_index"], 1);
    assert_eq!(response["details"]["created"], json!(["fresh"]));
}

#[tokio::test]
async fn test_list_filters() {
    let (_dir, handler) = setup_handler();
    let parent = task_id(&call(&handler, "planner", "create_task", json!({"title": "Epic"})).await);
    let child = task_id(
        &call(
            &handler,
            "planner",
            "create_task",
            json!({"title": "Story", "parent_id": parent}),
        )
        .await,
    );
    call(&handler, "planner", "create_task", json!({"title": "Gated", "dependencies": [child]})).await;
    call(&handler, "agent-3", "claim_task", json!({"task_id": child})).await;

    let by_parent = call(&handler, "x", "list_tasks", json!({"parent_id": parent})).await;
    assert_eq!(by_parent["count"], 1);

    let by_agent = call(&handler, "x", "list_tasks", json!({"agent_id": "agent-3"})).await;
    assert_eq!(by_agent["tasks"][0]["id"], child);

    let blocked = call(&handler, "x", "list_tasks", json!({"status": "blocked"})).await;
    assert_eq!(blocked["count"], 1);

    let ready = call(&handler, "x", "list_tasks", json!({"ready": true})).await;
    assert_eq!(ready["count"], 1);
    assert_eq!(ready["tasks"][0]["id"], parent);

    let invalid = call(&handler, "x", "list_tasks", json!({"status": "sleeping"})).await;
    assert_eq!(invalid["code"], "INVALID_FIELD_VALUE");
    assert_eq!(invalid["field"], "status");
}

#[tokio::test]
async fn test_update_task() {
    let (_dir, handler) = setup_handler();
    let id = task_id(
        &call(
            &handler,
            "planner",
            "create_task",
            json!({"title": "Draft", "metadata": {"owner": "docs"}}),
        )
        .await,
    );

    let empty = call(&handler, "planner", "update_task", json!({"task_id": id})).await;
    assert_eq!(empty["code"], "MISSING_REQUIRED_FIELD");

    let updated = call(
        &handler,
        "planner",
        "update_task",
        json!({"task_id": id, "title": "Final", "metadata": {"owner": null, "tag": "v2"}}),
    )
    .await;
    assert_eq!(updated["task"]["title"], "Final");
    assert_eq!(updated["task"]["version"], 1);
    assert_eq!(updated["task"]["metadata"], json!({"tag": "v2"}));
}

#[tokio::test]
async fn test_argument_errors() {
    let (_dir, handler) = setup_handler();

    let unknown = call(&handler, "a", "delete_everything", Value::Null).await;
    assert_eq!(unknown["code"], "UNKNOWN_TOOL");

    let missing = call(&handler, "a", "claim_task", Value::Null).await;
    assert_eq!(missing["code"], "MISSING_REQUIRED_FIELD");
    assert_eq!(missing["field"], "task_id");

    let not_found = call(&handler, "a", "claim_task", json!({"task_id": "nope"})).await;
    assert_eq!(not_found["code"], "TASK_NOT_FOUND");

    let bad_deps = call(
        &handler,
        "a",
        "create_task",
        json!({"title": "t", "dependencies": "not-a-list"}),
    )
    .await;
    assert_eq!(bad_deps["code"], "INVALID_FIELD_VALUE");
}

#[tokio::test]
async fn test_history_records_mutations() {
    let (_dir, handler) = setup_handler();
    let id = task_id(&call(&handler, "agent-1", "create_task", json!({"title": "Logged"})).await);
    call(&handler, "agent-1", "claim_task", json!({"task_id": id})).await;
    call(&handler, "agent-1", "claim_task", json!({"task_id": id})).await;
    call(&handler, "agent-1", "get_task", json!({"task_id": id})).await;

    let history = call(&handler, "agent-1", "get_history", json!({})).await;
    let entries = history["entries"].as_array().unwrap();
    let actions: Vec<&str> = entries.iter().map(|e| e["action"].as_str().unwrap()).collect();
    assert_eq!(actions, vec!["create_task", "claim_task", "claim_task"]);
    assert_eq!(entries[0]["task_id"], id);
    assert_eq!(entries[1]["success"], true);
    assert_eq!(entries[2]["success"], false);
    assert_eq!(entries[2]["code"], "INVALID_STATE");

    let other = call(&handler, "agent-1", "get_history", json!({"agent_id": "agent-2"})).await;
    assert_eq!(other["entries"], json!([]));
}

#[tokio::test]
async fn test_list_agents_tool() {
    let (_dir, handler) = setup_handler();
    let agent = handler.coordinator().agents().register(None).await.unwrap();

    let response = call(&handler, &agent.id, "list_agents", json!({"online_only": true})).await;
    assert_eq!(response["count"], 1);
    assert_eq!(response["agents"][0]["id"], agent.id);
    assert_eq!(response["agents"][0]["online"], true);
    assert_eq!(response["offline_threshold_ms"], 10_000);
}

#[tokio::test]
async fn test_serve_lines_answers_each_request() {
    let (_dir, handler) = setup_handler();
    let input = concat!(
        r#"{"tool": "create_task", "args": {"id": "t1", "title": "Over the wire"}, "id": 1}"#,
        "\n",
        "\n",
        "not json\n",
        r#"{"tool": "claim_task", "args": {"task_id": "t1"}, "id": "second"}"#,
        "\n",
    );
    let mut output: Vec<u8> = Vec::new();
    serve_lines(
        &handler,
        &as_agent("agent-1"),
        BufReader::new(input.as_bytes()),
        &mut output,
    )
    .await
    .unwrap();

    let responses: Vec<Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0]["id"], 1);
    assert_eq!(responses[0]["task"]["id"], "t1");
    assert_eq!(responses[1]["code"], "INVALID_FIELD_VALUE");
    assert_eq!(responses[2]["id"], "second");
    assert_eq!(responses[2]["task"]["assigned_to"], "agent-1");
}

#[tokio::test]
async fn test_claim_by_unregistered_caller_is_swept() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn Store> = Arc::new(FileStore::open(dir.path(), Default::default()).unwrap());
    let coordinator = Arc::new(Coordinator::with_store(store, &Config::default()));
    let handler = ToolHandler::new(coordinator.clone());

    let claim = handler
        .get_tools()
        .into_iter()
        .find(|t| t.name == "claim_task")
        .unwrap();
    assert!(claim.description.contains("recovery sweep"));

    let id = task_id(&call(&handler, "planner", "create_task", json!({"title": "One-shot"})).await);
    let claimed = call(&handler, "cli", "claim_task", json!({"task_id": id})).await;
    assert_eq!(claimed["task"]["assigned_to"], "cli");

    let report = coordinator.sweeper().sweep().await.unwrap();
    assert_eq!(report.released, vec![id.clone()]);
    let fetched = call(&handler, "planner", "get_task", json!({"task_id": id})).await;
    assert_eq!(fetched["task"]["status"], "pending");
}
