//! Nested workflow execution through the manager (parent tool call spawns
//! a child workflow whose final message lands back on the parent).

use async_stream::try_stream;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use skein_core::config::{Settings, ToolSpec};
use skein_core::executor::{Executor, ExecutorInput, ExecutorRegistry, StepStream};
use skein_core::testing::StubProject;
use skein_core::tools::{Tool, ToolReq, ToolResponse};
use skein_core::{Message, RunnerStatus, Step, StepType, ToolCallReq};
use skein_server::Manager;

/// Parent node executor: requests the nested workflow once, then reports.
struct StartNestedWorkflowExecutor;

impl Executor for StartNestedWorkflowExecutor {
    fn run(&self, input: ExecutorInput) -> StepStream {
        Box::pin(try_stream! {
            let execution = input.execution;
            let has_result = execution
                .steps
                .iter()
                .any(|s| s.step_type == StepType::WorkflowResult && s.is_complete);
            let message = if has_result {
                Message::assistant("after-nested")
            } else {
                Message::assistant("before-nested").with_tool_requests(vec![ToolCallReq::new(
                    "call-nested",
                    "nested-workflow-test-tool",
                    json!({"text": "parent-input"}),
                )])
            };
            let step = Step::new(execution.id, StepType::OutputMessage).with_message(message);
            yield step;
        })
    }
}

/// Child node executor: echoes its initial input message.
struct ChildEchoInitialExecutor;

impl Executor for ChildEchoInitialExecutor {
    fn run(&self, input: ExecutorInput) -> StepStream {
        Box::pin(try_stream! {
            let execution = input.execution;
            let text = execution
                .input_messages
                .last()
                .map(|m| m.text.clone())
                .unwrap_or_default();
            let step = Step::new(execution.id, StepType::OutputMessage)
                .with_message(Message::assistant(format!("child-final:{text}")));
            yield step;
        })
    }
}

/// Tool emitting the start-workflow directive.
struct NestedWorkflowTool;

#[async_trait]
impl Tool for NestedWorkflowTool {
    fn name(&self) -> &str {
        "nested-workflow-test-tool"
    }

    async fn run(&self, _req: ToolReq, args: Value) -> skein_core::Result<ToolResponse> {
        let text = args
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(ToolResponse::StartWorkflow {
            workflow: "child".to_string(),
            initial_text: text,
            initial_message: None,
        })
    }

    async fn openapi_spec(&self, _spec: &ToolSpec) -> skein_core::Result<Value> {
        Ok(json!({"name": self.name()}))
    }
}

fn nested_settings() -> Settings {
    let mut settings: Settings = serde_json::from_value(json!({
        "workflows": {
            "parent": {
                "nodes": [{
                    "name": "parent-node",
                    "type": "tool-start-nested-workflow",
                    "confirmation": "auto",
                }],
                "edges": [],
            },
            "child": {
                "nodes": [{
                    "name": "child-node",
                    "type": "child-echo-initial",
                    "confirmation": "auto",
                }],
                "edges": [],
            },
        },
        "tools": [{"name": "nested-workflow-test-tool", "auto_approve": true}],
    }))
    .unwrap();
    settings.sync_workflow_names();
    settings
}

#[tokio::test]
async fn nested_workflow_execution_via_manager() {
    let project = Arc::new(StubProject::with_settings(nested_settings()));
    project.add_tool(Arc::new(NestedWorkflowTool));

    let mut registry = ExecutorRegistry::new();
    registry.register("tool-start-nested-workflow", |_, _| {
        Ok(Arc::new(StartNestedWorkflowExecutor) as _)
    });
    registry.register("child-echo-initial", |_, _| {
        Ok(Arc::new(ChildEchoInitialExecutor) as _)
    });

    let manager = Manager::new(project.clone(), registry);
    manager.start().await.unwrap();

    let parent = manager.start_workflow("parent", None).await.unwrap();
    let parent_runner = parent.runner.clone();
    tokio::time::timeout(std::time::Duration::from_secs(5), parent.wait())
        .await
        .expect("parent workflow finished");

    assert_eq!(parent_runner.status(), RunnerStatus::Finished);

    let shared = parent_runner.execution();
    let run = shared.lock();
    let parent_exec = run
        .node_executions
        .values()
        .find(|ne| ne.node == "parent-node")
        .expect("parent execution exists");

    // The tool call produced a workflow_request then, after the child
    // terminated, a workflow_result answering the call id.
    assert!(parent_exec
        .steps
        .iter()
        .any(|s| s.step_type == StepType::WorkflowRequest));
    let result_step = parent_exec
        .steps
        .iter()
        .find(|s| s.step_type == StepType::WorkflowResult)
        .expect("workflow_result step");
    let response = &result_step.message.as_ref().unwrap().tool_call_responses[0];
    assert_eq!(response.id, "call-nested");
    let payload = response.result.as_ref().unwrap();
    assert_eq!(payload["agent_name"], "child");
    assert_eq!(payload["response"], "child-final:parent-input");

    // The parent's final pass saw the result.
    let final_step = parent_exec.final_step().unwrap();
    assert_eq!(final_step.message.as_ref().unwrap().text, "after-nested");

    // The child frame was popped once it finished.
    assert!(manager.runner_stack().is_empty());
    drop(run);
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_child_workflow_reports_error_result() {
    let mut settings = nested_settings();
    settings.workflows.remove("child");
    let project = Arc::new(StubProject::with_settings(settings));
    project.add_tool(Arc::new(NestedWorkflowTool));

    let mut registry = ExecutorRegistry::new();
    registry.register("tool-start-nested-workflow", |_, _| {
        Ok(Arc::new(StartNestedWorkflowExecutor) as _)
    });
    registry.register("child-echo-initial", |_, _| {
        Ok(Arc::new(ChildEchoInitialExecutor) as _)
    });

    let manager = Manager::new(project, registry);
    manager.start().await.unwrap();
    let parent = manager.start_workflow("parent", None).await.unwrap();
    let runner = parent.runner.clone();
    tokio::time::timeout(std::time::Duration::from_secs(5), parent.wait())
        .await
        .expect("parent workflow finished");

    let shared = runner.execution();
    let run = shared.lock();
    let result_step = run
        .steps()
        .into_iter()
        .find(|s| s.step_type == StepType::WorkflowResult)
        .expect("workflow_result step")
        .clone();
    let payload = result_step.message.as_ref().unwrap().tool_call_responses[0]
        .result
        .clone()
        .unwrap();
    assert_eq!(payload["agent_name"], "child");
    assert!(payload["error"].as_str().unwrap().contains("child"));
    drop(run);
    manager.stop().await.unwrap();
}
