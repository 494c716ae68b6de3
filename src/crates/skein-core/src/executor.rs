//! Executor protocol and registry.
//!
//! An executor is the worker bound to a node type. It consumes an
//! [`ExecutorInput`] and produces an incremental stream of [`Step`]s:
//! partial steps may repeat the same id with `is_complete = false`, and
//! exactly one complete step must terminate every run. Yielding zero or
//! several complete steps is a contract violation detected by the runner.

use async_trait::async_trait;
use futures::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::model::Node;
use crate::project::ProjectContext;
use crate::state::{Message, NodeExecution, SharedExecution, Step, StepType};

/// Boxed incremental step stream produced by one executor run.
pub type StepStream = Pin<Box<dyn Stream<Item = Result<Step>> + Send>>;

/// Input for a single executor run.
#[derive(Clone)]
pub struct ExecutorInput {
    /// Snapshot of the node execution being driven.
    pub execution: NodeExecution,
    /// Shared handle to the full workflow execution, for history walks.
    pub run: SharedExecution,
}

/// The polymorphic worker bound to a node type.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Called once when the owning runner is constructed. Executors that
    /// hold external resources (HTTP routes, sockets) acquire them here.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Called when the owning runner is torn down.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Produce the step stream for one run over the given input.
    fn run(&self, input: ExecutorInput) -> StepStream;
}

/// Factory building an executor for a node.
pub type ExecutorFactory =
    Arc<dyn Fn(&Node, Arc<dyn ProjectContext>) -> Result<Arc<dyn Executor>> + Send + Sync>;

/// Maps node type strings to executor constructors.
///
/// The registry is explicit rather than global so embedders and tests can
/// extend or replace the built-in set per runner.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    factories: HashMap<String, ExecutorFactory>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in executor types registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("input", |node, project| {
            Ok(Arc::new(crate::executors::InputExecutor::new(node, project)?) as Arc<dyn Executor>)
        });
        registry.register("exec", |node, project| {
            Ok(Arc::new(crate::executors::ExecExecutor::new(node, project)?) as Arc<dyn Executor>)
        });
        registry.register("llm", |node, project| {
            Ok(Arc::new(crate::executors::LlmExecutor::new(node, project)?) as Arc<dyn Executor>)
        });
        registry.register("apply_patch", |node, project| {
            Ok(Arc::new(crate::executors::ApplyPatchExecutor::new(node, project)?)
                as Arc<dyn Executor>)
        });
        registry
    }

    pub fn register<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&Node, Arc<dyn ProjectContext>) -> Result<Arc<dyn Executor>> + Send + Sync + 'static,
    {
        self.factories.insert(type_name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn create_for_node(
        &self,
        node: &Node,
        project: Arc<dyn ProjectContext>,
    ) -> Result<Arc<dyn Executor>> {
        let factory = self
            .factories
            .get(&node.node_type)
            .ok_or_else(|| CoreError::UnknownExecutorType(node.node_type.clone()))?;
        factory(node, project)
    }
}

/// Collect the message history of an execution chain, oldest first.
///
/// Walks the `previous` links back to the first execution of the node,
/// then yields each execution's input messages followed by its step
/// messages. The paired [`StepType`] is `None` for input messages.
pub fn iter_execution_messages(
    run: &crate::state::WorkflowExecution,
    execution_id: uuid::Uuid,
) -> Vec<(Message, Option<StepType>)> {
    let mut chain: Vec<&NodeExecution> = Vec::new();
    let mut current = run.node_execution(execution_id);
    while let Some(execution) = current {
        chain.push(execution);
        current = execution.previous_id.and_then(|id| run.node_execution(id));
    }

    let mut out = Vec::new();
    for execution in chain.into_iter().rev() {
        for msg in &execution.input_messages {
            out.push((msg.clone(), None));
        }
        for step in &execution.steps {
            if let Some(msg) = &step.message {
                out.push((msg.clone(), Some(step.step_type)));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RunStatus, WorkflowExecution};

    #[test]
    fn iter_execution_messages_walks_previous_chain() {
        let mut run = WorkflowExecution::new("wf");

        let mut first = NodeExecution::new("n");
        first.status = RunStatus::Finished;
        first.input_messages = vec![Message::user("first-in")];
        let first_id = first.id;
        run.insert_node_execution(first);
        let step = Step::new(first_id, StepType::OutputMessage)
            .with_message(Message::assistant("first-out"));
        run.upsert_step(step);

        let mut second = NodeExecution::new("n");
        second.previous_id = Some(first_id);
        second.input_messages = vec![Message::user("second-in")];
        let second_id = second.id;
        run.insert_node_execution(second);

        let history = iter_execution_messages(&run, second_id);
        let texts: Vec<&str> = history.iter().map(|(m, _)| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first-in", "first-out", "second-in"]);
        assert_eq!(history[1].1, Some(StepType::OutputMessage));
        assert_eq!(history[0].1, None);
    }

    #[test]
    fn registry_rejects_unknown_type() {
        let registry = ExecutorRegistry::new();
        let node = Node::new("x", "mystery");
        let project = Arc::new(crate::testing::StubProject::new());
        let err = registry.create_for_node(&node, project).unwrap_err();
        assert!(matches!(err, CoreError::UnknownExecutorType(t) if t == "mystery"));
    }
}
