//! Runner supervision.
//!
//! The [`Manager`] owns a LIFO stack of concurrently composable runners.
//! Each frame gets a driver task that consumes the runner's event stream,
//! forwards events to the injected listener and feeds replies back. The
//! manager implements stop, restart, edit-history and nested workflow
//! launches: a `START_WORKFLOW` event pushes a child frame, the parent
//! stays parked on its reply until the child terminates, and the child's
//! last final message lands on the parent as a `workflow_result` step.

pub mod autocomplete;
pub mod commands;
pub mod endpoint;
pub mod proto;
pub mod server;

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use skein_checkpoint::WorkflowStateManager;
use skein_core::executor::ExecutorRegistry;
use skein_core::project::ProjectContext;
use skein_core::proto::{RunEventKind, RunEventReq, RunEventResp, RunStats, StartWorkflowPayload};
use skein_core::state::{Message, Step, StepType, ToolCallResp};
use skein_core::{Graph, Runner, Workflow};

use crate::error::{Result, ServerError};

/// Receives every runner event; the returned response is fed back into
/// the runner (`None` defers to the manager's default handling).
#[async_trait]
pub trait RunEventListener: Send + Sync {
    async fn on_run_event(
        &self,
        frame: &Arc<RunnerFrame>,
        event: &RunEventReq,
    ) -> Option<RunEventResp>;
}

/// One entry of the runner stack.
pub struct RunnerFrame {
    pub workflow_name: String,
    pub runner: Arc<Runner>,
    pub initial_message: Option<Message>,
    driver: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    last_stats: parking_lot::Mutex<Option<RunStats>>,
}

impl RunnerFrame {
    pub fn last_stats(&self) -> Option<RunStats> {
        self.last_stats.lock().clone()
    }

    fn take_driver(&self) -> Option<tokio::task::JoinHandle<()>> {
        self.driver.lock().take()
    }

    /// Wait for this frame's driver task to end.
    pub async fn wait(&self) {
        if let Some(driver) = self.take_driver() {
            let _ = driver.await;
        }
    }
}

pub struct Manager {
    weak_self: Weak<Manager>,
    project: Arc<dyn ProjectContext>,
    registry: ExecutorRegistry,
    listener: parking_lot::Mutex<Option<Weak<dyn RunEventListener>>>,
    stack: parking_lot::Mutex<Vec<Arc<RunnerFrame>>>,
    state_manager: parking_lot::Mutex<Option<Arc<WorkflowStateManager>>>,
    started: AtomicBool,
}

impl Manager {
    pub fn new(project: Arc<dyn ProjectContext>, registry: ExecutorRegistry) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            project,
            registry,
            listener: parking_lot::Mutex::new(None),
            stack: parking_lot::Mutex::new(Vec::new()),
            state_manager: parking_lot::Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn project(&self) -> Arc<dyn ProjectContext> {
        self.project.clone()
    }

    pub fn set_listener(&self, listener: Weak<dyn RunEventListener>) {
        *self.listener.lock() = Some(listener);
    }

    pub fn set_state_manager(&self, manager: Arc<WorkflowStateManager>) {
        *self.state_manager.lock() = Some(manager);
    }

    pub fn runner_stack(&self) -> Vec<Arc<RunnerFrame>> {
        self.stack.lock().clone()
    }

    pub fn current_frame(&self) -> Option<Arc<RunnerFrame>> {
        self.stack.lock().last().cloned()
    }

    pub fn current_runner(&self) -> Option<Arc<Runner>> {
        self.current_frame().map(|f| f.runner.clone())
    }

    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.project.start().await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let frames: Vec<Arc<RunnerFrame>> = {
            let mut stack = self.stack.lock();
            let frames = stack.clone();
            stack.clear();
            frames
        };
        for frame in frames.iter().rev() {
            frame.runner.stop();
        }
        for frame in frames.iter().rev() {
            frame.wait().await;
            let _ = frame.runner.shutdown_executors().await;
        }
        self.project.set_current_workflow(None);
        if self.started.swap(false, Ordering::SeqCst) {
            self.project.shutdown().await?;
        }
        Ok(())
    }

    fn build_workflow(&self, workflow_name: &str) -> Result<Workflow> {
        let settings = self.project.settings();
        let config = settings
            .workflows
            .get(workflow_name)
            .ok_or_else(|| ServerError::UnknownWorkflow(workflow_name.to_string()))?;
        let name = config.name.clone().unwrap_or_else(|| workflow_name.to_string());
        let graph = Graph::new(config.nodes.clone(), config.edges.clone());
        Ok(Workflow::new(name, graph))
    }

    /// Materialize a workflow, push its frame and start the driver task.
    ///
    /// Boxed explicitly (rather than `async fn`) because this method and
    /// [`Self::handle_start_workflow`] call each other across a spawned
    /// task, which makes the opaque `async fn` return type self-referential
    /// and unable to resolve its `Send` bound.
    pub fn start_workflow<'a>(
        &'a self,
        workflow_name: &'a str,
        initial_message: Option<Message>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Arc<RunnerFrame>>> + Send + 'a>>
    {
        Box::pin(async move {
            let workflow = self.build_workflow(workflow_name)?;
            let runner = Arc::new(Runner::new(
                workflow,
                self.project.clone(),
                &self.registry,
                initial_message.clone(),
            )?);
            runner.init_executors().await?;

            if let Some(state_manager) = self.state_manager.lock().clone() {
                state_manager.track(runner.execution());
            }

            let stream = runner.run()?;
            let frame = Arc::new(RunnerFrame {
                workflow_name: workflow_name.to_string(),
                runner,
                initial_message,
                driver: parking_lot::Mutex::new(None),
                last_stats: parking_lot::Mutex::new(None),
            });
            self.stack.lock().push(frame.clone());
            self.project
                .set_current_workflow(Some(workflow_name.to_string()));

            let manager = self
                .weak_self
                .upgrade()
                .expect("manager alive while starting workflows");
            let driver_frame = frame.clone();
            let driver = tokio::spawn(async move {
                manager.drive_frame(driver_frame, stream).await;
            });
            *frame.driver.lock() = Some(driver);

            Ok(frame)
        })
    }

    async fn drive_frame(
        self: Arc<Self>,
        frame: Arc<RunnerFrame>,
        mut stream: skein_core::RunEventStream,
    ) {
        while let Some(item) = stream.next().await {
            match item {
                Ok((event, reply)) => {
                    if event.kind == RunEventKind::Status {
                        *frame.last_stats.lock() = event.stats.clone();
                    }
                    self.mark_dirty(&frame);

                    let listener_resp = self.notify_listener(&frame, &event).await;
                    let resp = match event.kind {
                        RunEventKind::StartWorkflow => {
                            let payload = event
                                .start_workflow
                                .clone()
                                .expect("start_workflow events carry a payload");
                            self.handle_start_workflow(&frame, payload).await
                        }
                        _ => listener_resp.unwrap_or_else(RunEventResp::noop),
                    };
                    reply.send(resp);
                }
                Err(error) => {
                    tracing::error!(
                        workflow = %frame.workflow_name,
                        %error,
                        "runner raised a fatal error"
                    );
                }
            }
        }
        self.on_runner_finished(&frame).await;
    }

    fn mark_dirty(&self, frame: &Arc<RunnerFrame>) {
        if let Some(state_manager) = self.state_manager.lock().clone() {
            state_manager.notify_changed(frame.runner.execution());
        }
    }

    async fn notify_listener(
        &self,
        frame: &Arc<RunnerFrame>,
        event: &RunEventReq,
    ) -> Option<RunEventResp> {
        let listener = self.listener.lock().clone()?;
        let listener = listener.upgrade()?;
        listener.on_run_event(frame, event).await
    }

    /// Launch the requested child workflow, wait for it to terminate and
    /// append the `workflow_result` step to the parent's current node
    /// execution. The parent stays parked on this event's reply the whole
    /// time, which is what gives the stack its strict LIFO ordering.
    async fn handle_start_workflow(
        &self,
        parent: &Arc<RunnerFrame>,
        payload: StartWorkflowPayload,
    ) -> RunEventResp {
        match self
            .start_workflow(&payload.workflow_name, payload.initial_message.clone())
            .await
        {
            Ok(child) => {
                child.wait().await;
                if child.runner.status() != skein_core::RunnerStatus::Finished {
                    // A child halted mid-flight must not shadow the parent
                    // at the top of the stack.
                    let _ = child.runner.shutdown_executors().await;
                    self.remove_frame(&child);
                }
                let final_message = child.runner.last_final_message();
                self.attach_workflow_result(parent, &payload, final_message, None);
            }
            Err(error) => {
                tracing::warn!(
                    workflow = %payload.workflow_name,
                    %error,
                    "nested workflow failed to start"
                );
                self.attach_workflow_result(parent, &payload, None, Some(error.to_string()));
            }
        }
        RunEventResp::noop()
    }

    fn attach_workflow_result(
        &self,
        parent: &Arc<RunnerFrame>,
        payload: &StartWorkflowPayload,
        final_message: Option<Message>,
        error: Option<String>,
    ) {
        let shared = parent.runner.execution();
        let mut run = shared.lock();
        let Some(execution_id) = run.last_step().map(|s| s.execution_id) else {
            return;
        };
        let response_text = final_message.map(|m| m.text).unwrap_or_default();
        let result = match error {
            Some(error) => json!({"agent_name": payload.workflow_name, "error": error}),
            None => json!({
                "agent_name": payload.workflow_name,
                "response": response_text,
            }),
        };
        let response =
            ToolCallResp::completed(payload.tool_call_id.clone(), payload.tool_name.clone(), result);
        let step = Step::new(execution_id, StepType::WorkflowResult).with_message(
            Message::tool(response_text).with_tool_responses(vec![response]),
        );
        run.upsert_step(step);
    }

    /// Driver drained: finished runners leave the stack and release their
    /// executors; stopped runners stay resumable (frame kept, routes and
    /// other executor resources left in place).
    async fn on_runner_finished(&self, frame: &Arc<RunnerFrame>) {
        self.mark_dirty(frame);
        if frame.runner.status() != skein_core::RunnerStatus::Finished {
            return;
        }
        {
            let mut stack = self.stack.lock();
            stack.retain(|f| !Arc::ptr_eq(f, frame));
            self.project
                .set_current_workflow(stack.last().map(|f| f.workflow_name.clone()));
        }
        if let Err(error) = frame.runner.shutdown_executors().await {
            tracing::warn!(%error, "executor teardown failed");
        }
    }

    fn remove_frame(&self, frame: &Arc<RunnerFrame>) {
        let mut stack = self.stack.lock();
        stack.retain(|f| !Arc::ptr_eq(f, frame));
        self.project
            .set_current_workflow(stack.last().map(|f| f.workflow_name.clone()));
    }

    /// Stop the top frame and wait for its driver to drain.
    pub async fn stop_current_runner(&self) {
        let Some(frame) = self.current_frame() else {
            return;
        };
        frame.runner.stop();
        frame.wait().await;
    }

    /// Stop the current runner and start the same workflow again.
    pub async fn restart_current_runner(
        &self,
        initial_message: Option<Message>,
    ) -> Result<Arc<RunnerFrame>> {
        let frame = self
            .current_frame()
            .ok_or_else(|| ServerError::Configuration("No active runner to restart".into()))?;
        let workflow_name = frame.workflow_name.clone();
        let message = initial_message.or_else(|| frame.initial_message.clone());
        self.stop_current_runner().await;
        let _ = frame.runner.shutdown_executors().await;
        self.remove_frame(&frame);
        self.start_workflow(&workflow_name, message).await
    }

    /// Rewrite the most recent user input.
    ///
    /// Walks the stack from the top to the frame whose runner holds the
    /// last `input_message`, stops every frame above it, then rewrites the
    /// step and truncates everything after it.
    pub async fn edit_history_with_text(&self, text: &str) -> bool {
        let frames = self.runner_stack();
        let Some(target_index) = frames
            .iter()
            .rposition(|frame| frame.runner.has_input_message())
        else {
            return false;
        };
        for frame in frames[target_index + 1..].iter().rev() {
            frame.runner.stop();
            frame.wait().await;
        }
        frames[target_index].runner.edit_history_with_text(text)
    }
}
