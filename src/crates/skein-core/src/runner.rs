//! Workflow runner.
//!
//! A runner drives one [`WorkflowExecution`] over a validated graph: it
//! resumes or creates the current node execution, drives one executor at a
//! time, mediates prompts, confirmations and tool calls with its driver
//! through the event protocol, and follows outcome edges until the graph
//! is exhausted.
//!
//! Lifecycle: `idle -> running <-> stopped -> running ... -> finished`.
//! `run()` is callable only from idle or stopped. Stopping is cooperative:
//! the stop signal is observed at every await point, in-flight executor
//! streams are dropped, and the last emitted step stays intact so the next
//! `run()` resumes exactly where the previous one left off.

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::executor::{Executor, ExecutorInput, ExecutorRegistry};
use crate::model::{Confirmation, Graph, Node, ResultMode, RuntimeGraph, StateResetPolicy};
use crate::project::ProjectContext;
use crate::proto::{
    RunEventKind, RunEventReq, RunEventResp, RunEventResponseType, RunEventSender, RunEventStream,
    RunStats, StartWorkflowPayload,
};
use crate::state::{
    shared, Message, NodeExecution, RunStatus, RunnerStatus, SharedExecution, Step, StepType,
    ToolCallReq, ToolCallReqStatus, ToolCallResp, WorkflowExecution,
};
use crate::tools::{ToolReq, ToolResponse};

/// A named workflow: graph plus display name.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub graph: Graph,
}

impl Workflow {
    pub fn new(name: impl Into<String>, graph: Graph) -> Self {
        Self {
            name: name.into(),
            graph,
        }
    }
}

/// Driver of one workflow execution.
pub struct Runner {
    workflow_name: String,
    graph: RuntimeGraph,
    project: Arc<dyn ProjectContext>,
    initial_message: Option<Message>,
    execution: SharedExecution,
    executors: HashMap<String, Arc<dyn Executor>>,
    status: parking_lot::Mutex<RunnerStatus>,
    stop_tx: tokio::sync::watch::Sender<bool>,
    last_final_message: parking_lot::Mutex<Option<Message>>,
    run_counts: parking_lot::Mutex<HashMap<String, u32>>,
}

impl Runner {
    /// Build a runner for a fresh execution.
    pub fn new(
        workflow: Workflow,
        project: Arc<dyn ProjectContext>,
        registry: &ExecutorRegistry,
        initial_message: Option<Message>,
    ) -> Result<Self> {
        let execution = WorkflowExecution::new(workflow.name.clone());
        Self::with_execution(workflow, project, registry, initial_message, execution)
    }

    /// Build a runner resuming a persisted execution.
    pub fn with_execution(
        workflow: Workflow,
        project: Arc<dyn ProjectContext>,
        registry: &ExecutorRegistry,
        initial_message: Option<Message>,
        execution: WorkflowExecution,
    ) -> Result<Self> {
        let graph = RuntimeGraph::new(workflow.graph)?;
        let mut executors: HashMap<String, Arc<dyn Executor>> = HashMap::new();
        for node in &graph.graph().nodes {
            executors.insert(
                node.name.clone(),
                registry.create_for_node(node, project.clone())?,
            );
        }
        let mut run_counts: HashMap<String, u32> = HashMap::new();
        for ne in execution.node_executions.values() {
            *run_counts.entry(ne.node.clone()).or_insert(0) += 1;
        }
        let (stop_tx, _) = tokio::sync::watch::channel(false);
        Ok(Self {
            workflow_name: workflow.name,
            graph,
            project,
            initial_message,
            execution: shared(execution),
            executors,
            status: parking_lot::Mutex::new(RunnerStatus::Idle),
            stop_tx,
            last_final_message: parking_lot::Mutex::new(None),
            run_counts: parking_lot::Mutex::new(run_counts),
        })
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn graph(&self) -> &RuntimeGraph {
        &self.graph
    }

    pub fn status(&self) -> RunnerStatus {
        *self.status.lock()
    }

    pub fn execution(&self) -> SharedExecution {
        self.execution.clone()
    }

    pub fn last_final_message(&self) -> Option<Message> {
        self.last_final_message.lock().clone()
    }

    /// Initialize all executors (route registration and the like).
    pub async fn init_executors(&self) -> Result<()> {
        for executor in self.executors.values() {
            executor.init().await?;
        }
        Ok(())
    }

    /// Tear down all executors.
    pub async fn shutdown_executors(&self) -> Result<()> {
        for executor in self.executors.values() {
            executor.shutdown().await?;
        }
        Ok(())
    }

    /// Request a cooperative stop. Observed at the next await boundary.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Whether a stop has been requested but not yet observed.
    pub fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Whether the execution contains any input_message step.
    pub fn has_input_message(&self) -> bool {
        let run = self.execution.lock();
        run.steps()
            .iter()
            .any(|s| s.step_type == StepType::InputMessage)
    }

    /// Replace the text of the last input_message step and discard every
    /// later step, so the conversation can be replayed from that point.
    pub fn edit_history_with_text(&self, text: &str) -> bool {
        let mut run = self.execution.lock();
        let Some(pos) = run.step_order.iter().rposition(|id| {
            run.step(*id)
                .map(|s| s.step_type == StepType::InputMessage)
                .unwrap_or(false)
        }) else {
            return false;
        };
        let target_id = run.step_order[pos];
        let to_delete: Vec<Uuid> = run.step_order[pos + 1..].to_vec();

        let mut target_execution_id = None;
        for execution in run.node_executions.values_mut() {
            if let Some(step) = execution.steps.iter_mut().find(|s| s.id == target_id) {
                match step.message.as_mut() {
                    Some(message) => message.text = text.to_string(),
                    None => step.message = Some(Message::user(text)),
                }
                target_execution_id = Some(execution.id);
                break;
            }
        }
        run.delete_steps(&to_delete);
        if let Some(execution_id) = target_execution_id {
            if let Some(execution) = run.node_execution_mut(execution_id) {
                execution.status = RunStatus::Running;
                for step in execution.steps.iter_mut() {
                    step.is_final = false;
                }
            }
        }
        run.trim_empty_node_executions();
        run.touch();
        true
    }

    /// Start or resume the run loop.
    ///
    /// Returns the event stream the driver must consume; every event must
    /// be answered through its responder for the runner to make progress.
    pub fn run(self: &Arc<Self>) -> Result<RunEventStream> {
        {
            let mut status = self.status.lock();
            if !matches!(*status, RunnerStatus::Idle | RunnerStatus::Stopped) {
                return Err(CoreError::Contract(format!(
                    "run() not allowed when runner status is '{status:?}'; allowed: idle, stopped"
                )));
            }
            *status = RunnerStatus::Running;
        }
        let _ = self.stop_tx.send(false);

        let (sender, stream) = RunEventSender::channel();
        let runner = self.clone();
        tokio::spawn(async move {
            let mut driver = RunnerLoop {
                runner: runner.clone(),
                events: sender,
                stop: runner.stop_tx.subscribe(),
            };
            driver.drive().await;
        });
        Ok(stream)
    }

    fn set_status(&self, status: RunnerStatus) {
        *self.status.lock() = status;
    }
}

/// How an existing node execution is entered.
///
/// `force_run` is set when a `keep` edge re-enters an execution with fresh
/// input messages; the executor must run again even though the trailing
/// step looks like a finished output.
#[derive(Clone, Copy)]
struct EnterExecution {
    id: Uuid,
    force_run: bool,
}

/// Outcome of post-run handling for one executor pass.
enum PostRun {
    /// Re-invoke the executor on the same node execution.
    Rerun,
    /// Move to the next node.
    Next {
        node: String,
        exec: Option<EnterExecution>,
        inputs: Option<Vec<Message>>,
    },
    /// The graph is exhausted.
    Done,
}

struct RunnerLoop {
    runner: Arc<Runner>,
    events: RunEventSender,
    stop: tokio::sync::watch::Receiver<bool>,
}

impl RunnerLoop {
    async fn drive(&mut self) {
        let result = self.run_loop().await;
        match result {
            Ok(()) => {
                self.runner.set_status(RunnerStatus::Finished);
                let _ = self
                    .events
                    .emit_final(self.status_event(RunnerStatus::Finished))
                    .await;
            }
            Err(CoreError::Canceled) => {
                self.mark_current_execution(RunStatus::Stopped);
                self.runner.set_status(RunnerStatus::Stopped);
                let _ = self
                    .events
                    .emit_final(self.status_event(RunnerStatus::Stopped))
                    .await;
            }
            Err(error) => {
                tracing::error!(workflow = %self.runner.workflow_name, %error, "runner failed");
                self.mark_current_execution(RunStatus::Stopped);
                self.runner.set_status(RunnerStatus::Stopped);
                self.events.fail(error).await;
            }
        }
    }

    fn mark_current_execution(&self, status: RunStatus) {
        let mut run = self.runner.execution.lock();
        let Some(last) = run.last_step().map(|s| s.execution_id) else {
            return;
        };
        if let Some(execution) = run.node_execution_mut(last) {
            if execution.status == RunStatus::Running {
                execution.status = status;
            }
        }
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    fn check_stop(&self) -> Result<()> {
        if self.stop_requested() {
            Err(CoreError::Canceled)
        } else {
            Ok(())
        }
    }

    fn status_event(&self, status: RunnerStatus) -> RunEventReq {
        let (execution_id, node_name, node_execution_id) = {
            let run = self.runner.execution.lock();
            let node = run
                .last_step()
                .and_then(|s| run.node_execution(s.execution_id))
                .map(|ne| (ne.node.clone(), ne.id));
            (
                run.id,
                node.as_ref().map(|(n, _)| n.clone()),
                node.map(|(_, id)| id),
            )
        };
        RunEventReq {
            kind: RunEventKind::Status,
            execution_id,
            workflow_name: self.runner.workflow_name.clone(),
            step: None,
            stats: Some(RunStats {
                status,
                current_node_name: node_name,
                current_node_execution_id: node_execution_id,
            }),
            start_workflow: None,
        }
    }

    fn step_event(&self, step: &Step) -> RunEventReq {
        let execution_id = self.runner.execution.lock().id;
        RunEventReq {
            kind: RunEventKind::Step,
            execution_id,
            workflow_name: self.runner.workflow_name.clone(),
            step: Some(step.clone()),
            stats: None,
            start_workflow: None,
        }
    }

    async fn emit_status(&mut self, status: RunnerStatus) -> Result<()> {
        let event = self.status_event(status);
        self.events.emit(event, &mut self.stop).await?;
        Ok(())
    }

    /// Append (or update) a step and surface it to the driver.
    async fn push_step(&mut self, step: Step) -> Result<RunEventResp> {
        {
            let mut run = self.runner.execution.lock();
            run.upsert_step(step.clone());
        }
        if let Some(usage) = &step.llm_usage {
            if step.is_complete {
                self.runner.project.add_llm_usage(usage);
            }
        }
        let event = self.step_event(&step);
        self.events.emit(event, &mut self.stop).await
    }

    async fn run_loop(&mut self) -> Result<()> {
        // Starting point: the node execution owning the last recorded step,
        // or the graph root for a fresh run.
        let (mut current_node, mut pending_exec): (String, Option<EnterExecution>) = {
            let run = self.runner.execution.lock();
            match run.last_step() {
                Some(step) => {
                    let ne = run
                        .node_execution(step.execution_id)
                        .ok_or_else(|| CoreError::Contract("step without execution".into()))?;
                    (
                        ne.node.clone(),
                        Some(EnterExecution {
                            id: ne.id,
                            force_run: false,
                        }),
                    )
                }
                None => (self.runner.graph.root().name.clone(), None),
            }
        };
        let mut pending_inputs: Option<Vec<Message>> = None;

        self.emit_status(RunnerStatus::Running).await?;

        'nodes: loop {
            self.check_stop()?;

            let node = self
                .runner
                .graph
                .node(&current_node)
                .ok_or_else(|| {
                    CoreError::Contract(format!("unknown node '{current_node}' in traversal"))
                })?
                .clone();

            // A skipped or exhausted node passes its inputs straight through.
            let runs_so_far = *self.runner.run_counts.lock().get(&node.name).unwrap_or(&0);
            let exhausted = node.max_runs.map(|m| runs_so_far >= m).unwrap_or(false);
            if node.skip || exhausted {
                let inputs = self.take_inputs(&mut pending_inputs);
                let mut execution = NodeExecution::new(node.name.clone());
                execution.input_messages = inputs.clone();
                execution.status = RunStatus::Finished;
                execution.previous_id = {
                    let run = self.runner.execution.lock();
                    run.latest_execution_of(&node.name).map(|ne| ne.id)
                };
                self.runner
                    .execution
                    .lock()
                    .insert_node_execution(execution);

                let Some(slot) = node.outcomes.first() else {
                    break 'nodes;
                };
                let target = self.edge_target(&node, &slot.name.clone())?;
                current_node = target;
                pending_exec = None;
                pending_inputs = Some(inputs);
                continue 'nodes;
            }

            // Resolve or create the node execution for this pass.
            let entered = pending_exec.take();
            let force_run = entered.map(|e| e.force_run).unwrap_or(false);
            let exec_id = match entered {
                Some(enter) => {
                    let mut run = self.runner.execution.lock();
                    if let Some(ne) = run.node_execution_mut(enter.id) {
                        ne.status = RunStatus::Running;
                    }
                    enter.id
                }
                None => {
                    let inputs = self.take_inputs(&mut pending_inputs);
                    let mut run = self.runner.execution.lock();
                    let mut execution = NodeExecution::new(node.name.clone());
                    execution.previous_id =
                        run.latest_execution_of(&node.name).map(|ne| ne.id);
                    execution.input_messages = inputs;
                    let id = execution.id;
                    run.insert_node_execution(execution);
                    id
                }
            };
            *self
                .runner
                .run_counts
                .lock()
                .entry(node.name.clone())
                .or_insert(0) += 1;

            self.emit_status(RunnerStatus::Running).await?;

            // Resume analysis: finalized executions go straight to
            // traversal; a trailing complete output becomes the candidate;
            // anything else re-runs the executor after trimming stale
            // transient steps.
            enum Entry {
                Traverse(Step),
                Candidate(Step),
                RunExecutor,
            }
            let entry = {
                let mut run = self.runner.execution.lock();
                let ne = run
                    .node_execution(exec_id)
                    .ok_or_else(|| CoreError::Contract("missing node execution".into()))?;
                if let Some(final_step) = ne.final_step() {
                    Entry::Traverse(final_step.clone())
                } else {
                    let mut to_trim: Vec<Uuid> = Vec::new();
                    for step in ne.steps.iter().rev() {
                        let transient = !step.is_complete
                            || matches!(
                                step.step_type,
                                StepType::Prompt | StepType::PromptConfirm
                            );
                        if transient {
                            to_trim.push(step.id);
                        } else {
                            break;
                        }
                    }
                    if !to_trim.is_empty() {
                        run.delete_steps(&to_trim);
                    }
                    let ne = run.node_execution(exec_id).unwrap();
                    match ne.steps.last() {
                        Some(last)
                            if !force_run
                                && last.is_complete
                                && last.step_type == StepType::OutputMessage =>
                        {
                            Entry::Candidate(last.clone())
                        }
                        _ => Entry::RunExecutor,
                    }
                }
            };

            let first_pass = match entry {
                Entry::Traverse(final_step) => {
                    match self.transition(&node, exec_id, &final_step)? {
                        Some((next, exec, inputs)) => {
                            current_node = next;
                            pending_exec = exec;
                            pending_inputs = inputs;
                            continue 'nodes;
                        }
                        None => break 'nodes,
                    }
                }
                Entry::Candidate(step) => {
                    Some((step, RunEventResp::noop()))
                }
                Entry::RunExecutor => None,
            };

            // Executor/post-run cycle for this node execution.
            let mut resumed = first_pass;
            'rerun: loop {
                self.check_stop()?;
                let (terminal, resp) = match resumed.take() {
                    Some(pair) => pair,
                    None => self.drive_executor(&node, exec_id).await?,
                };

                match self.post_run(&node, exec_id, terminal, resp).await? {
                    PostRun::Rerun => continue 'rerun,
                    PostRun::Next { node: next, exec, inputs } => {
                        current_node = next;
                        pending_exec = exec;
                        pending_inputs = inputs;
                        continue 'nodes;
                    }
                    PostRun::Done => break 'nodes,
                }
            }
        }

        Ok(())
    }

    fn take_inputs(&self, pending: &mut Option<Vec<Message>>) -> Vec<Message> {
        if let Some(inputs) = pending.take() {
            return inputs;
        }
        let run = self.runner.execution.lock();
        if run.node_executions.is_empty() {
            self.runner
                .initial_message
                .clone()
                .map(|m| vec![m])
                .unwrap_or_default()
        } else {
            Vec::new()
        }
    }

    fn edge_target(&self, node: &Node, outcome: &str) -> Result<String> {
        self.runner
            .graph
            .edge(&node.name, outcome)
            .map(|e| e.target_node.clone())
            .ok_or_else(|| CoreError::Contract(format!(
                "no edge for outcome '{outcome}' on node '{}'",
                node.name
            )))
    }

    /// Drive one executor pass; returns the terminal complete step and the
    /// listener's response to it.
    async fn drive_executor(
        &mut self,
        node: &Node,
        exec_id: Uuid,
    ) -> Result<(Step, RunEventResp)> {
        let executor = self
            .runner
            .executors
            .get(&node.name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownExecutorType(node.node_type.clone()))?;

        let input = {
            let run = self.runner.execution.lock();
            ExecutorInput {
                execution: run
                    .node_execution(exec_id)
                    .ok_or_else(|| CoreError::Contract("missing node execution".into()))?
                    .clone(),
                run: self.runner.execution.clone(),
            }
        };

        let mut stream = executor.run(input);
        let mut terminal: Option<(Step, RunEventResp)> = None;

        loop {
            self.check_stop()?;
            let item = {
                use futures::StreamExt;
                tokio::select! {
                    item = stream.next() => item,
                    _ = self.stop.wait_for(|stopped| *stopped) => return Err(CoreError::Canceled),
                }
            };
            let Some(item) = item else { break };

            let step = match item {
                Ok(step) => step,
                Err(e) if e.is_canceled() => return Err(CoreError::Canceled),
                Err(e) => {
                    // Executor failures outside the step protocol become a
                    // system rejection step; the node fails, the runner
                    // survives.
                    tracing::error!(node = %node.name, error = %e, "executor error");
                    let mut rejection = Step::new(exec_id, StepType::Rejection);
                    rejection.message =
                        Some(Message::system(format!("executor error: {e}")));
                    let resp = self.push_step(rejection.clone()).await?;
                    terminal = Some((rejection, resp));
                    break;
                }
            };

            if step.is_complete && terminal.is_some() {
                return Err(CoreError::Contract(format!(
                    "executor for node '{}' produced multiple complete steps",
                    node.name
                )));
            }

            let implies_waiting = step.status_hint == Some(RunnerStatus::WaitingInput)
                || (step.is_complete
                    && matches!(
                        step.step_type,
                        StepType::Prompt | StepType::PromptConfirm | StepType::ToolRequest
                    ));
            if implies_waiting {
                self.emit_status(RunnerStatus::WaitingInput).await?;
            }

            let resp = self.push_step(step.clone()).await?;
            if step.is_complete {
                terminal = Some((step, resp));
            }
        }

        terminal.ok_or_else(|| {
            CoreError::Contract(format!(
                "executor for node '{}' produced no complete step",
                node.name
            ))
        })
    }

    /// Interpret the terminal step of one executor pass.
    async fn post_run(
        &mut self,
        node: &Node,
        exec_id: Uuid,
        terminal: Step,
        resp: RunEventResp,
    ) -> Result<PostRun> {
        match terminal.step_type {
            StepType::Prompt => {
                self.handle_prompt_reply(exec_id, resp).await?;
                Ok(PostRun::Rerun)
            }
            StepType::PromptConfirm => self.confirm_flow(node, exec_id, terminal, Some(resp)).await,
            StepType::Rejection => self.finalize_rejection(node, exec_id, terminal),
            StepType::OutputMessage | StepType::ToolRequest => {
                if self.has_unhandled_tool_requests(exec_id, &terminal) {
                    return self.tool_flow(node, exec_id, terminal).await;
                }
                if terminal.is_final {
                    // Executors like exec/apply_patch pre-finalize their
                    // terminal step; no confirmation round for those.
                    self.record_final(exec_id, &terminal);
                    return match self.transition(node, exec_id, &terminal)? {
                        Some((next, exec, inputs)) => Ok(PostRun::Next {
                            node: next,
                            exec,
                            inputs,
                        }),
                        None => Ok(PostRun::Done),
                    };
                }
                match node.confirmation {
                    Confirmation::Manual => self.confirm_flow(node, exec_id, terminal, None).await,
                    Confirmation::Auto => self.finalize_and_transition(node, exec_id, terminal),
                }
            }
            // Steps that normally resume the executor; an executor ending
            // on one of these simply runs again with the longer history.
            StepType::ToolResult
            | StepType::WorkflowResult
            | StepType::InputMessage
            | StepType::Approval
            | StepType::WorkflowRequest => Ok(PostRun::Rerun),
        }
    }

    async fn handle_prompt_reply(&mut self, exec_id: Uuid, resp: RunEventResp) -> Result<()> {
        match (resp.resp_type, resp.message) {
            (RunEventResponseType::Message, Some(message)) if !message.text.trim().is_empty() => {
                let step = Step::new(exec_id, StepType::InputMessage).with_message(message);
                self.push_step(step).await?;
            }
            (_, message) => {
                // Empty or declined input is recorded as a rejection so the
                // executor can observe it on the next pass.
                let mut step = Step::new(exec_id, StepType::Rejection);
                step.message = message;
                self.push_step(step).await?;
            }
        }
        Ok(())
    }

    /// Confirmation round for a completed output.
    ///
    /// `existing_resp` is set when the executor yielded the prompt_confirm
    /// itself, in which case its response is consumed before any new
    /// prompt is emitted.
    async fn confirm_flow(
        &mut self,
        node: &Node,
        exec_id: Uuid,
        candidate: Step,
        mut existing_resp: Option<RunEventResp>,
    ) -> Result<PostRun> {
        loop {
            self.check_stop()?;
            let resp = match existing_resp.take() {
                Some(resp) => resp,
                None => {
                    self.emit_status(RunnerStatus::WaitingInput).await?;
                    let confirm = Step::new(exec_id, StepType::PromptConfirm);
                    self.push_step(confirm).await?
                }
            };

            match resp.resp_type {
                RunEventResponseType::Approve | RunEventResponseType::Noop => {
                    let approval = Step::new(exec_id, StepType::Approval);
                    self.push_step(approval).await?;
                    return self.finalize_and_transition(node, exec_id, candidate);
                }
                RunEventResponseType::Decline => {
                    return Ok(PostRun::Rerun);
                }
                RunEventResponseType::Message => {
                    let message = resp.message.unwrap_or_else(|| Message::user(""));
                    let is_empty = message.text.trim().is_empty();
                    let step = Step::new(exec_id, StepType::InputMessage).with_message(message);
                    self.push_step(step).await?;
                    if is_empty {
                        // An empty reply is an approval.
                        return self.finalize_and_transition(node, exec_id, candidate);
                    }
                    // A substantive reply re-prompts for confirmation with
                    // the new input on record.
                }
            }
        }
    }

    fn record_final(&self, exec_id: Uuid, terminal: &Step) {
        let mut run = self.runner.execution.lock();
        if let Some(ne) = run.node_execution_mut(exec_id) {
            for step in ne.steps.iter_mut() {
                step.is_final = step.id == terminal.id;
            }
            ne.status = RunStatus::Finished;
        }
        run.touch();
        if let Some(message) = &terminal.message {
            *self.runner.last_final_message.lock() = Some(message.clone());
        }
    }

    fn finalize_and_transition(
        &mut self,
        node: &Node,
        exec_id: Uuid,
        mut candidate: Step,
    ) -> Result<PostRun> {
        candidate.is_final = true;
        self.record_final(exec_id, &candidate);
        match self.transition(node, exec_id, &candidate)? {
            Some((next, exec, inputs)) => Ok(PostRun::Next {
                node: next,
                exec,
                inputs,
            }),
            None => Ok(PostRun::Done),
        }
    }

    /// A terminal rejection fails the node: use the declared `fail` outcome
    /// when available, finish outcome-less nodes, and treat anything else
    /// as a contract violation.
    fn finalize_rejection(&mut self, node: &Node, exec_id: Uuid, terminal: Step) -> Result<PostRun> {
        if node.outcomes.is_empty() {
            self.record_final(exec_id, &terminal);
            return Ok(PostRun::Done);
        }
        let outcome = terminal
            .outcome_name
            .clone()
            .or_else(|| {
                node.outcomes
                    .iter()
                    .find(|s| s.name == "fail")
                    .map(|s| s.name.clone())
            })
            .ok_or_else(|| {
                CoreError::Contract(format!(
                    "node '{}' failed without a declared 'fail' outcome",
                    node.name
                ))
            })?;
        let mut step = terminal;
        step.outcome_name = Some(outcome);
        self.finalize_and_transition(node, exec_id, step)
    }

    fn has_unhandled_tool_requests(&self, exec_id: Uuid, terminal: &Step) -> bool {
        let requests = terminal.tool_call_requests();
        if requests.is_empty() {
            return false;
        }
        let run = self.runner.execution.lock();
        let Some(ne) = run.node_execution(exec_id) else {
            return false;
        };
        let handled: std::collections::HashSet<&str> = ne
            .steps
            .iter()
            .flat_map(|s| s.tool_response_ids())
            .collect();
        requests.iter().any(|r| !handled.contains(r.id.as_str()))
    }

    fn effective_spec_for(&self, req: &ToolCallReq) -> Option<crate::config::ToolSpec> {
        req.tool_spec.clone().or_else(|| {
            self.runner
                .project
                .settings()
                .tool_spec(&req.name)
                .cloned()
        })
    }

    fn is_auto_approved(&self, req: &ToolCallReq) -> bool {
        let Some(spec) = self.effective_spec_for(req) else {
            return false;
        };
        if spec.auto_approve == Some(true) {
            return true;
        }
        spec.auto_approve_rules
            .iter()
            .any(|rule| rule.matches(&req.arguments))
    }

    /// Update the statuses of the assistant message's tool requests both in
    /// the stored terminal step and in the given working copy.
    fn set_request_status(
        &self,
        exec_id: Uuid,
        step_id: Uuid,
        req_id: &str,
        status: ToolCallReqStatus,
        auto: Option<bool>,
    ) {
        let mut run = self.runner.execution.lock();
        if let Some(ne) = run.node_execution_mut(exec_id) {
            if let Some(step) = ne.steps.iter_mut().find(|s| s.id == step_id) {
                if let Some(message) = step.message.as_mut() {
                    if let Some(req) = message
                        .tool_call_requests
                        .iter_mut()
                        .find(|r| r.id == req_id)
                    {
                        req.status = Some(status);
                        if auto.is_some() {
                            req.auto_approved = auto;
                        }
                        if matches!(
                            status,
                            ToolCallReqStatus::Complete | ToolCallReqStatus::Rejected
                        ) {
                            req.handled_at = Some(chrono::Utc::now());
                        }
                    }
                }
            }
        }
        run.touch();
    }

    async fn tool_flow(&mut self, node: &Node, exec_id: Uuid, terminal: Step) -> Result<PostRun> {
        let handled: std::collections::HashSet<String> = {
            let run = self.runner.execution.lock();
            run.node_execution(exec_id)
                .map(|ne| {
                    ne.steps
                        .iter()
                        .flat_map(|s| s.tool_response_ids())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut message = match &terminal.message {
            Some(m) => m.clone(),
            None => return Ok(PostRun::Rerun),
        };
        let unhandled: Vec<ToolCallReq> = message
            .tool_call_requests
            .iter()
            .filter(|r| !handled.contains(&r.id))
            .cloned()
            .collect();
        if unhandled.is_empty() {
            return Ok(PostRun::Rerun);
        }

        // Partition by auto-approval; statuses are recorded on the stored
        // assistant step so the UI sees them.
        let mut needs_confirmation = false;
        for req in &mut message.tool_call_requests {
            if handled.contains(&req.id) {
                continue;
            }
            if self.is_auto_approved(req) {
                req.status = Some(ToolCallReqStatus::PendingExecution);
                req.auto_approved = Some(true);
                self.set_request_status(
                    exec_id,
                    terminal.id,
                    &req.id.clone(),
                    ToolCallReqStatus::PendingExecution,
                    Some(true),
                );
            } else {
                req.status = Some(ToolCallReqStatus::RequiresConfirmation);
                needs_confirmation = true;
                self.set_request_status(
                    exec_id,
                    terminal.id,
                    &req.id.clone(),
                    ToolCallReqStatus::RequiresConfirmation,
                    None,
                );
            }
        }

        if needs_confirmation {
            self.emit_status(RunnerStatus::WaitingInput).await?;
            let request_step =
                Step::new(exec_id, StepType::ToolRequest).with_message(message.clone());
            let request_step_id = request_step.id;
            let resp = self.push_step(request_step).await?;

            match resp.resp_type {
                RunEventResponseType::Approve | RunEventResponseType::Noop => {
                    for req in message.tool_call_requests.iter_mut() {
                        if req.status == Some(ToolCallReqStatus::RequiresConfirmation) {
                            req.status = Some(ToolCallReqStatus::PendingExecution);
                            self.set_request_status(
                                exec_id,
                                request_step_id,
                                &req.id.clone(),
                                ToolCallReqStatus::PendingExecution,
                                None,
                            );
                        }
                    }
                }
                RunEventResponseType::Decline | RunEventResponseType::Message => {
                    // A decline (optionally with an explanation) rejects
                    // every outstanding request; the executor handles it on
                    // the next pass.
                    let responses: Vec<ToolCallResp> = unhandled
                        .iter()
                        .map(|r| ToolCallResp::rejected(r.id.clone(), r.name.clone()))
                        .collect();
                    for r in &unhandled {
                        self.set_request_status(
                            exec_id,
                            terminal.id,
                            &r.id,
                            ToolCallReqStatus::Rejected,
                            None,
                        );
                    }
                    let mut rejection_message = resp.message.unwrap_or_else(|| Message::user(""));
                    rejection_message.tool_call_responses = responses;
                    let rejection =
                        Step::new(exec_id, StepType::Rejection).with_message(rejection_message);
                    self.push_step(rejection).await?;
                    return Ok(PostRun::Rerun);
                }
            }
        }

        // Execute everything now pending, one call at a time.
        for req in message
            .tool_call_requests
            .iter()
            .filter(|r| r.status == Some(ToolCallReqStatus::PendingExecution))
        {
            self.check_stop()?;
            self.set_request_status(
                exec_id,
                terminal.id,
                &req.id,
                ToolCallReqStatus::Executing,
                None,
            );
            self.execute_tool(node, exec_id, req).await?;
            self.set_request_status(
                exec_id,
                terminal.id,
                &req.id,
                ToolCallReqStatus::Complete,
                None,
            );
        }

        Ok(PostRun::Rerun)
    }

    async fn execute_tool(&mut self, _node: &Node, exec_id: Uuid, req: &ToolCallReq) -> Result<()> {
        let spec = self
            .effective_spec_for(req)
            .unwrap_or_else(|| crate::config::ToolSpec::named(req.name.clone()));

        let outcome = match self.runner.project.tool(&req.name) {
            None => Err(CoreError::Tool(format!("unknown tool '{}'", req.name))),
            Some(tool) => {
                let tool_req = ToolReq {
                    run: self.runner.execution.clone(),
                    spec,
                };
                tool.run(tool_req, req.arguments.clone()).await
            }
        };

        match outcome {
            Ok(ToolResponse::Text { text }) => {
                let result = decode_tool_result(&text);
                let response = ToolCallResp::completed(req.id.clone(), req.name.clone(), result);
                let step = Step::new(exec_id, StepType::ToolResult)
                    .with_message(Message::tool(text).with_tool_responses(vec![response]));
                self.push_step(step).await?;
            }
            Ok(ToolResponse::StartWorkflow {
                workflow,
                initial_text,
                initial_message,
            }) => {
                let initial = initial_message.or_else(|| initial_text.map(Message::user));
                let request_step = Step::new(exec_id, StepType::WorkflowRequest).with_message(
                    Message::tool(format!("Starting workflow '{workflow}'")),
                );
                self.push_step(request_step).await?;

                // The reply arrives only after the nested workflow finished
                // and the manager appended the workflow_result step.
                let execution_id = self.runner.execution.lock().id;
                let event = RunEventReq {
                    kind: RunEventKind::StartWorkflow,
                    execution_id,
                    workflow_name: self.runner.workflow_name.clone(),
                    step: None,
                    stats: None,
                    start_workflow: Some(StartWorkflowPayload {
                        workflow_name: workflow,
                        initial_message: initial,
                        tool_call_id: req.id.clone(),
                        tool_name: req.name.clone(),
                    }),
                };
                self.events.emit(event, &mut self.stop).await?;
            }
            Err(e) => {
                tracing::warn!(tool = %req.name, error = %e, "tool failed");
                let mut response = ToolCallResp::completed(
                    req.id.clone(),
                    req.name.clone(),
                    serde_json::json!({"error": e.to_string()}),
                );
                response.status = crate::state::ToolCallStatus::Failed;
                let step = Step::new(exec_id, StepType::ToolResult)
                    .with_message(Message::tool(e.to_string()).with_tool_responses(vec![response]));
                self.push_step(step).await?;
            }
        }
        Ok(())
    }

    /// Resolve the outcome of a finalized node and prepare the next node.
    #[allow(clippy::type_complexity)]
    fn transition(
        &mut self,
        node: &Node,
        exec_id: Uuid,
        final_step: &Step,
    ) -> Result<Option<(String, Option<EnterExecution>, Option<Vec<Message>>)>> {
        if node.outcomes.is_empty() {
            return Ok(None);
        }

        let outcome = if node.outcomes.len() == 1 {
            node.outcomes[0].name.clone()
        } else {
            let name = final_step.outcome_name.clone().ok_or_else(|| {
                CoreError::UnknownOutcome {
                    node: node.name.clone(),
                    outcome: "<none>".into(),
                }
            })?;
            if !node.outcomes.iter().any(|s| s.name == name) {
                return Err(CoreError::UnknownOutcome {
                    node: node.name.clone(),
                    outcome: name,
                });
            }
            name
        };

        let edge = self
            .runner
            .graph
            .edge(&node.name, &outcome)
            .ok_or_else(|| CoreError::Contract(format!(
                "no edge for outcome '{outcome}' on node '{}'",
                node.name
            )))?
            .clone();
        let target = self
            .runner
            .graph
            .node(&edge.target_node)
            .ok_or_else(|| CoreError::Contract(format!(
                "edge target '{}' missing from graph",
                edge.target_node
            )))?
            .clone();

        let inputs = self.next_inputs(node, exec_id, final_step);
        let reset = edge.reset_policy.unwrap_or(target.reset_policy);

        match reset {
            StateResetPolicy::Keep => {
                let prev = {
                    let run = self.runner.execution.lock();
                    run.latest_execution_of(&target.name).map(|ne| ne.id)
                };
                match prev {
                    Some(prev_id) => {
                        let mut run = self.runner.execution.lock();
                        if let Some(ne) = run.node_execution_mut(prev_id) {
                            ne.input_messages.extend(inputs);
                            ne.status = RunStatus::Running;
                            for step in ne.steps.iter_mut() {
                                step.is_final = false;
                            }
                        }
                        run.touch();
                        Ok(Some((
                            target.name.clone(),
                            Some(EnterExecution {
                                id: prev_id,
                                force_run: true,
                            }),
                            None,
                        )))
                    }
                    None => Ok(Some((target.name.clone(), None, Some(inputs)))),
                }
            }
            StateResetPolicy::Reset => Ok(Some((target.name.clone(), None, Some(inputs)))),
        }
    }

    /// Inputs for the successor node per the source node's message mode.
    fn next_inputs(&self, node: &Node, exec_id: Uuid, final_step: &Step) -> Vec<Message> {
        let run = self.runner.execution.lock();
        let Some(ne) = run.node_execution(exec_id) else {
            return Vec::new();
        };
        match node.message_mode {
            ResultMode::FinalResponse => final_step
                .message
                .clone()
                .map(|m| vec![m])
                .unwrap_or_default(),
            ResultMode::AllMessages => {
                let mut out = ne.input_messages.clone();
                for step in &ne.steps {
                    if !step.is_complete {
                        continue;
                    }
                    if !matches!(
                        step.step_type,
                        StepType::OutputMessage
                            | StepType::InputMessage
                            | StepType::ToolResult
                            | StepType::WorkflowResult
                    ) {
                        continue;
                    }
                    if let Some(message) = &step.message {
                        out.push(message.clone());
                    }
                }
                out
            }
            ResultMode::ConcatenateFinal => {
                let mut parts: Vec<String> =
                    ne.input_messages.iter().map(|m| m.text.clone()).collect();
                if let Some(message) = &final_step.message {
                    parts.push(message.text.clone());
                }
                vec![Message::assistant(parts.join("\n\n"))]
            }
        }
    }
}

fn decode_tool_result(text: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(v @ serde_json::Value::Object(_)) | Ok(v @ serde_json::Value::Array(_)) => v,
        _ => serde_json::json!({ "text": text }),
    }
}
