//! UI event bridge.
//!
//! Translates runner events into UI packets over a packet endpoint and
//! gathers user-input replies through waiter futures. For every step the
//! bridge sends a `RUNNER_REQ` packet; steps that need input additionally
//! send an `INPUT_PROMPT` and park a waiter that the next `USER_INPUT`
//! packet resolves. Input beginning with `/` goes to the command manager
//! instead, and input arriving with no waiter while the current runner is
//! stopped becomes an edit-history request.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

use skein_core::executor::ExecutorRegistry;
use skein_core::proto::{RunEventKind, RunEventReq, RunEventResp};
use skein_core::state::{Message, RunnerStatus, Step, StepType, ToolCallReqStatus};
use skein_core::OutputMode;

use crate::error::Result;
use crate::executors::register_server_executors;
use crate::logging::LogBuffer;
use crate::manager::autocomplete::AutocompleteManager;
use crate::manager::commands::{CommandManager, CommandParam, CommandSpec};
use crate::manager::endpoint::{Endpoint, IncomingPacketRouter, RpcHelper};
use crate::manager::proto::{
    LogEntry, Packet, PacketEnvelope, PacketKind, RunnerReqDisplayOpts, RunnerStackFrame,
    TextMessageFormat, UiServerStatus,
};
use crate::manager::{Manager, RunEventListener, RunnerFrame};
use crate::project::Project;

pub struct UIServer {
    weak_self: Weak<UIServer>,
    endpoint: Arc<dyn Endpoint>,
    rpc: Arc<RpcHelper>,
    router: IncomingPacketRouter,
    manager: Arc<Manager>,
    project: Option<Arc<Project>>,
    status: parking_lot::Mutex<UiServerStatus>,
    input_waiters: parking_lot::Mutex<Vec<oneshot::Sender<Message>>>,
    recv_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    commands: CommandManager,
    autocomplete: AutocompleteManager,
    log_buffer: Arc<LogBuffer>,
    started: AtomicBool,
}

impl UIServer {
    /// Build a server around a full project: executor registry with the
    /// built-ins plus the server-side executors, and a fresh manager.
    pub fn new(project: Arc<Project>, endpoint: Arc<dyn Endpoint>) -> Arc<Self> {
        let mut registry = ExecutorRegistry::with_builtins();
        register_server_executors(&mut registry, project.clone());
        let manager = Manager::new(project.clone(), registry);
        Self::with_manager_and_project(manager, Some(project), endpoint)
    }

    /// Build a server around an existing manager (tests, embedders).
    pub fn with_manager(manager: Arc<Manager>, endpoint: Arc<dyn Endpoint>) -> Arc<Self> {
        Self::with_manager_and_project(manager, None, endpoint)
    }

    fn with_manager_and_project(
        manager: Arc<Manager>,
        project: Option<Arc<Project>>,
        endpoint: Arc<dyn Endpoint>,
    ) -> Arc<Self> {
        let rpc = RpcHelper::new(endpoint.clone(), "ui-server");
        let log_buffer = crate::logging::init_logging(
            manager.project().settings().logging.as_ref(),
        );
        let server = Arc::new_cyclic(|weak: &Weak<UIServer>| UIServer {
            weak_self: weak.clone(),
            endpoint,
            rpc: rpc.clone(),
            router: IncomingPacketRouter::new(rpc, "ui-server"),
            manager,
            project,
            status: parking_lot::Mutex::new(UiServerStatus::Idle),
            input_waiters: parking_lot::Mutex::new(Vec::new()),
            recv_task: parking_lot::Mutex::new(None),
            commands: CommandManager::new(),
            autocomplete: AutocompleteManager::new(),
            log_buffer,
            started: AtomicBool::new(false),
        });

        let listener: Weak<dyn RunEventListener> = server.weak_self.clone();
        server.manager.set_listener(listener);
        server.register_packet_handlers();
        server.register_builtin_commands();
        server
    }

    fn arc(&self) -> Arc<Self> {
        self.weak_self.upgrade().expect("server alive")
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn commands(&self) -> &CommandManager {
        &self.commands
    }

    pub fn log_buffer(&self) -> &Arc<LogBuffer> {
        &self.log_buffer
    }

    fn register_packet_handlers(&self) {
        let weak = self.weak_self.clone();
        self.router.register(
            PacketKind::UserInput,
            Arc::new(move |envelope| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(server) = weak.upgrade() {
                        server.on_user_input_packet(envelope).await;
                    }
                    None
                })
            }),
        );

        let weak = self.weak_self.clone();
        self.router.register(
            PacketKind::AutocompleteReq,
            Arc::new(move |envelope| {
                let weak = weak.clone();
                Box::pin(async move {
                    let server = weak.upgrade()?;
                    server.on_autocomplete_packet(envelope).await;
                    None
                })
            }),
        );

        let weak = self.weak_self.clone();
        self.router.register(
            PacketKind::StopReq,
            Arc::new(move |_envelope| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(server) = weak.upgrade() {
                        // Unblock any driver parked on user input before
                        // waiting for it to drain.
                        server.cancel_input_waiters().await;
                        server.manager.stop_current_runner().await;
                    }
                    None
                })
            }),
        );

        let weak = self.weak_self.clone();
        self.router.register(
            PacketKind::LogReq,
            Arc::new(move |envelope| {
                let weak = weak.clone();
                Box::pin(async move {
                    let server = weak.upgrade()?;
                    server.on_log_packet(envelope)
                })
            }),
        );
    }

    fn register_builtin_commands(&self) {
        self.commands.register(
            CommandSpec {
                name: "help".into(),
                description: "list available commands".into(),
                params: vec![],
            },
            Arc::new(|server, _args| {
                Box::pin(async move {
                    let mut lines: Vec<String> = vec!["Available commands:".into()];
                    for spec in server.commands.specs() {
                        lines.push(format!("{} - {}", spec.usage(), spec.description));
                    }
                    server
                        .send_text_message(&lines.join("\n"))
                        .await
                        .map_err(|e| e.to_string())
                })
            }),
        );

        self.commands.register(
            CommandSpec {
                name: "run".into(),
                description: "start a workflow".into(),
                params: vec![
                    CommandParam::required("workflow", "name of the workflow to start"),
                    CommandParam::optional("text", "initial user message"),
                ],
            },
            Arc::new(|server, args| {
                Box::pin(async move {
                    let initial = args.get(1).map(|text| Message::user(text.clone()));
                    server
                        .manager
                        .start_workflow(&args[0], initial)
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                })
            }),
        );

        self.commands.register(
            CommandSpec {
                name: "stop".into(),
                description: "stop the current runner".into(),
                params: vec![],
            },
            Arc::new(|server, _args| {
                Box::pin(async move {
                    server.cancel_input_waiters().await;
                    server.manager.stop_current_runner().await;
                    Ok(())
                })
            }),
        );

        self.commands.register(
            CommandSpec {
                name: "restart".into(),
                description: "restart the current runner".into(),
                params: vec![CommandParam::optional("text", "replacement initial message")],
            },
            Arc::new(|server, args| {
                Box::pin(async move {
                    server.cancel_input_waiters().await;
                    let initial = args.first().map(|text| Message::user(text.clone()));
                    server
                        .manager
                        .restart_current_runner(initial)
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                })
            }),
        );
    }

    pub async fn send_packet(&self, payload: Packet) -> Result<()> {
        let envelope = PacketEnvelope {
            msg_id: self.rpc.next_msg_id(),
            source_msg_id: None,
            payload,
        };
        self.endpoint.send(envelope).await
    }

    pub async fn send_text_message(&self, text: &str) -> Result<()> {
        self.send_packet(Packet::TextMessage {
            text: text.to_string(),
            format: TextMessageFormat::Plain,
        })
        .await
    }

    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.manager.start().await?;
        if let Some(project) = &self.project {
            if let Some(state_manager) = project.state_manager() {
                self.manager.set_state_manager(state_manager);
            }
        }
        *self.status.lock() = UiServerStatus::Running;

        // Receive loop: route incoming packets until the peer goes away.
        let weak = self.weak_self.clone();
        let endpoint = self.endpoint.clone();
        let recv_task = tokio::spawn(async move {
            while let Some(envelope) = endpoint.recv().await {
                let Some(server) = weak.upgrade() else { break };
                if let Err(error) = server.router.handle(envelope).await {
                    tracing::warn!(%error, "packet handling failed");
                }
            }
        });
        *self.recv_task.lock() = Some(recv_task);

        // Auto-start the default workflow when configured.
        let settings = self.manager.project().settings();
        if let Some(default_workflow) = settings.default_workflow.clone() {
            if settings.workflows.contains_key(&default_workflow) {
                let manager = self.manager.clone();
                tokio::spawn(async move {
                    if let Err(error) = manager.start_workflow(&default_workflow, None).await {
                        tracing::error!(%error, "default workflow failed to start");
                    }
                });
            }
        }

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        *self.status.lock() = UiServerStatus::Idle;
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
        self.rpc.cancel_all();
        self.input_waiters.lock().clear();
        self.manager.stop().await?;
        Ok(())
    }

    fn push_input_waiter(&self) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.input_waiters.lock().push(tx);
        rx
    }

    fn pop_input_waiter(&self) -> Option<oneshot::Sender<Message>> {
        self.input_waiters.lock().pop()
    }

    /// Cancel pending waiters and clear the UI prompt.
    pub async fn cancel_input_waiters(&self) {
        let had_waiters = {
            let mut waiters = self.input_waiters.lock();
            let had = !waiters.is_empty();
            waiters.clear();
            had
        };
        if had_waiters {
            let _ = self.send_packet(Packet::clear_prompt()).await;
        }
    }

    async fn handle_step_event(
        &self,
        frame: &Arc<RunnerFrame>,
        event: &RunEventReq,
        step: &Step,
    ) -> RunEventResp {
        let needs_confirmation = step.step_type == StepType::ToolRequest
            && step
                .tool_call_requests()
                .iter()
                .any(|r| r.status == Some(ToolCallReqStatus::RequiresConfirmation));

        let (input_required, input_title, input_subtitle) = match step.step_type {
            StepType::Prompt => (true, Some("Input".to_string()), None),
            StepType::PromptConfirm => (
                true,
                Some("Press enter to confirm or provide a reply".to_string()),
                None,
            ),
            StepType::ToolRequest if needs_confirmation => (
                true,
                Some("Please confirm the tool call".to_string()),
                Some("Empty line confirms, any text to reject with a message".to_string()),
            ),
            _ => (false, None, None),
        };

        let display = {
            let shared = frame.runner.execution();
            let node_name = {
                let run = shared.lock();
                run.node_execution(step.execution_id).map(|ne| ne.node.clone())
            };
            node_name
                .and_then(|name| frame.runner.graph().node(&name).cloned())
                .filter(|node| node.output_mode != OutputMode::Show)
                .map(|node| RunnerReqDisplayOpts {
                    output_mode: node.output_mode,
                })
        };

        let packet = Packet::RunnerReq {
            workflow_id: frame.workflow_name.clone(),
            workflow_name: event.workflow_name.clone(),
            workflow_execution_id: event.execution_id.to_string(),
            step: step.clone(),
            input_required,
            display,
        };
        if self.send_packet(packet).await.is_err() {
            return RunEventResp::noop();
        }

        if !input_required {
            if step.step_type == StepType::ToolRequest && !needs_confirmation {
                return RunEventResp::approve();
            }
            return RunEventResp::noop();
        }

        let _ = self
            .send_packet(Packet::InputPrompt {
                title: input_title,
                subtitle: input_subtitle,
            })
            .await;

        // Wait for user input, bailing out when the runner is asked to
        // stop so the driver never deadlocks on an abandoned prompt.
        let waiter = self.push_input_waiter();
        let runner = frame.runner.clone();
        let message = tokio::select! {
            result = waiter => match result {
                Ok(message) => message,
                // Waiter canceled (stop or shutdown); let the runner
                // observe its own stop signal.
                Err(_) => return RunEventResp::noop(),
            },
            _ = async {
                loop {
                    if runner.stop_requested() {
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(25)).await;
                }
            } => return RunEventResp::noop(),
        };

        match step.step_type {
            StepType::Prompt => RunEventResp::message(message),
            StepType::PromptConfirm => {
                if message.text.is_empty() {
                    RunEventResp::approve()
                } else {
                    RunEventResp::message(message)
                }
            }
            StepType::ToolRequest => {
                if message.text.is_empty() {
                    RunEventResp::approve()
                } else {
                    RunEventResp::decline(Some(message))
                }
            }
            _ => RunEventResp::noop(),
        }
    }

    async fn handle_status_event(&self, event: &RunEventReq) -> RunEventResp {
        if let Some(stats) = &event.stats {
            if matches!(stats.status, RunnerStatus::Stopped | RunnerStatus::Finished) {
                self.input_waiters.lock().clear();
                let _ = self.send_packet(Packet::clear_prompt()).await;
            }
        }

        let mut runners: Vec<RunnerStackFrame> = Vec::new();
        let mut active_node_started_at = None;
        let mut last_user_input_at = None;
        let mut active_workflow_usage = None;
        let mut last_step_usage = None;

        for frame in self.manager.runner_stack() {
            let Some(stats) = frame.last_stats() else {
                continue;
            };
            let shared = frame.runner.execution();
            let run = shared.lock();
            let mut node_name = String::new();
            let mut node_execution_id = None;
            if let Some(execution) = stats
                .current_node_execution_id
                .and_then(|id| run.node_execution(id))
            {
                node_name = execution.node.clone();
                node_execution_id = Some(execution.id.to_string());
                if let Some(first) = execution.steps.first() {
                    active_node_started_at = Some(first.created_at);
                }
            } else if let Some(name) = &stats.current_node_name {
                node_name = name.clone();
            }
            runners.push(RunnerStackFrame {
                workflow_name: run.workflow_name.clone(),
                workflow_execution_id: run.id.to_string(),
                node_name,
                node_execution_id,
                status: stats.status,
            });
            if run.last_user_input_at.is_some() {
                last_user_input_at = run.last_user_input_at;
            }
            if run.llm_usage.is_some() {
                active_workflow_usage = run.llm_usage.clone();
            }
            if run.last_step_llm_usage.is_some() {
                last_step_usage = run.last_step_llm_usage.clone();
            }
        }

        let packet = Packet::UiState {
            status: *self.status.lock(),
            runners,
            active_node_started_at,
            last_user_input_at,
            active_workflow_llm_usage: active_workflow_usage,
            last_step_llm_usage: last_step_usage,
            project_llm_usage: Some(self.manager.project().llm_usage()),
        };
        let _ = self.send_packet(packet).await;
        RunEventResp::noop()
    }

    async fn on_user_input_packet(&self, envelope: PacketEnvelope) {
        let Packet::UserInput { message } = envelope.payload else {
            return;
        };
        let text = message.text.clone();

        if text.starts_with('/') && text.len() > 1 {
            let handled = self.commands.execute(self.arc(), &text[1..]).await;
            if !handled {
                let command = text[1..].split_whitespace().next().unwrap_or("");
                let _ = self
                    .send_text_message(&format!("Unknown command: /{command}"))
                    .await;
            }
            return;
        }

        match self.pop_input_waiter() {
            Some(waiter) => {
                let _ = waiter.send(message);
                let _ = self.send_packet(Packet::clear_prompt()).await;
            }
            None => {
                let stopped = self
                    .manager
                    .current_runner()
                    .map(|r| r.status() == RunnerStatus::Stopped)
                    .unwrap_or(false);
                if stopped {
                    let edited = self.manager.edit_history_with_text(&text).await;
                    if !edited {
                        let _ = self
                            .send_text_message(
                                "Unable to edit history: no previous user input to replace.",
                            )
                            .await;
                    }
                }
            }
        }
    }

    async fn on_autocomplete_packet(&self, envelope: PacketEnvelope) {
        let Packet::AutocompleteReq { text, row, col } = envelope.payload else {
            return;
        };
        let items = self.autocomplete.get_completions(self, &text, row, col).await;
        let _ = self.send_packet(Packet::AutocompleteResp { items }).await;
    }

    fn on_log_packet(&self, envelope: PacketEnvelope) -> Option<Packet> {
        let Packet::LogReq { offset, limit } = envelope.payload else {
            return None;
        };
        let records = self.log_buffer.records();
        let total = records.len();
        let offset = offset.min(total);
        let end = match limit {
            Some(limit) => (offset + limit).min(total),
            None => total,
        };
        let entries = records[offset..end]
            .iter()
            .enumerate()
            .map(|(i, record)| LogEntry {
                index: offset + i,
                record: record.clone(),
            })
            .collect();
        Some(Packet::LogResp {
            offset,
            total,
            entries,
        })
    }

    /// Route one incoming envelope; exposed for tests and embedders that
    /// drive the endpoint themselves.
    pub async fn on_ui_packet(&self, envelope: PacketEnvelope) -> Result<bool> {
        self.router.handle(envelope).await
    }
}

#[async_trait]
impl RunEventListener for UIServer {
    async fn on_run_event(
        &self,
        frame: &Arc<RunnerFrame>,
        event: &RunEventReq,
    ) -> Option<RunEventResp> {
        match event.kind {
            RunEventKind::Status => Some(self.handle_status_event(event).await),
            // Nested workflow launches are the manager's business; the
            // event is only observed here.
            RunEventKind::StartWorkflow => None,
            RunEventKind::Step => {
                let step = event.step.as_ref()?;
                Some(self.handle_step_event(frame, event, step).await)
            }
        }
    }
}
