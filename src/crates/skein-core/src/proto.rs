//! Runner event protocol.
//!
//! The runner and its driver speak a simple request/response protocol:
//! every [`RunEventReq`] the runner emits must be answered through the
//! paired [`RunReply`] before the runner proceeds. This models the
//! bidirectional async-generator protocol with plain channels.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::state::{Message, RunnerStatus, Step};

/// Event kinds emitted by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    /// A step was produced or updated; `step` is set.
    Step,
    /// Runner status changed; `stats` is set.
    Status,
    /// A tool requested a nested workflow; `start_workflow` is set. The
    /// reply must arrive only after the child workflow completed.
    StartWorkflow,
}

/// Runner status snapshot carried by STATUS events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub status: RunnerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node_execution_id: Option<Uuid>,
}

/// Payload of a START_WORKFLOW event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowPayload {
    pub workflow_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_message: Option<Message>,
    /// Tool call that requested the nested workflow; the resulting
    /// workflow_result step answers this id.
    pub tool_call_id: String,
    pub tool_name: String,
}

/// One event emitted by the runner to its driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEventReq {
    pub kind: RunEventKind,
    /// Workflow execution this event belongs to.
    pub execution_id: Uuid,
    pub workflow_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<RunStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_workflow: Option<StartWorkflowPayload>,
}

/// How the listener answered an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventResponseType {
    Approve,
    Decline,
    Message,
    Noop,
}

/// Listener response fed back into the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEventResp {
    pub resp_type: RunEventResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

impl RunEventResp {
    pub fn noop() -> Self {
        Self {
            resp_type: RunEventResponseType::Noop,
            message: None,
        }
    }

    pub fn approve() -> Self {
        Self {
            resp_type: RunEventResponseType::Approve,
            message: None,
        }
    }

    pub fn decline(message: Option<Message>) -> Self {
        Self {
            resp_type: RunEventResponseType::Decline,
            message,
        }
    }

    pub fn message(message: Message) -> Self {
        Self {
            resp_type: RunEventResponseType::Message,
            message: Some(message),
        }
    }
}

/// Responder paired with one emitted event.
///
/// Dropping the responder without sending counts as a NOOP reply.
#[derive(Debug)]
pub struct RunReply {
    tx: oneshot::Sender<RunEventResp>,
}

impl RunReply {
    pub fn send(self, resp: RunEventResp) {
        let _ = self.tx.send(resp);
    }
}

pub(crate) type RunEventItem = Result<(RunEventReq, RunReply)>;

/// Receiving half of a runner's event stream.
pub struct RunEventStream {
    rx: mpsc::Receiver<RunEventItem>,
}

impl RunEventStream {
    /// Next event, or `None` once the runner loop ended. Errors carry fatal
    /// contract violations; the stream ends after yielding one.
    pub async fn next(&mut self) -> Option<RunEventItem> {
        self.rx.recv().await
    }
}

pub(crate) struct RunEventSender {
    tx: mpsc::Sender<RunEventItem>,
}

impl RunEventSender {
    pub(crate) fn channel() -> (RunEventSender, RunEventStream) {
        let (tx, rx) = mpsc::channel(8);
        (RunEventSender { tx }, RunEventStream { rx })
    }

    /// Emit one event and wait for the listener's reply, observing the stop
    /// signal while waiting.
    pub(crate) async fn emit(
        &self,
        event: RunEventReq,
        stop: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<RunEventResp> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Ok((event, RunReply { tx: reply_tx })))
            .await
            .map_err(|_| CoreError::Canceled)?;
        tokio::select! {
            resp = reply_rx => Ok(resp.unwrap_or_else(|_| RunEventResp::noop())),
            _ = stop.wait_for(|stopped| *stopped) => Err(CoreError::Canceled),
        }
    }

    /// Like [`emit`](Self::emit) but does not abort on stop; used for the
    /// terminal STATUS events that must still reach the driver.
    pub(crate) async fn emit_final(&self, event: RunEventReq) -> Result<RunEventResp> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Ok((event, RunReply { tx: reply_tx })))
            .await
            .map_err(|_| CoreError::Canceled)?;
        Ok(reply_rx.await.unwrap_or_else(|_| RunEventResp::noop()))
    }

    pub(crate) async fn fail(&self, error: CoreError) {
        let _ = self.tx.send(Err(error)).await;
    }
}
