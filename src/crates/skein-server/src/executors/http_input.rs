//! HTTP input executor.
//!
//! On node init, registers a bearer-guarded POST route on the internal
//! HTTP server. The handler accepts `{text, role?}`, wraps non-Markdown
//! content in a code fence and publishes a message onto an in-process
//! queue keyed by node name. `run()` yields a waiting step and blocks on
//! the queue; the delivered message becomes the node's final output. The
//! route is deregistered on teardown, so a stopped runner can resume and
//! re-register later.

use async_stream::try_stream;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

use skein_core::executor::{Executor, ExecutorInput, StepStream};
use skein_core::model::{Node, Role};
use skein_core::project::ProjectContext;
use skein_core::state::{Message, RunnerStatus, Step, StepType};
use skein_core::CoreError;

use crate::http::{HttpResponse, RouteHandle};
use crate::project::Project;

/// Unbounded in-process message queue with async pop.
#[derive(Default)]
pub struct MessageQueue {
    items: parking_lot::Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl MessageQueue {
    pub fn push(&self, message: Message) {
        self.items.lock().push_back(message);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> Message {
        loop {
            if let Some(message) = self.items.lock().pop_front() {
                return message;
            }
            self.notify.notified().await;
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpInputParams {
    /// HTTP path receiving external input messages.
    #[serde(default = "default_path")]
    pub path: String,
    /// Status message shown while waiting for input.
    #[serde(default)]
    pub message: Option<String>,
    /// Default content type when the request does not provide one.
    #[serde(default)]
    pub content_type: Option<String>,
}

fn default_path() -> String {
    "/input".to_string()
}

pub struct HttpInputExecutor {
    node_name: String,
    params: HttpInputParams,
    project: Arc<Project>,
    route: parking_lot::Mutex<Option<RouteHandle>>,
}

impl HttpInputExecutor {
    pub fn new(node: &Node, project: Arc<Project>) -> skein_core::Result<Self> {
        Ok(Self {
            node_name: node.name.clone(),
            params: node.typed_params()?,
            project,
            route: parking_lot::Mutex::new(None),
        })
    }

    fn queue_key(&self) -> String {
        format!("http-input:{}", self.node_name)
    }

    fn queue(&self) -> Arc<MessageQueue> {
        self.project
            .state()
            .get_or_insert_with(&self.queue_key(), || Arc::new(MessageQueue::default()))
    }
}

/// Build the delivered message from a request payload: unknown roles fall
/// back to `user`, and non-Markdown text is fenced so it renders verbatim.
pub fn message_from_payload(
    payload: &Value,
    header_content_type: Option<&str>,
    default_content_type: Option<&str>,
) -> Option<Message> {
    let text = payload.get("text")?.as_str()?;
    let effective = header_content_type
        .filter(|s| !s.is_empty())
        .or(default_content_type);
    let is_markdown = effective
        .map(|ct| ct.to_ascii_lowercase().contains("markdown"))
        .unwrap_or(false);
    let text = if is_markdown {
        text.to_string()
    } else {
        format!("```\n{text}\n```")
    };

    let role = payload
        .get("role")
        .and_then(Value::as_str)
        .and_then(|r| serde_json::from_value::<Role>(Value::String(r.to_string())).ok())
        .unwrap_or(Role::User);
    Some(Message::new(role, text))
}

#[async_trait]
impl Executor for HttpInputExecutor {
    async fn init(&self) -> skein_core::Result<()> {
        let queue = self.queue();
        let content_type = self.params.content_type.clone();
        let http = self.project.http();

        let handler = http.require_auth(Arc::new(move |request| {
            let queue = queue.clone();
            let content_type = content_type.clone();
            Box::pin(async move {
                let Some(payload) = request.json() else {
                    return HttpResponse::error(400, "invalid_json");
                };
                let header_ct = request.header("content-type").map(str::to_string);
                match message_from_payload(
                    &payload,
                    header_ct.as_deref(),
                    content_type.as_deref(),
                ) {
                    Some(message) => {
                        queue.push(message);
                        HttpResponse::ok(json!({"status": "ok"}))
                    }
                    None => HttpResponse::error(400, "missing_text"),
                }
            })
        }));

        let handle = http
            .register_route("POST", &self.params.path, handler)
            .await
            .map_err(|e| CoreError::Other(e.to_string()))?;
        *self.route.lock() = Some(handle);
        Ok(())
    }

    async fn shutdown(&self) -> skein_core::Result<()> {
        let handle = self.route.lock().take();
        if let Some(handle) = handle {
            self.project
                .http()
                .deregister_route(&handle)
                .await
                .map_err(|e| CoreError::Other(e.to_string()))?;
        }
        Ok(())
    }

    fn run(&self, input: ExecutorInput) -> StepStream {
        let waiting_text = self
            .params
            .message
            .clone()
            .unwrap_or_else(|| "Waiting for HTTP input...".to_string());
        let queue = self.queue();
        Box::pin(try_stream! {
            let mut waiting = Step::new(input.execution.id, StepType::OutputMessage)
                .with_message(Message::assistant(waiting_text))
                .incomplete();
            waiting.status_hint = Some(RunnerStatus::WaitingInput);
            yield waiting;

            let message = queue.pop().await;
            let mut step = Step::new(input.execution.id, StepType::OutputMessage)
                .with_message(message);
            step.is_final = true;
            yield step;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_without_text_is_rejected() {
        assert!(message_from_payload(&json!({"role": "user"}), None, None).is_none());
    }

    #[test]
    fn plain_text_is_fenced() {
        let message = message_from_payload(&json!({"text": "ls -la"}), None, None).unwrap();
        assert_eq!(message.text, "```\nls -la\n```");
        assert_eq!(message.role, Role::User);
    }

    #[test]
    fn markdown_content_type_passes_through() {
        let message = message_from_payload(
            &json!({"text": "# Title"}),
            Some("text/markdown"),
            None,
        )
        .unwrap();
        assert_eq!(message.text, "# Title");

        // Node-level default applies when the request has no header.
        let message =
            message_from_payload(&json!({"text": "# T"}), None, Some("text/markdown")).unwrap();
        assert_eq!(message.text, "# T");
    }

    #[test]
    fn unknown_role_falls_back_to_user() {
        let message =
            message_from_payload(&json!({"text": "x", "role": "robot"}), None, None).unwrap();
        assert_eq!(message.role, Role::User);
        let message =
            message_from_payload(&json!({"text": "x", "role": "assistant"}), None, None).unwrap();
        assert_eq!(message.role, Role::Assistant);
    }

    #[tokio::test]
    async fn queue_pop_waits_for_push() {
        let queue = Arc::new(MessageQueue::default());
        let popper = queue.clone();
        let task = tokio::spawn(async move { popper.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(Message::user("delivered"));
        let message = task.await.unwrap();
        assert_eq!(message.text, "delivered");
    }
}
