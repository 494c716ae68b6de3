//! Task plan tool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::ToolSpec;
use crate::error::{CoreError, Result};
use crate::project::ProjectContext;
use crate::tools::{Tool, ToolReq, ToolResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskList {
    pub todos: Vec<Task>,
}

impl TaskList {
    /// Merge incoming tasks by id, appending new ones, or replace the whole
    /// plan when `merge` is false.
    pub fn merged(&self, incoming: Vec<Task>, merge: bool) -> TaskList {
        if !merge {
            return TaskList { todos: incoming };
        }
        let mut todos = self.todos.clone();
        for task in incoming {
            match todos.iter_mut().find(|t| t.id == task.id) {
                Some(existing) => *existing = task,
                None => todos.push(task),
            }
        }
        TaskList { todos }
    }
}

/// Maintains the current task plan for a workflow execution.
///
/// The plan lives in project state keyed by the workflow execution id, so
/// nested workflows each keep their own plan. At most one task may be
/// `in_progress` at a time.
pub struct UpdatePlanTool {
    project: Arc<dyn ProjectContext>,
}

impl UpdatePlanTool {
    pub fn new(project: Arc<dyn ProjectContext>) -> Self {
        Self { project }
    }

    fn state_key(execution_id: uuid::Uuid) -> String {
        format!("task-plan:{execution_id}")
    }

    /// Current plan for the given execution, empty when none was saved.
    pub fn current_plan(project: &dyn ProjectContext, execution_id: uuid::Uuid) -> TaskList {
        project
            .state()
            .get::<parking_lot::Mutex<TaskList>>(&Self::state_key(execution_id))
            .map(|m| m.lock().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Tool for UpdatePlanTool {
    fn name(&self) -> &str {
        "update_plan"
    }

    async fn run(&self, req: ToolReq, args: Value) -> Result<ToolResponse> {
        let Value::Object(map) = &args else {
            return Err(CoreError::Tool("update_plan expects arguments as an object".into()));
        };
        let merge = map.get("merge").and_then(Value::as_bool).unwrap_or(true);
        let raw_todos = map
            .get("todos")
            .and_then(Value::as_array)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CoreError::Tool("update_plan requires a non-empty 'todos' list".into()))?;

        let execution_id = req.run.lock().id;
        let current = Self::current_plan(self.project.as_ref(), execution_id);

        let mut todos: Vec<Task> = Vec::new();
        for item in raw_todos {
            let Value::Object(item) = item else {
                return Err(CoreError::Tool(
                    "Each todo must be an object with id, status, and optional title".into(),
                ));
            };
            let id = item
                .get("id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    CoreError::Tool("Each todo must provide a non-empty 'id' string".into())
                })?
                .to_string();
            let status: TaskStatus = item
                .get("status")
                .cloned()
                .ok_or_else(|| CoreError::Tool("Each todo must provide a 'status'".into()))
                .and_then(|v| {
                    serde_json::from_value(v).map_err(|_| {
                        CoreError::Tool(
                            "Invalid status; must be one of: pending, in_progress, completed"
                                .into(),
                        )
                    })
                })?;
            let title = item.get("title").and_then(Value::as_str).map(str::to_string);

            let title = match title {
                Some(t) if !t.is_empty() => t,
                _ if merge => current
                    .todos
                    .iter()
                    .find(|t| t.id == id)
                    .map(|t| t.title.clone())
                    .ok_or_else(|| {
                        CoreError::Tool(format!(
                            "Title is required when adding a new task id during merge (missing \
                             title for id='{id}')."
                        ))
                    })?,
                _ => {
                    return Err(CoreError::Tool(format!(
                        "Title is required for all tasks when merge is false (missing or empty \
                         title for id='{id}')."
                    )))
                }
            };

            todos.push(Task { id, title, status });
        }

        let updated = current.merged(todos, merge);

        let in_progress = updated
            .todos
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count();
        if in_progress > 1 {
            return Err(CoreError::Tool(
                "Only one task can have status 'in_progress' at a time in the task plan.".into(),
            ));
        }

        let payload = json!({
            "todos": updated
                .todos
                .iter()
                .map(|t| json!({"id": t.id, "title": t.title, "status": t.status.as_str()}))
                .collect::<Vec<_>>()
        });

        let slot = self
            .project
            .state()
            .get_or_insert_with(&Self::state_key(execution_id), || {
                Arc::new(parking_lot::Mutex::new(TaskList::default()))
            });
        *slot.lock() = updated;

        Ok(ToolResponse::text(payload.to_string()))
    }

    async fn openapi_spec(&self, _spec: &ToolSpec) -> Result<Value> {
        Ok(json!({
            "name": self.name(),
            "description": "Update or replace the current task plan for this coding session. \
                            Use stable ids (e.g. 'step-1') so you can update task status over time.",
            "parameters": {
                "type": "object",
                "properties": {
                    "merge": {
                        "type": "boolean",
                        "description": "If true, merge these todos into the existing plan \
                                        (updating tasks by id and appending new ones). If false, \
                                        replace the existing plan entirely.",
                        "default": true,
                    },
                    "todos": {
                        "type": "array",
                        "description": "Ordered list of tasks representing the plan. Each task \
                                        must have a stable id, title, and status.",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {
                                    "type": "string",
                                    "description": "Stable identifier for the task (e.g. 'step-1').",
                                },
                                "title": {
                                    "type": "string",
                                    "description": "Short description of the task. Optional for \
                                                    merge requests; when omitted, only the status \
                                                    is updated for an existing task.",
                                },
                                "status": {
                                    "type": "string",
                                    "description": "Current status of this task.",
                                    "enum": ["pending", "in_progress", "completed"],
                                },
                            },
                            "required": ["id", "status"],
                            "additionalProperties": false,
                        },
                    },
                },
                "required": ["todos"],
                "additionalProperties": false,
            },
        }))
    }
}
