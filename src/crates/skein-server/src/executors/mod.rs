//! Server-side executors.

mod http_input;

pub use http_input::{HttpInputExecutor, HttpInputParams, MessageQueue};

use std::sync::Arc;

use skein_core::executor::ExecutorRegistry;

use crate::project::Project;

/// Register executors that depend on server-side subsystems.
pub fn register_server_executors(registry: &mut ExecutorRegistry, project: Arc<Project>) {
    registry.register("http-input", move |node, _ctx| {
        Ok(Arc::new(HttpInputExecutor::new(node, project.clone())?) as _)
    });
}
