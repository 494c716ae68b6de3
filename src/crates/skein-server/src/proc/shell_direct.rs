//! Direct shell mode: each command runs in its own subprocess.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;

use skein_core::config::ShellSettings;

use crate::error::Result;
use crate::proc::shell::{RawShellCommand, ShellProcessor};
use crate::proc::{ProcessHandle, ProcessManager};

pub struct DirectShellProcessor {
    pm: Arc<ProcessManager>,
    settings: ShellSettings,
    env_overlay: HashMap<String, String>,
}

impl DirectShellProcessor {
    pub fn new(
        pm: Arc<ProcessManager>,
        settings: ShellSettings,
        env_overlay: HashMap<String, String>,
    ) -> Self {
        Self {
            pm,
            settings,
            env_overlay,
        }
    }
}

struct DirectShellCommand {
    handle: Arc<ProcessHandle>,
}

#[async_trait]
impl RawShellCommand for DirectShellCommand {
    fn stdout(&self) -> BoxStream<'static, String> {
        self.handle.stdout()
    }

    fn stderr(&self) -> BoxStream<'static, String> {
        self.handle.stderr()
    }

    async fn wait(&self) -> Option<i32> {
        self.handle.wait().await
    }

    async fn terminate(&self, grace_s: f64) {
        self.handle.terminate(grace_s).await;
    }
}

#[async_trait]
impl ShellProcessor for DirectShellProcessor {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn run(&self, command: &str) -> Result<Arc<dyn RawShellCommand>> {
        let mut args = self.settings.args.clone();
        args.push("-c".to_string());
        args.push(command.to_string());
        let handle = self
            .pm
            .spawn(&self.settings.program, &args, Some(&self.env_overlay))?;
        Ok(Arc::new(DirectShellCommand { handle }))
    }
}
