//! Shell manager.
//!
//! High-level entry point for running shell commands in either `direct`
//! mode (one subprocess per command) or `shell` mode (a long-lived shell
//! with marker-wrapped commands). Commands are serialized through a lock
//! so at most one is active at a time, and every command gets a timeout
//! (per call, or the configured default). On expiry the command is
//! terminated, killed after a short grace, and surfaces `timed_out`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use skein_core::config::{ShellMode, ShellSettings};
use skein_core::project::{ShellCommand, ShellExit, ShellRunner};

use crate::error::Result;
use crate::proc::shell_direct::DirectShellProcessor;
use crate::proc::shell_persistent::PersistentShellProcessor;
use crate::proc::ProcessManager;

/// A command handle as produced by a shell processor, before timeout
/// handling is layered on.
#[async_trait]
pub trait RawShellCommand: Send + Sync {
    fn stdout(&self) -> BoxStream<'static, String>;
    fn stderr(&self) -> BoxStream<'static, String>;
    /// Exit code, or `None` when it could not be determined.
    async fn wait(&self) -> Option<i32>;
    async fn terminate(&self, grace_s: f64);
}

#[async_trait]
pub trait ShellProcessor: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self);
    async fn run(&self, command: &str) -> Result<Arc<dyn RawShellCommand>>;
}

/// Wraps a raw command with timeout enforcement and the serialization
/// guard; implements the core [`ShellCommand`] contract.
pub struct ManagedShellCommand {
    inner: Arc<dyn RawShellCommand>,
    timeout_s: Option<f64>,
    result: Mutex<Option<ShellExit>>,
    guard: parking_lot::Mutex<Option<OwnedMutexGuard<()>>>,
}

impl ManagedShellCommand {
    fn new(
        inner: Arc<dyn RawShellCommand>,
        timeout_s: Option<f64>,
        guard: OwnedMutexGuard<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner,
            timeout_s,
            result: Mutex::new(None),
            guard: parking_lot::Mutex::new(Some(guard)),
        })
    }

    fn release_slot(&self) {
        self.guard.lock().take();
    }
}

#[async_trait]
impl ShellCommand for ManagedShellCommand {
    fn stdout(&self) -> BoxStream<'static, String> {
        self.inner.stdout()
    }

    fn stderr(&self) -> BoxStream<'static, String> {
        self.inner.stderr()
    }

    async fn wait(&self) -> ShellExit {
        let mut slot = self.result.lock().await;
        if let Some(exit) = *slot {
            return exit;
        }
        let exit = match self.timeout_s {
            Some(timeout) if timeout > 0.0 => {
                match tokio::time::timeout(Duration::from_secs_f64(timeout), self.inner.wait())
                    .await
                {
                    Ok(code) => ShellExit {
                        code,
                        timed_out: false,
                    },
                    Err(_) => {
                        self.inner.terminate(1.0).await;
                        ShellExit {
                            code: None,
                            timed_out: true,
                        }
                    }
                }
            }
            _ => ShellExit {
                code: self.inner.wait().await,
                timed_out: false,
            },
        };
        *slot = Some(exit);
        self.release_slot();
        exit
    }

    async fn terminate(&self, grace_s: f64) {
        self.inner.terminate(grace_s).await;
        self.release_slot();
    }
}

pub struct ShellManager {
    pm: Arc<ProcessManager>,
    settings: ShellSettings,
    env_overlay: HashMap<String, String>,
    processor: Mutex<Option<Arc<dyn ShellProcessor>>>,
    /// Serializes commands: one active at a time.
    run_slot: Arc<Mutex<()>>,
}

impl ShellManager {
    pub fn new(
        pm: Arc<ProcessManager>,
        settings: Option<ShellSettings>,
        env_overlay: Option<HashMap<String, String>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pm,
            settings: settings.unwrap_or_default(),
            env_overlay: env_overlay.unwrap_or_default(),
            processor: Mutex::new(None),
            run_slot: Arc::new(Mutex::new(())),
        })
    }

    pub fn mode(&self) -> ShellMode {
        self.settings.mode
    }

    pub async fn start(&self) -> Result<()> {
        let mut processor = self.processor.lock().await;
        if processor.is_some() {
            return Ok(());
        }
        let built: Arc<dyn ShellProcessor> = match self.settings.mode {
            ShellMode::Direct => Arc::new(DirectShellProcessor::new(
                self.pm.clone(),
                self.settings.clone(),
                self.env_overlay.clone(),
            )),
            ShellMode::Shell => Arc::new(PersistentShellProcessor::new(
                self.pm.clone(),
                self.settings.clone(),
                self.env_overlay.clone(),
            )),
        };
        built.start().await?;
        *processor = Some(built);
        Ok(())
    }

    pub async fn stop(&self) {
        let processor = self.processor.lock().await.take();
        if let Some(processor) = processor {
            processor.stop().await;
        }
    }

    /// Run a command under the serialization lock with an effective
    /// timeout. The lock releases when the command completes or times out.
    pub async fn run_command(
        &self,
        command: &str,
        timeout_s: Option<f64>,
    ) -> Result<Arc<ManagedShellCommand>> {
        let guard = self.run_slot.clone().lock_owned().await;
        self.start().await?;
        let processor = self
            .processor
            .lock()
            .await
            .clone()
            .expect("processor initialized by start()");

        let effective = timeout_s.or(Some(self.settings.default_timeout_s));
        let inner = processor.run(command).await?;
        let handle = ManagedShellCommand::new(inner, effective, guard);

        // Background waiter guarantees the slot frees even when the caller
        // never waits.
        let waiter = handle.clone();
        tokio::spawn(async move {
            let _ = waiter.wait().await;
        });

        Ok(handle)
    }
}

#[async_trait]
impl ShellRunner for ShellManager {
    async fn run(
        &self,
        command: &str,
        timeout_s: Option<f64>,
    ) -> skein_core::Result<Arc<dyn ShellCommand>> {
        let handle = self
            .run_command(command, timeout_s)
            .await
            .map_err(|e| skein_core::CoreError::Shell(e.to_string()))?;
        Ok(handle as Arc<dyn ShellCommand>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::EnvPolicy;
    use futures::StreamExt;

    fn manager(mode: ShellMode, default_timeout_s: f64) -> Arc<ShellManager> {
        let pm = Arc::new(ProcessManager::new(None, EnvPolicy::from_settings(None)));
        let settings = ShellSettings {
            mode,
            program: "bash".into(),
            args: vec!["--noprofile".into(), "--norc".into()],
            default_timeout_s,
        };
        ShellManager::new(pm, Some(settings), None)
    }

    async fn collect(mut stream: BoxStream<'static, String>) -> String {
        let mut out = String::new();
        while let Some(line) = stream.next().await {
            out.push_str(&line);
        }
        out
    }

    #[tokio::test]
    async fn direct_mode_runs_commands_with_exit_codes() {
        let shells = manager(ShellMode::Direct, 30.0);
        let handle = shells
            .run_command("echo hello; exit 4", None)
            .await
            .unwrap();
        let stdout = handle.stdout();
        let exit = handle.wait().await;
        assert_eq!(exit.code, Some(4));
        assert!(!exit.timed_out);
        assert_eq!(collect(stdout).await, "hello\n");
        shells.stop().await;
    }

    #[tokio::test]
    async fn persistent_mode_completes_via_marker_and_reuses_shell() {
        let shells = manager(ShellMode::Shell, 30.0);

        let first = shells.run_command("export SKEIN_T=1; echo one", None).await.unwrap();
        let first_out = first.stdout();
        let exit = first.wait().await;
        assert_eq!(exit.code, Some(0));
        let out = collect(first_out).await;
        assert_eq!(out, "one\n");
        assert!(!out.contains("SKEIN_MARK"));

        // Commands run in fresh subshells, so exports do not leak, but the
        // shell process itself survives between commands.
        let second = shells.run_command("echo two; exit 7", None).await.unwrap();
        let second_out = second.stdout();
        let exit = second.wait().await;
        assert_eq!(exit.code, Some(7));
        assert_eq!(collect(second_out).await, "two\n");

        shells.stop().await;
    }

    #[tokio::test]
    async fn commands_serialize_one_at_a_time() {
        let shells = manager(ShellMode::Direct, 30.0);
        let slow = shells.run_command("sleep 0.2; echo slow", None).await.unwrap();

        let shells_clone = shells.clone();
        let started = std::time::Instant::now();
        let fast = tokio::spawn(async move {
            shells_clone.run_command("echo fast", None).await.unwrap()
        });

        let _ = slow.wait().await;
        let fast = fast.await.unwrap();
        let exit = fast.wait().await;
        assert_eq!(exit.code, Some(0));
        // The second command could not start before the first finished.
        assert!(started.elapsed() >= std::time::Duration::from_millis(150));
        shells.stop().await;
    }

    #[tokio::test]
    async fn timeout_surfaces_timed_out_flag() {
        let shells = manager(ShellMode::Direct, 30.0);
        let handle = shells
            .run_command("sleep 5", Some(0.2))
            .await
            .unwrap();
        let exit = handle.wait().await;
        assert!(exit.timed_out);
        assert_eq!(exit.code, None);
        shells.stop().await;
    }
}
