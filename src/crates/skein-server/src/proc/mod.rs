//! Process spawning primitives.
//!
//! [`ProcessManager`] spawns subprocesses with an environment policy
//! (inherit/allowlist/denylist/defaults) and hands back a
//! [`ProcessHandle`] exposing line-oriented stdout/stderr streams, stdin
//! writes and termination. The shell processors build on top of this.

pub mod shell;
pub mod shell_direct;
pub mod shell_persistent;

pub use shell::{ManagedShellCommand, ShellManager};

use futures::stream::BoxStream;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use skein_core::config::ProcessEnvSettings;

use crate::error::{Result, ServerError};

/// Environment construction policy for spawned processes.
#[derive(Debug, Clone, Default)]
pub struct EnvPolicy {
    pub inherit_parent: bool,
    pub allowlist: Option<Vec<String>>,
    pub denylist: Option<Vec<String>>,
    pub defaults: HashMap<String, String>,
}

impl EnvPolicy {
    pub fn from_settings(settings: Option<&ProcessEnvSettings>) -> Self {
        match settings {
            Some(env) => Self {
                inherit_parent: env.inherit_parent,
                allowlist: env.allowlist.clone(),
                denylist: env.denylist.clone(),
                defaults: env.defaults.clone(),
            },
            None => Self {
                inherit_parent: true,
                ..Default::default()
            },
        }
    }

    /// Compute the final environment map.
    pub fn build(&self, overlay: Option<&HashMap<String, String>>) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = HashMap::new();
        if self.inherit_parent {
            for (k, v) in std::env::vars() {
                env.insert(k, v);
            }
        }
        if let Some(allow) = &self.allowlist {
            env.retain(|k, _| allow.contains(k));
        }
        if let Some(deny) = &self.denylist {
            env.retain(|k, _| !deny.contains(k));
        }
        for (k, v) in &self.defaults {
            env.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if let Some(overlay) = overlay {
            for (k, v) in overlay {
                env.insert(k.clone(), v.clone());
            }
        }
        env
    }
}

/// A spawned subprocess with line streams and cooperative termination.
pub struct ProcessHandle {
    child: Arc<tokio::sync::Mutex<tokio::process::Child>>,
    stdin: tokio::sync::Mutex<Option<tokio::process::ChildStdin>>,
    stdout_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    stderr_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    exit: watch::Receiver<Option<i32>>,
}

impl ProcessHandle {
    /// Take the stdout line stream. Lines keep their trailing newline.
    pub fn stdout(&self) -> BoxStream<'static, String> {
        receiver_stream(self.stdout_rx.lock().take())
    }

    /// Take the stderr line stream.
    pub fn stderr(&self) -> BoxStream<'static, String> {
        receiver_stream(self.stderr_rx.lock().take())
    }

    pub async fn write(&self, data: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(ServerError::Shell("stdin closed".into()));
        };
        stdin
            .write_all(data.as_bytes())
            .await
            .map_err(|e| ServerError::Shell(format!("stdin write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| ServerError::Shell(format!("stdin flush failed: {e}")))?;
        Ok(())
    }

    pub async fn close_stdin(&self) {
        self.stdin.lock().await.take();
    }

    pub fn alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Wait for the process to exit; returns the exit code when known.
    pub async fn wait(&self) -> Option<i32> {
        let mut exit = self.exit.clone();
        loop {
            if let Some(code) = *exit.borrow() {
                return Some(code);
            }
            if exit.changed().await.is_err() {
                return *exit.borrow();
            }
        }
    }

    /// Kill the process, waiting up to `grace_s` for it to exit first.
    pub async fn terminate(&self, grace_s: f64) {
        if !self.alive() {
            return;
        }
        let mut exit = self.exit.clone();
        let grace = Duration::from_secs_f64(grace_s.max(0.0));
        let exited = tokio::time::timeout(grace, async {
            while exit.borrow().is_none() {
                if exit.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok();
        if !exited {
            self.kill().await;
        }
    }

    pub async fn kill(&self) {
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
    }
}

fn receiver_stream(rx: Option<mpsc::UnboundedReceiver<String>>) -> BoxStream<'static, String> {
    use futures::StreamExt;
    match rx {
        Some(rx) => tokio_stream::wrappers::UnboundedReceiverStream::new(rx).boxed(),
        None => futures::stream::empty().boxed(),
    }
}

/// Spawns subprocesses under one environment policy and default cwd.
pub struct ProcessManager {
    default_cwd: Option<PathBuf>,
    env_policy: EnvPolicy,
}

impl ProcessManager {
    pub fn new(default_cwd: Option<PathBuf>, env_policy: EnvPolicy) -> Self {
        Self {
            default_cwd,
            env_policy,
        }
    }

    /// Spawn `program args...` with piped stdio.
    pub fn spawn(
        &self,
        program: &str,
        args: &[String],
        env_overlay: Option<&HashMap<String, String>>,
    ) -> Result<Arc<ProcessHandle>> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .envs(self.env_policy.build(env_overlay))
            .kill_on_drop(true);
        if let Some(cwd) = &self.default_cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ServerError::Shell(format!("failed to spawn '{program}': {e}")))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = stdout {
            tokio::spawn(pump_lines(stdout, stdout_tx));
        }
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        if let Some(stderr) = stderr {
            tokio::spawn(pump_lines(stderr, stderr_tx));
        }

        let child = Arc::new(tokio::sync::Mutex::new(child));
        let (exit_tx, exit_rx) = watch::channel(None);

        // Poll for exit without holding the child lock across an await, so
        // kill() stays responsive.
        let waiter_child = child.clone();
        tokio::spawn(async move {
            loop {
                {
                    let mut child = waiter_child.lock().await;
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            let _ = exit_tx.send(Some(status.code().unwrap_or(-1)));
                            return;
                        }
                        Ok(None) => {}
                        Err(_) => {
                            let _ = exit_tx.send(Some(-1));
                            return;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        });

        Ok(Arc::new(ProcessHandle {
            child,
            stdin: tokio::sync::Mutex::new(stdin),
            stdout_rx: parking_lot::Mutex::new(Some(stdout_rx)),
            stderr_rx: parking_lot::Mutex::new(Some(stderr_rx)),
            exit: exit_rx,
        }))
    }
}

async fn pump_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(format!("{line}\n")).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_policy_applies_lists_and_defaults() {
        std::env::set_var("SKEIN_ENV_KEEP", "yes");
        std::env::set_var("SKEIN_ENV_DROP", "no");
        let policy = EnvPolicy {
            inherit_parent: true,
            allowlist: None,
            denylist: Some(vec!["SKEIN_ENV_DROP".into()]),
            defaults: HashMap::from([("SKEIN_ENV_DEFAULT".into(), "d".into())]),
        };
        let mut overlay = HashMap::new();
        overlay.insert("SKEIN_ENV_OVERLAY".into(), "o".into());
        let env = policy.build(Some(&overlay));
        assert_eq!(env.get("SKEIN_ENV_KEEP").map(String::as_str), Some("yes"));
        assert!(!env.contains_key("SKEIN_ENV_DROP"));
        assert_eq!(env.get("SKEIN_ENV_DEFAULT").map(String::as_str), Some("d"));
        assert_eq!(env.get("SKEIN_ENV_OVERLAY").map(String::as_str), Some("o"));
        std::env::remove_var("SKEIN_ENV_KEEP");
        std::env::remove_var("SKEIN_ENV_DROP");
    }

    #[tokio::test]
    async fn spawn_captures_output_and_exit_code() {
        use futures::StreamExt;
        let manager = ProcessManager::new(None, EnvPolicy::from_settings(None));
        let handle = manager
            .spawn(
                "sh",
                &["-c".to_string(), "echo out; echo err 1>&2; exit 3".to_string()],
                None,
            )
            .unwrap();

        let mut stdout = handle.stdout();
        let mut stderr = handle.stderr();
        let code = handle.wait().await;
        assert_eq!(code, Some(3));

        let mut out = String::new();
        while let Some(line) = stdout.next().await {
            out.push_str(&line);
        }
        let mut err = String::new();
        while let Some(line) = stderr.next().await {
            err.push_str(&line);
        }
        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");
    }
}
