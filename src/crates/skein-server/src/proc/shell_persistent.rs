//! Persistent shell mode.
//!
//! A single long-lived shell process runs every command. Each command is
//! wrapped in a fresh subshell so parse errors cannot wedge the session,
//! and always prints a unique marker line `<marker>:<exit_code>` that the
//! stdout pump consumes to complete the command. Marker lines never reach
//! consumers. One command is active at a time.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use skein_core::config::ShellSettings;

use crate::error::{Result, ServerError};
use crate::proc::shell::{RawShellCommand, ShellProcessor};
use crate::proc::{ProcessHandle, ProcessManager};

/// Quote a string for POSIX shell single-quoted context.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Wrap a user command so it runs in a fresh subshell and always emits one
/// `<marker>:<rc>` line afterwards.
pub fn wrap_command_with_marker(settings: &ShellSettings, command: &str, marker: &str) -> String {
    let mut tokens: Vec<String> = vec![settings.program.clone()];
    tokens.extend(settings.args.iter().cloned());
    tokens.push("-c".to_string());
    tokens.push(command.to_string());
    let inner = tokens
        .iter()
        .map(|t| shell_quote(t))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "rc=127; {{ {inner}; rc=$?; }}; echo {}:\"$rc\"\n",
        shell_quote(marker)
    )
}

/// Parse a potential marker line; returns the exit code when it matches.
/// A marker line with a garbled or missing code still completes the
/// command with code 0.
pub fn parse_marker_line(line: &str, marker: &str) -> Option<i32> {
    let text = line.trim_end_matches(['\r', '\n']);
    let suffix = text.strip_prefix(marker)?;
    match suffix.strip_prefix(':') {
        Some(rc) => rc.parse().ok().or(Some(0)),
        None => Some(0),
    }
}

type SharedLines = Arc<Mutex<BoxStream<'static, String>>>;

pub struct PersistentShellProcessor {
    pm: Arc<ProcessManager>,
    settings: ShellSettings,
    env_overlay: HashMap<String, String>,
    state: Mutex<Option<ShellState>>,
}

struct ShellState {
    handle: Arc<ProcessHandle>,
    stdout: SharedLines,
    stderr: SharedLines,
}

impl PersistentShellProcessor {
    pub fn new(
        pm: Arc<ProcessManager>,
        settings: ShellSettings,
        env_overlay: HashMap<String, String>,
    ) -> Self {
        Self {
            pm,
            settings,
            env_overlay,
            state: Mutex::new(None),
        }
    }

    async fn ensure_started(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.as_ref() {
            if existing.handle.alive() {
                return Ok(());
            }
        }
        let handle = self.pm.spawn(
            &self.settings.program,
            &self.settings.args,
            Some(&self.env_overlay),
        )?;
        let stdout: SharedLines = Arc::new(Mutex::new(handle.stdout()));
        let stderr: SharedLines = Arc::new(Mutex::new(handle.stderr()));
        *state = Some(ShellState {
            handle,
            stdout,
            stderr,
        });
        Ok(())
    }
}

pub struct PersistentShellCommand {
    marker: String,
    done: watch::Receiver<Option<i32>>,
    stdout_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    stderr_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    shell: Arc<ProcessHandle>,
}

#[async_trait]
impl RawShellCommand for PersistentShellCommand {
    fn stdout(&self) -> BoxStream<'static, String> {
        match self.stdout_rx.lock().take() {
            Some(rx) => tokio_stream::wrappers::UnboundedReceiverStream::new(rx).boxed(),
            None => futures::stream::empty().boxed(),
        }
    }

    fn stderr(&self) -> BoxStream<'static, String> {
        match self.stderr_rx.lock().take() {
            Some(rx) => tokio_stream::wrappers::UnboundedReceiverStream::new(rx).boxed(),
            None => futures::stream::empty().boxed(),
        }
    }

    async fn wait(&self) -> Option<i32> {
        let mut done = self.done.clone();
        loop {
            if let Some(rc) = *done.borrow() {
                return Some(rc);
            }
            if done.changed().await.is_err() {
                return (*done.borrow()).or(Some(1));
            }
        }
    }

    async fn terminate(&self, grace_s: f64) {
        // The whole shell goes down with the command; the manager restarts
        // it on the next run.
        self.shell.terminate(grace_s).await;
        self.shell.kill().await;
    }
}

impl std::fmt::Debug for PersistentShellCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentShellCommand")
            .field("marker", &self.marker)
            .finish()
    }
}

#[async_trait]
impl ShellProcessor for PersistentShellProcessor {
    async fn start(&self) -> Result<()> {
        self.ensure_started().await
    }

    async fn stop(&self) {
        let state = self.state.lock().await.take();
        if let Some(state) = state {
            state.handle.terminate(1.0).await;
            state.handle.kill().await;
        }
    }

    async fn run(&self, command: &str) -> Result<Arc<dyn RawShellCommand>> {
        self.ensure_started().await?;
        let (shell, shared_stdout, shared_stderr) = {
            let state = self.state.lock().await;
            let state = state
                .as_ref()
                .ok_or_else(|| ServerError::Shell("shell not started".into()))?;
            (state.handle.clone(), state.stdout.clone(), state.stderr.clone())
        };

        let marker = format!("SKEIN_MARK_{}", Uuid::new_v4().simple());
        let wrapped = wrap_command_with_marker(&self.settings, command, &marker);

        let (done_tx, done_rx) = watch::channel(None);
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();

        // stdout pump: forward lines until the marker (never forwarded),
        // then publish the exit code. Shell EOF without a marker counts as
        // a failed command.
        let pump_marker = marker.clone();
        let pump_done = done_tx.clone();
        let pump_stdout = shared_stdout.clone();
        tokio::spawn(async move {
            let mut lines = pump_stdout.lock().await;
            loop {
                match lines.next().await {
                    Some(line) => {
                        if let Some(rc) = parse_marker_line(&line, &pump_marker) {
                            let _ = pump_done.send(Some(rc));
                            return;
                        }
                        if stdout_tx.send(line).is_err() {
                            // Consumer gone; keep draining to the marker so
                            // the command still completes.
                            continue;
                        }
                    }
                    None => {
                        let _ = pump_done.send(Some(1));
                        return;
                    }
                }
            }
        });

        // stderr pump: forward until the command is done.
        let mut pump_err_done = done_rx.clone();
        let pump_stderr = shared_stderr.clone();
        tokio::spawn(async move {
            let mut lines = pump_stderr.lock().await;
            loop {
                tokio::select! {
                    line = lines.next() => match line {
                        Some(line) => {
                            if stderr_tx.send(line).is_err() {
                                continue;
                            }
                        }
                        None => return,
                    },
                    changed = pump_err_done.changed() => {
                        if changed.is_err() || pump_err_done.borrow().is_some() {
                            return;
                        }
                    }
                }
            }
        });

        shell.write(&wrapped).await?;

        Ok(Arc::new(PersistentShellCommand {
            marker,
            done: done_rx,
            stdout_rx: parking_lot::Mutex::new(Some(stdout_rx)),
            stderr_rx: parking_lot::Mutex::new(Some(stderr_rx)),
            shell,
        }))
    }
}
