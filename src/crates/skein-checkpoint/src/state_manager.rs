//! Background persistence of workflow executions.
//!
//! Tracks shared executions, keeps a dirty set of changed ids, and flushes
//! one gzip JSON file per execution into the current session directory:
//! `<base>/.vocode/sessions/<YYYY_MM_DD>_<seq>_<session>/<uuid>.json.gz`.
//! A ticker flushes the dirty set every `save_interval_s` seconds and a
//! full flush runs on shutdown. Retention deletes the oldest non-current
//! session directories once the total size exceeds the byte budget.

use chrono::Local;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use skein_core::state::SharedExecution;

use crate::codec;
use crate::error::Result;

/// Callback invoked whenever a tracked execution changes.
pub type WorkflowChangedListener = Arc<dyn Fn(Uuid) + Send + Sync>;

struct Inner {
    executions: HashMap<Uuid, SharedExecution>,
    dirty: HashSet<Uuid>,
    listeners: Vec<WorkflowChangedListener>,
    session_dir_name: Option<String>,
}

pub struct WorkflowStateManager {
    base_path: PathBuf,
    session_id: String,
    save_interval: Duration,
    max_total_log_bytes: u64,
    date_prefix: String,
    inner: parking_lot::Mutex<Inner>,
    ticker: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WorkflowStateManager {
    pub fn new(
        base_path: impl Into<PathBuf>,
        session_id: impl Into<String>,
        save_interval_s: f64,
        max_total_log_bytes: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            base_path: base_path.into(),
            session_id: session_id.into(),
            save_interval: Duration::from_secs_f64(save_interval_s.max(0.01)),
            max_total_log_bytes,
            date_prefix: Local::now().format("%Y_%m_%d").to_string(),
            inner: parking_lot::Mutex::new(Inner {
                executions: HashMap::new(),
                dirty: HashSet::new(),
                listeners: Vec::new(),
                session_dir_name: None,
            }),
            ticker: parking_lot::Mutex::new(None),
        })
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.base_path.join(".vocode").join("sessions")
    }

    /// Current session directory, computing the sequence number on first
    /// use: one above the highest existing sequence for today's date.
    pub fn session_dir(&self) -> PathBuf {
        let mut inner = self.inner.lock();
        if inner.session_dir_name.is_none() {
            inner.session_dir_name = Some(self.compute_session_dir_name());
        }
        self.sessions_root().join(inner.session_dir_name.as_ref().unwrap())
    }

    fn compute_session_dir_name(&self) -> String {
        let root = self.sessions_root();
        let prefix = format!("{}_", self.date_prefix);
        let mut highest = 0u64;
        if let Ok(entries) = std::fs::read_dir(&root) {
            for entry in entries.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(rest) = name.strip_prefix(&prefix) else {
                    continue;
                };
                let Some((seq, _)) = rest.split_once('_') else {
                    continue;
                };
                if let Ok(seq) = seq.parse::<u64>() {
                    highest = highest.max(seq);
                }
            }
        }
        format!("{}_{}_{}", self.date_prefix, highest + 1, self.session_id)
    }

    fn path_for(&self, execution_id: Uuid) -> PathBuf {
        self.session_dir().join(format!("{execution_id}.json.gz"))
    }

    pub fn subscribe(&self, listener: WorkflowChangedListener) {
        self.inner.lock().listeners.push(listener);
    }

    /// Start tracking an execution without marking it dirty.
    pub fn track(&self, execution: SharedExecution) {
        let id = execution.lock().id;
        self.inner.lock().executions.insert(id, execution);
    }

    /// Record a change: the execution joins the dirty set and listeners
    /// fire.
    pub fn notify_changed(&self, execution: SharedExecution) {
        let id = execution.lock().id;
        let listeners = {
            let mut inner = self.inner.lock();
            inner.executions.insert(id, execution);
            inner.dirty.insert(id);
            inner.listeners.clone()
        };
        for listener in listeners {
            listener(id);
        }
    }

    /// Spawn the periodic flush task. Idempotent.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        std::fs::create_dir_all(self.session_dir())?;
        self.enforce_retention();
        let mut ticker = self.ticker.lock();
        if ticker.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return Ok(());
        }
        let manager = self.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.save_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(error) = manager.flush_dirty() {
                    tracing::warn!(%error, "periodic state flush failed");
                }
            }
        }));
        Ok(())
    }

    /// Stop the ticker and flush everything.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(task) = self.ticker.lock().take() {
            task.abort();
        }
        self.flush_all()
    }

    /// Flush executions currently in the dirty set.
    pub fn flush_dirty(&self) -> Result<()> {
        let ids: Vec<Uuid> = {
            let mut inner = self.inner.lock();
            inner.dirty.drain().collect()
        };
        self.flush_ids(&ids)
    }

    /// Flush every tracked execution.
    pub fn flush_all(&self) -> Result<()> {
        let ids: Vec<Uuid> = {
            let mut inner = self.inner.lock();
            inner.dirty.clear();
            inner.executions.keys().copied().collect()
        };
        self.flush_ids(&ids)
    }

    fn flush_ids(&self, ids: &[Uuid]) -> Result<()> {
        for id in ids {
            let Some(execution) = self.inner.lock().executions.get(id).cloned() else {
                continue;
            };
            let snapshot = execution.lock().clone();
            let path = self.path_for(*id);
            codec::save_to_path(&path, &snapshot)?;
        }
        if !ids.is_empty() {
            self.enforce_retention();
        }
        Ok(())
    }

    fn dir_size(path: &Path) -> u64 {
        let mut total = 0u64;
        let Ok(entries) = std::fs::read_dir(path) else {
            return 0;
        };
        for entry in entries.flatten() {
            let p = entry.path();
            if p.is_dir() {
                total += Self::dir_size(&p);
            } else if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
        total
    }

    /// Delete oldest non-current session directories until the total size
    /// fits the budget.
    pub fn enforce_retention(&self) {
        if self.max_total_log_bytes == 0 {
            return;
        }
        let root = self.sessions_root();
        let current = self.inner.lock().session_dir_name.clone();

        let mut sessions: Vec<(std::time::SystemTime, String, PathBuf, u64)> = Vec::new();
        let mut total = 0u64;
        let Ok(entries) = std::fs::read_dir(&root) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            let size = Self::dir_size(&path);
            total += size;
            sessions.push((
                mtime,
                entry.file_name().to_string_lossy().to_string(),
                path,
                size,
            ));
        }
        if total <= self.max_total_log_bytes {
            return;
        }

        sessions.sort_by_key(|(mtime, _, _, _)| *mtime);
        for (_, name, path, size) in sessions {
            if total <= self.max_total_log_bytes {
                return;
            }
            if Some(&name) == current.as_ref() {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => total = total.saturating_sub(size),
                Err(error) => {
                    tracing::warn!(%error, session = %name, "failed to delete old session");
                }
            }
        }
        if total > self.max_total_log_bytes {
            tracing::warn!(
                total_bytes = total,
                limit_bytes = self.max_total_log_bytes,
                "session log retention limit exceeded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::state::{shared, Message, NodeExecution, Step, StepType, WorkflowExecution};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample() -> SharedExecution {
        let mut run = WorkflowExecution::new("wf");
        let ne = NodeExecution::new("n");
        let ne_id = ne.id;
        run.insert_node_execution(ne);
        run.upsert_step(
            Step::new(ne_id, StepType::OutputMessage).with_message(Message::assistant("x")),
        );
        shared(run)
    }

    #[test]
    fn session_dir_name_increments_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let m1 = WorkflowStateManager::new(dir.path(), "abc", 120.0, 0);
        let d1 = m1.session_dir();
        std::fs::create_dir_all(&d1).unwrap();
        let m2 = WorkflowStateManager::new(dir.path(), "def", 120.0, 0);
        let d2 = m2.session_dir();

        let n1 = d1.file_name().unwrap().to_string_lossy().to_string();
        let n2 = d2.file_name().unwrap().to_string_lossy().to_string();
        assert!(n1.ends_with("_abc"));
        assert!(n2.ends_with("_def"));
        let seq = |n: &str| {
            n.split('_')
                .nth(3)
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap()
        };
        assert_eq!(seq(&n2), seq(&n1) + 1);
    }

    #[test]
    fn flush_dirty_writes_only_changed_executions() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkflowStateManager::new(dir.path(), "s", 120.0, 0);

        let tracked = sample();
        let changed = sample();
        let changed_id = changed.lock().id;
        manager.track(tracked);
        manager.notify_changed(changed);
        manager.flush_dirty().unwrap();

        let files: Vec<String> = std::fs::read_dir(manager.session_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(files, vec![format!("{changed_id}.json.gz")]);

        // A second flush_dirty is a no-op until the next change.
        manager.flush_dirty().unwrap();
        let restored =
            codec::load_from_path(&manager.session_dir().join(format!("{changed_id}.json.gz")))
                .unwrap();
        assert_eq!(restored.id, changed_id);
    }

    #[test]
    fn flush_all_covers_tracked_executions() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkflowStateManager::new(dir.path(), "s", 120.0, 0);
        manager.track(sample());
        manager.track(sample());
        manager.flush_all().unwrap();
        let count = std::fs::read_dir(manager.session_dir()).unwrap().count();
        assert_eq!(count, 2);
    }

    #[test]
    fn listeners_fire_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkflowStateManager::new(dir.path(), "s", 120.0, 0);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        manager.subscribe(Arc::new(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));
        manager.notify_changed(sample());
        manager.notify_changed(sample());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retention_deletes_oldest_non_current_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join(".vocode").join("sessions");
        // Two fake old sessions with some bulk.
        for (name, age) in [("2001_01_01_1_old", 3600), ("2002_01_01_1_older", 1800)] {
            let session = root.join(name);
            std::fs::create_dir_all(&session).unwrap();
            std::fs::write(session.join("blob.json.gz"), vec![0u8; 4096]).unwrap();
            let mtime = std::time::SystemTime::now() - Duration::from_secs(age);
            let file = std::fs::File::open(&session).unwrap();
            let _ = file.set_modified(mtime);
        }

        let manager = WorkflowStateManager::new(dir.path(), "current", 120.0, 6000);
        std::fs::create_dir_all(manager.session_dir()).unwrap();
        std::fs::write(manager.session_dir().join("live.json.gz"), vec![0u8; 1024]).unwrap();

        manager.enforce_retention();

        // The oldest session went first; the current session survives.
        assert!(!root.join("2001_01_01_1_old").exists());
        assert!(manager.session_dir().exists());
        let total: u64 = std::fs::read_dir(&root)
            .unwrap()
            .map(|e| WorkflowStateManager::dir_size(&e.unwrap().path()))
            .sum();
        assert!(total <= 6000);
    }
}
