//! # Root Supervisor
//!
//! Every long-lived task of the relay (ingress readers, provider workers, the
//! dial and failover routines) is spawned through the `Supervisor`, which
//! records how each one ended. It never restarts anything: a failed task stays
//! failed, exactly as if it had been spawned bare.
//!
//! Two extra channels hang off it:
//! - **fatal**: tasks spawned with [`spawn_critical`](Supervisor::spawn_critical)
//!   report their failure here; the binary exits on the first report.
//! - **shutdown**: [`shutdown`](Supervisor::shutdown) cancels every task that is
//!   still running and waits for all of them to finish.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::RelayError;

/// Lifecycle of one supervised task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Completed,
    Failed(String),
    /// Stopped by [`Supervisor::shutdown`].
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

struct Inner {
    tasks: watch::Sender<BTreeMap<String, TaskState>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    fatal: CancellationToken,
    fatal_reason: OnceLock<String>,
}

impl Inner {
    fn report_fatal(&self, reason: String) {
        // Only the first report is kept.
        let _ = self.fatal_reason.set(reason);
        self.fatal.cancel();
    }
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (tasks, _) = watch::channel(BTreeMap::new());
        Self {
            inner: Arc::new(Inner {
                tasks,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                fatal: CancellationToken::new(),
                fatal_reason: OnceLock::new(),
            }),
        }
    }

    /// Spawns a task whose failure only ends that task.
    pub fn spawn<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), RelayError>> + Send + 'static,
    {
        self.spawn_inner(name.into(), task, false);
    }

    /// Spawns a setup task whose failure is fatal for the whole process.
    pub fn spawn_critical<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), RelayError>> + Send + 'static,
    {
        self.spawn_inner(name.into(), task, true);
    }

    fn spawn_inner<F>(&self, name: String, task: F, critical: bool)
    where
        F: Future<Output = Result<(), RelayError>> + Send + 'static,
    {
        self.inner.tasks.send_modify(|tasks| {
            tasks.insert(name.clone(), TaskState::Running);
        });

        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move {
            let outcome = tokio::select! {
                result = task => match result {
                    Ok(()) => TaskState::Completed,
                    Err(e) => TaskState::Failed(e.to_string()),
                },
                _ = inner.shutdown.cancelled() => TaskState::Cancelled,
            };

            match &outcome {
                TaskState::Failed(reason) => log::error!("Task '{}' failed: {}", name, reason),
                other => log::info!("Task '{}' ended: {:?}", name, other),
            }

            if critical {
                if let TaskState::Failed(reason) = &outcome {
                    inner.report_fatal(format!("{name}: {reason}"));
                }
            }

            inner.tasks.send_modify(|tasks| {
                tasks.insert(name, outcome);
            });
        });
    }

    pub fn state(&self, name: &str) -> Option<TaskState> {
        self.inner.tasks.borrow().get(name).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, TaskState> {
        self.inner.tasks.borrow().clone()
    }

    /// Removes every ended task whose name starts with `prefix` and returns how
    /// many were removed. A `wait_terminal` on a removed name never returns.
    pub fn forget_finished(&self, prefix: &str) -> usize {
        let mut removed = 0;
        self.inner.tasks.send_if_modified(|tasks| {
            let before = tasks.len();
            tasks.retain(|name, state| !(name.starts_with(prefix) && state.is_terminal()));
            removed = before - tasks.len();
            removed > 0
        });
        removed
    }

    /// Waits until the named task has been spawned and has ended.
    pub async fn wait_terminal(&self, name: &str) -> TaskState {
        let mut tasks = self.inner.tasks.subscribe();
        let state = tasks
            .wait_for(|tasks| tasks.get(name).is_some_and(TaskState::is_terminal))
            .await
            .expect("supervisor owns the sender");
        state.get(name).cloned().unwrap_or(TaskState::Running)
    }

    /// Reports a fatal setup failure that happened outside a supervised task,
    /// such as a failed ingress upgrade.
    pub fn report_fatal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        log::error!("Fatal: {}", reason);
        self.inner.report_fatal(reason);
    }

    /// Waits for the first failure of a critical task and returns its reason.
    pub async fn fatal(&self) -> String {
        self.inner.fatal.cancelled().await;
        self.inner.fatal_reason.get().cloned().unwrap_or_default()
    }

    /// Cancels every running task and waits for all of them to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn records_terminal_state_per_task() {
        let supervisor = Supervisor::new();
        supervisor.spawn("ok", async { Ok(()) });
        supervisor.spawn("broken", async { Err(RelayError::IngressClosed) });

        assert_eq!(supervisor.wait_terminal("ok").await, TaskState::Completed);
        assert_eq!(
            supervisor.wait_terminal("broken").await,
            TaskState::Failed("ingress connection closed".to_string())
        );
    }

    #[tokio::test]
    async fn plain_failures_are_not_fatal() {
        let supervisor = Supervisor::new();
        supervisor.spawn("worker", async { Err(RelayError::Transport("reset".into())) });
        supervisor.wait_terminal("worker").await;

        let fatal = tokio::time::timeout(Duration::from_millis(50), supervisor.fatal()).await;
        assert!(fatal.is_err());
    }

    #[tokio::test]
    async fn critical_failure_is_reported() {
        let supervisor = Supervisor::new();
        supervisor.spawn_critical("dial-primary", async {
            Err(RelayError::Dial {
                endpoint: "ws://nowhere".into(),
                reason: "refused".into(),
            })
        });

        let reason = supervisor.fatal().await;
        assert!(reason.starts_with("dial-primary:"));
        assert!(reason.contains("refused"));
    }

    #[tokio::test]
    async fn first_fatal_report_wins() {
        let supervisor = Supervisor::new();
        supervisor.report_fatal("ingress upgrade failed");
        supervisor.report_fatal("something later");
        assert_eq!(supervisor.fatal().await, "ingress upgrade failed");
    }

    #[tokio::test]
    async fn forget_finished_keeps_running_and_unrelated_tasks() {
        let supervisor = Supervisor::new();
        supervisor.spawn("ingress-1", async { Ok(()) });
        supervisor.spawn("ingress-2", async {
            std::future::pending::<()>().await;
            Ok(())
        });
        supervisor.spawn("worker-main", async { Ok(()) });
        supervisor.wait_terminal("ingress-1").await;
        supervisor.wait_terminal("worker-main").await;

        assert_eq!(supervisor.forget_finished("ingress-"), 1);

        let names: Vec<_> = supervisor.snapshot().into_keys().collect();
        assert_eq!(names, ["ingress-2", "worker-main"]);
    }

    #[tokio::test]
    async fn shutdown_cancels_running_tasks() {
        let supervisor = Supervisor::new();
        supervisor.spawn("forever", async {
            std::future::pending::<()>().await;
            Ok(())
        });
        assert_eq!(supervisor.state("forever"), Some(TaskState::Running));

        supervisor.shutdown().await;
        assert_eq!(supervisor.state("forever"), Some(TaskState::Cancelled));
    }
}
