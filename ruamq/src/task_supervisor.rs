use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};

#[derive(Debug, Default)]
struct TaskSupervisorState {
    running: AtomicU64,
    stop: CancellationToken,
    stopped: CancellationToken,
}

impl TaskSupervisorState {
    fn finish_task(&self) {
        let running = self.running.fetch_sub(1, Ordering::AcqRel) - 1;
        if running == 0 {
            self.stopped.cancel();
        }
    }
}

/// Tracks consume loops and in-flight handlers of a client.
///
/// [`stop`](Self::stop) asks consume loops to exit; [`all_stopped`]
/// resolves once they and every handler started before have finished.
///
/// [`all_stopped`]: Self::all_stopped
#[derive(Debug)]
pub struct TaskSupervisor(Arc<TaskSupervisorState>);

/// Counts one running task until dropped.
#[derive(Debug)]
pub struct TaskSupervisorGuard(Arc<TaskSupervisorState>);

impl TaskSupervisor {
    /// Creates a supervisor. Must be called inside a tokio runtime.
    #[must_use]
    pub fn create() -> Self {
        let supervisor = Self(Arc::default());

        // holds the count above zero until stop is requested.
        let guard = supervisor.start_task();
        tokio::spawn(async move {
            guard.stopped().await;
        });

        supervisor
    }

    /// Asks every supervised task to stop. Idempotent.
    pub fn stop(&self) {
        self.0.stop.cancel();
    }

    /// Whether [`stop`](Self::stop) was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.stop.is_cancelled()
    }

    /// Returns a guard calling [`stop`](Self::stop) when dropped.
    #[must_use]
    pub fn drop_guard(&self) -> DropGuard {
        self.0.stop.clone().drop_guard()
    }

    /// Resolves once stop was requested and every supervised task finished.
    pub fn all_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stopped.cancelled()
    }

    /// Number of supervised tasks still running, including the one holding
    /// the count up until stop is requested.
    #[must_use]
    pub fn running(&self) -> u64 {
        self.0.running.load(Ordering::Acquire)
    }

    /// Counts a task as running until the returned guard is dropped.
    #[must_use]
    pub fn start_task(&self) -> TaskSupervisorGuard {
        self.0.running.fetch_add(1, Ordering::AcqRel);
        TaskSupervisorGuard(self.0.clone())
    }

    /// Spawns a supervised async task. The task receives its guard so it can
    /// watch for stop requests.
    pub fn spawn<F, Fut>(&self, f: F)
    where
        F: FnOnce(TaskSupervisorGuard) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(f(self.start_task()));
    }

    /// Runs `f` on the blocking thread pool as a supervised task.
    pub fn spawn_blocking(&self, f: impl FnOnce() + Send + 'static) {
        let guard = self.start_task();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            f();
        });
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskSupervisorGuard {
    /// Resolves once stop is requested.
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }
}

impl Drop for TaskSupervisorGuard {
    fn drop(&mut self) {
        self.0.finish_task();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_task_supervisor() {
        let supervisor = TaskSupervisor::create();
        assert_eq!(supervisor.running(), 1);

        supervisor.stop();
        supervisor.all_stopped().await;
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test]
    async fn test_waits_for_supervised_tasks() {
        let supervisor = TaskSupervisor::create();
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        supervisor.spawn_blocking(move || {
            let _ = rx.recv_timeout(Duration::from_secs(5));
        });
        supervisor.spawn(|guard| async move {
            guard.stopped().await;
        });
        assert_eq!(supervisor.running(), 3);

        supervisor.stop();
        assert!(supervisor.is_stopped());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.running(), 1);

        tx.send(()).unwrap();
        supervisor.all_stopped().await;
        assert_eq!(supervisor.running(), 0);
    }
}
