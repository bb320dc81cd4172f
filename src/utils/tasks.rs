//! Cancellable background tasks
//!
//! Periodic maintenance (health checks, idle cleanup, inactivity detection)
//! runs as a spawned interval loop. The handle is owned by the component that
//! started it and is cancelled exactly once on `destroy`/`shutdown`.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A periodic task with a captured cancellation handle
pub struct BackgroundTask {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn `tick` every `period`. The first run happens one full period
    /// after spawning.
    pub fn spawn_interval<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let child = token.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = interval.tick() => {}
                }
                // A tick that never settles must not hold up cancellation.
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tick() => {}
                }
            }
            debug!("Background task '{}' stopped", task_name);
        });

        debug!("Background task '{}' started (period {:?})", name, period);

        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
            && self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Request cancellation. Returns false if the task was already cancelled.
    pub fn cancel(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Cancel and wait for the loop to exit
    pub async fn stop(mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[derive(Default)]
struct GroupState {
    tasks: Vec<BackgroundTask>,
    closed: bool,
}

/// The set of background tasks owned by one component.
///
/// Stopping the group closes it: no task can be started afterwards.
#[derive(Default)]
pub struct TaskGroup {
    state: Mutex<GroupState>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the task built by `spawn` unless a running task named `name`
    /// exists or the group is closed. The check and the insert happen under
    /// one lock.
    pub fn spawn_if_absent(&self, name: &str, spawn: impl FnOnce() -> BackgroundTask) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.tasks.iter().any(|t| t.name() == name && t.is_running()) {
            return false;
        }
        state.tasks.retain(|t| t.is_running());
        state.tasks.push(spawn());
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().tasks.iter().any(|t| t.name() == name && t.is_running())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of tasks still scheduled
    pub fn active_count(&self) -> usize {
        self.state.lock().tasks.iter().filter(|t| t.is_running()).count()
    }

    /// Close the group, cancel every task and wait for them to finish.
    /// Returns how many were stopped; a second call returns 0.
    pub async fn stop_all(&self) -> usize {
        let tasks: Vec<BackgroundTask> = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.tasks)
        };
        let count = tasks.len();
        for task in tasks {
            task.stop().await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_interval_task_ticks_until_cancelled() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let task = BackgroundTask::spawn_interval("ticker", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(task.is_running());

        assert!(task.cancel());
        assert!(!task.cancel());
        task.stop().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_group_stop_all_is_idempotent() {
        let group = TaskGroup::new();
        assert!(group.spawn_if_absent("a", || BackgroundTask::spawn_interval("a", Duration::from_secs(1), || async {})));
        assert!(group.spawn_if_absent("b", || BackgroundTask::spawn_interval("b", Duration::from_secs(1), || async {})));
        assert!(!group.spawn_if_absent("a", || BackgroundTask::spawn_interval("a", Duration::from_secs(1), || async {})));

        assert_eq!(group.active_count(), 2);
        assert!(group.contains("a"));

        assert_eq!(group.stop_all().await, 2);
        assert_eq!(group.stop_all().await, 0);
        assert_eq!(group.active_count(), 0);
        assert!(group.is_closed());
        assert!(!group.spawn_if_absent("c", || BackgroundTask::spawn_interval("c", Duration::from_secs(1), || async {})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_tick_that_never_settles() {
        let group = TaskGroup::new();
        group.spawn_if_absent("stuck", || {
            BackgroundTask::spawn_interval("stuck", Duration::from_millis(10), || std::future::pending::<()>())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(1), group.stop_all()).await;
        assert_eq!(stopped.ok(), Some(1));
    }
}
