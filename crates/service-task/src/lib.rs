use std::future::Future;

use async_trait::async_trait;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct ShutdownHandle(tokio::sync::watch::Sender<()>);

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = tokio::sync::watch::channel(());
        (Self(sender), ShutdownSignal(receiver))
    }

    pub fn signal(&self) {
        let _ = self.0.send(());
    }

    pub async fn all_closed(&self) {
        self.0.closed().await;
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal(tokio::sync::watch::Receiver<()>);

impl ShutdownSignal {
    pub async fn wait(&mut self) {
        let _ = self.0.changed().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.0.has_changed().unwrap_or(true)
    }
}

/// Aborts the running task when dropped.
/// Also see <https://github.com/tokio-rs/tokio/issues/1830> for some background.
#[must_use]
pub struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        ChildTask(tokio::task::spawn(future))
    }

    pub async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }

    /// Immediately abort the task.
    pub fn abort(&self) {
        self.0.abort()
    }

    /// Drop without aborting the task.
    pub fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> From<JoinHandle<T>> for ChildTask<T> {
    fn from(value: JoinHandle<T>) -> Self {
        Self(value)
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

#[async_trait]
pub trait Task {
    type Output: Send;

    const NAME: &'static str;

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output;
}

pub fn spawn_task<T>(task: T, shutdown_signal: ShutdownSignal) -> ChildTask<T::Output>
where
    T: Task + 'static,
{
    let task_fut = task.run(shutdown_signal);
    ChildTask(tokio::task::spawn(task_fut))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signal_wakes_waiters() {
        let (handle, mut signal) = ShutdownHandle::new();
        assert!(!signal.is_shutting_down());

        handle.signal();
        signal.wait().await;
        assert!(signal.is_shutting_down());
    }

    #[tokio::test]
    async fn child_task_aborts_on_drop() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = ChildTask::spawn(async move {
            let _ = rx.await;
        });
        drop(task);
        // The receiver side is dropped together with the aborted task.
        assert!(tx.send(()).is_err());
    }
}
