use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::WorkerError;

/// Bounded offload boundary between the dispatch loop and slow work.
///
/// At most `size` jobs run at once; the rest wait for a permit. CPU-bound
/// closures go through [`WorkerPool::run_blocking`], async collaborator
/// calls through [`WorkerPool::spawn`].
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    pub async fn run_blocking<F, T>(&self, job: F) -> Result<T, WorkerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::Closed)?;

        let output = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await?;
        Ok(output)
    }

    /// The returned handle can be aborted; the permit is released either way.
    pub fn spawn<F>(&self, job: F) -> JoinHandle<Result<F::Output, WorkerError>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::Closed)?;
            Ok(job.await)
        })
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
