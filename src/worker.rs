//! The background event worker.
//!
//! Every radio future runs on a dedicated tokio runtime owned by the adapter.
//! The synchronous API ships a future over with [`Worker::run`] and parks the
//! calling thread on a oneshot reply, so callers never drive an event loop
//! themselves. Calling into the blocking API from inside an async task panics.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;

use crate::{Error, Result};

pub(crate) struct EventLoop {
    runtime: Option<Runtime>,
}

impl EventLoop {
    pub(crate) fn start(thread_name: &str) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(thread_name)
            .enable_all()
            .build()?;

        log::trace!("Started event worker {:?}", thread_name);

        Ok(Self {
            runtime: Some(runtime),
        })
    }

    pub(crate) fn worker(&self) -> Worker {
        let handle = match &self.runtime {
            Some(runtime) => runtime.handle().clone(),
            None => unreachable!("runtime is only taken on drop"),
        };
        Worker { handle }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
            log::trace!("Event worker shut down");
        }
    }
}

/// Cheap handle for submitting work to the event worker.
#[derive(Debug, Clone)]
pub(crate) struct Worker {
    handle: Handle,
}

impl Worker {
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }

    /// Runs `future` on the worker and blocks until it completes.
    ///
    /// Once the worker has shut down the future is dropped unpolled and the
    /// call fails with [`Error::NotConnected`].
    pub(crate) fn run<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.handle.spawn(async move {
            reply.send(future.await).ok();
        });
        response.blocking_recv().unwrap_or(Err(Error::NotConnected))
    }

    /// Like [`run`](Self::run), failing with [`Error::Timeout`] once `timeout`
    /// elapses. The abandoned future is dropped on the worker.
    pub(crate) fn run_timeout<F, T>(&self, timeout: Duration, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.run(async move {
            match tokio::time::timeout(timeout, future).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(timeout)),
            }
        })
    }
}
