//! Process lifecycle: one shutdown signal, tracked background tasks, bounded drain.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::error::FatalError;

/// How the process ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    Clean,
    Failed(FatalError),
}

impl Exit {
    pub fn code(&self) -> u8 {
        match self {
            Exit::Clean => 0,
            Exit::Failed(_) => 1,
        }
    }
}

struct Inner {
    shutdown: CancellationToken,
    tasks: TaskTracker,
    fatal: Mutex<Option<FatalError>>,
}

/// Cheap to clone; all clones share one shutdown token and task set.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                fatal: Mutex::new(None),
            }),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Run `fut` as a tracked task. A panic inside it is logged and contained.
    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.tasks.spawn(async move {
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                error!(task = name, panic = %panic_message(panic.as_ref()), "background task panicked");
            }
        });
    }

    /// Begin a clean shutdown.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("shutdown requested");
        }
        self.inner.shutdown.cancel();
    }

    /// Record a fatal condition and begin shutdown. Only the first one is kept.
    pub fn fail(&self, err: FatalError) {
        {
            let mut slot = self.inner.fatal.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                error!(error = %err, "fatal condition, shutting down");
                *slot = Some(err);
            }
        }
        self.inner.shutdown.cancel();
    }

    pub fn fatal(&self) -> Option<FatalError> {
        self.inner
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cancel everything and wait up to `timeout` for tracked tasks to finish.
    pub async fn drain(&self, timeout: Duration) -> Exit {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        info!(tasks = self.inner.tasks.len(), "waiting for background tasks");
        if tokio::time::timeout(timeout, self.inner.tasks.wait())
            .await
            .is_err()
        {
            self.fail(FatalError::ShutdownTimeout(timeout));
        }
        match self.fatal() {
            Some(err) => Exit::Failed(err),
            None => Exit::Clean,
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
