//! Background worker threads and cooperative cancellation.
//!
//! Workers are named OS threads. A [`StopToken`] is checked by the worker
//! once per loop iteration; setting it never interrupts a call in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Advisory stop flag shared between a worker and whoever controls it.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag before a new run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Join handle for a spawned worker.
pub struct WorkerHandle<T> {
    name: String,
    inner: JoinHandle<T>,
}

impl<T> WorkerHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Wait for the worker. A panic inside the worker is logged and yields `None`.
    pub fn join(self) -> Option<T> {
        match self.inner.join() {
            Ok(value) => Some(value),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!("Worker {}: panicked: {}", self.name, reason);
                None
            }
        }
    }
}

/// Spawn a named worker thread.
pub fn spawn_worker<T, F>(name: impl Into<String>, f: F) -> std::io::Result<WorkerHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let name = name.into();
    let inner = thread::Builder::new().name(name.clone()).spawn(f)?;
    log::debug!("Worker {}: spawned", name);
    Ok(WorkerHandle { name, inner })
}
