//! Explicit execution context threaded through every component.
//!
//! The worker pool and the logging facade are held by value on an
//! `EngineContext` that every component receives explicitly, together with
//! the cooperative cancellation flag, rather than reached through
//! process-wide singletons.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use scoped_threadpool::Pool;
use std::sync::Mutex;

/// Structured logging context attached to every message the engine emits.
#[derive(Debug, Clone, Default)]
pub struct LogContext {
    pub unit: Option<String>,
    pub window: Option<usize>,
    pub iteration: Option<u32>,
    pub partition: Option<usize>,
}

impl LogContext {
    pub fn partition(partition: usize, window: usize) -> Self {
        LogContext { partition: Some(partition), window: Some(window), ..Default::default() }
    }

    fn format(&self) -> String {
        let mut parts = Vec::new();
        if let Some(p) = self.partition {
            parts.push(format!("partition={p}"));
        }
        if let Some(w) = self.window {
            parts.push(format!("window={w}"));
        }
        if let Some(k) = self.iteration {
            parts.push(format!("iter={k}"));
        }
        if let Some(u) = &self.unit {
            parts.push(format!("unit={u}"));
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!(" [{}]", parts.join(", "))
        }
    }
}

/// Shared, explicitly-passed execution context.
///
/// Holds the worker pool used by units that declare internal parallelism and
/// the cooperative cancellation flag polled by the simulator between unit
/// simulations and between iterations.
pub struct EngineContext {
    pool: Mutex<Pool>,
    cancel: Arc<AtomicBool>,
}

impl EngineContext {
    /// Create a context with a worker pool sized to hardware concurrency.
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self::with_threads(threads)
    }

    /// Create a context with an explicit worker-pool size.
    pub fn with_threads(threads: u32) -> Self {
        EngineContext {
            pool: Mutex::new(Pool::new(threads.max(1))),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run `f` with exclusive access to the worker pool's scoped-thread
    /// facility. Units that need internal parallelism go through this
    /// instead of spawning their own threads.
    pub fn with_pool<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Pool) -> R,
    {
        let mut pool = self.pool.lock().expect("worker pool mutex poisoned");
        f(&mut pool)
    }

    /// A cloneable handle to the cancellation flag.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Set the cooperative cancellation flag.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn info(&self, ctx: &LogContext, msg: &str) {
        log::info!("{msg}{}", ctx.format());
    }

    pub fn warn(&self, ctx: &LogContext, msg: &str) {
        log::warn!("{msg}{}", ctx.format());
    }

    pub fn debug(&self, ctx: &LogContext, msg: &str) {
        log::debug!("{msg}{}", ctx.format());
    }

    pub fn error(&self, ctx: &LogContext, msg: &str) {
        log::error!("{msg}{}", ctx.format());
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_observed() {
        let ctx = EngineContext::with_threads(2);
        assert!(!ctx.is_cancelled());
        ctx.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn pool_runs_scoped_work() {
        let ctx = EngineContext::with_threads(2);
        let sum = ctx.with_pool(|pool| {
            let data = [1, 2, 3, 4];
            let mut results = [0; 4];
            pool.scoped(|scope| {
                for (d, r) in data.iter().zip(results.iter_mut()) {
                    scope.execute(move || *r = d * 2);
                }
            });
            results.iter().sum::<i32>()
        });
        assert_eq!(sum, 20);
    }
}
