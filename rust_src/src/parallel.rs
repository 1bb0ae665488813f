//! Worker pool and cancellation handle passed explicitly into every fit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::error::MirtResult;

/// Parallel-map collaborator. Tasks read shared snapshots and return private results;
/// callers aggregate the returned vector on their own thread.
#[derive(Clone, Debug, Default)]
pub enum WorkerPool {
    /// Run every task on the calling thread
    Sequential,
    /// Use rayon's global pool
    #[default]
    Global,
    Dedicated(Arc<rayon::ThreadPool>),
}

impl WorkerPool {
    pub fn sequential() -> Self {
        WorkerPool::Sequential
    }

    pub fn global() -> Self {
        WorkerPool::Global
    }

    pub fn with_threads(n_threads: usize) -> MirtResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()?;
        Ok(WorkerPool::Dedicated(Arc::new(pool)))
    }

    /// Evaluate `f(0..n)` and return the results in index order.
    pub fn map<T, F>(&self, n: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Send + Sync,
    {
        match self {
            WorkerPool::Sequential => (0..n).map(f).collect(),
            WorkerPool::Global => (0..n).into_par_iter().map(f).collect(),
            WorkerPool::Dedicated(pool) => pool.install(|| (0..n).into_par_iter().map(f).collect()),
        }
    }
}

/// Cooperative cancellation flag checked once per estimation cycle.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Caller-owned execution context for one or more fits.
#[derive(Clone, Debug, Default)]
pub struct Runtime {
    pub pool: WorkerPool,
    pub cancel: CancelToken,
}

impl Runtime {
    pub fn new(pool: WorkerPool) -> Self {
        Runtime {
            pool,
            cancel: CancelToken::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_preserves_order_in_every_mode() {
        let expected: Vec<usize> = (0..50).map(|i| i * i).collect();
        for pool in [
            WorkerPool::sequential(),
            WorkerPool::global(),
            WorkerPool::with_threads(2).unwrap(),
        ] {
            assert_eq!(pool.map(50, |i| i * i), expected);
        }
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
