//! Execution context for tree traversals: an optional dedicated rayon pool
//! and the subtree-size threshold below which work is never split.

use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::LikelihoodConfig;
use crate::error::Result;
use crate::tree::Tree;

/// Splits below this many nested `rayon::join` calls run serially.
const MAX_NESTED_SPLITS: usize = 32;

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pool: Option<Arc<ThreadPool>>,
    factor: f64,
}

impl ExecutionContext {
    /// Context that evaluates every subtree on the calling thread.
    pub fn serial() -> Self {
        Self {
            pool: None,
            factor: 1.0,
        }
    }

    pub fn from_config(config: &LikelihoodConfig) -> Result<Self> {
        if !config.parallelize || config.threads == Some(1) {
            return Ok(Self::serial());
        }
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("bdmm-worker-{i}"));
        if let Some(n) = config.threads {
            builder = builder.num_threads(n);
        }
        let pool = builder.build()?;
        log::debug!(
            "built traversal pool with {} threads (split factor {})",
            pool.current_num_threads(),
            config.parallelization_factor
        );
        Ok(Self {
            pool: Some(Arc::new(pool)),
            factor: config.parallelization_factor,
        })
    }

    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }

    pub fn threads(&self) -> usize {
        self.pool
            .as_ref()
            .map(|p| p.current_num_threads())
            .unwrap_or(1)
    }

    /// Runs `f` inside the pool so that nested `rayon::join` calls use its
    /// workers; runs it directly when serial.
    pub fn install<R, F>(&self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }

    /// Split policy for one traversal of `tree`.
    pub fn plan(&self, tree: &Tree) -> SplitPolicy {
        if !self.is_parallel() {
            return SplitPolicy::disabled();
        }
        let weights = tree.subtree_weights();
        let threshold = weights[tree.root()] * self.factor;
        SplitPolicy {
            weights,
            threshold,
            enabled: true,
        }
    }
}

/// Decides, per birth node, whether its two subtrees run concurrently.
#[derive(Debug, Clone)]
pub struct SplitPolicy {
    weights: Vec<f64>,
    threshold: f64,
    enabled: bool,
}

impl SplitPolicy {
    pub fn disabled() -> Self {
        Self {
            weights: Vec::new(),
            threshold: f64::INFINITY,
            enabled: false,
        }
    }

    /// `nested` is the number of splits already taken above this node.
    pub fn should_split(&self, first: usize, second: usize, nested: usize) -> bool {
        self.enabled
            && nested < MAX_NESTED_SPLITS
            && self.weights[first] > self.threshold
            && self.weights[second] > self.threshold
    }
}
