//! Execution units for independent path batches.
//!
//! The simulator only sees the [`Executor`] trait. Every implementation
//! hands results back in batch order, so a given seed and batch partition
//! produce the same ensemble whichever backend ran it.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ExecutorKind;
use crate::error::EngineError;
use crate::EngineResult;

/// One batch of work: batch index in, flat batch output out.
pub type BatchTask<'a> = dyn Fn(usize) -> EngineResult<Vec<f64>> + Sync + 'a;

pub trait Executor: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Run batches `0..n_batches`. The first failing batch fails the call,
    /// but only after every started batch has finished.
    fn run_batches(&self, n_batches: usize, task: &BatchTask<'_>) -> EngineResult<Vec<Vec<f64>>>;

    /// Why this executor is running below its requested capability, if it is.
    fn degraded(&self) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// Portable executors
// ---------------------------------------------------------------------------

/// Runs batches one after another on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialExecutor;

impl Executor for SequentialExecutor {
    fn name(&self) -> &str {
        "sequential"
    }

    fn run_batches(&self, n_batches: usize, task: &BatchTask<'_>) -> EngineResult<Vec<Vec<f64>>> {
        (0..n_batches).map(task).collect()
    }
}

/// Spreads batches over the global rayon pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelExecutor;

impl Executor for ParallelExecutor {
    fn name(&self) -> &str {
        "parallel"
    }

    fn run_batches(&self, n_batches: usize, task: &BatchTask<'_>) -> EngineResult<Vec<Vec<f64>>> {
        (0..n_batches).into_par_iter().map(task).collect()
    }
}

// ---------------------------------------------------------------------------
// Device pool
// ---------------------------------------------------------------------------

/// Shards batches round-robin across dedicated thread pools, one per device,
/// and reassembles them in batch order after every shard has joined.
///
/// With no usable device it degrades to [`ParallelExecutor`].
pub struct DevicePoolExecutor {
    pools: Vec<ThreadPool>,
    requested: usize,
    fallback: ParallelExecutor,
}

impl fmt::Debug for DevicePoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevicePoolExecutor")
            .field("devices", &self.pools.len())
            .field("requested", &self.requested)
            .finish()
    }
}

impl DevicePoolExecutor {
    /// Build `count` pools of `threads_per_device` workers. Pools that fail to
    /// start are dropped with a warning.
    pub fn new(count: usize, threads_per_device: usize) -> Self {
        let pools: Vec<ThreadPool> = (0..count)
            .filter_map(|device| {
                ThreadPoolBuilder::new()
                    .num_threads(threads_per_device.max(1))
                    .thread_name(move |t| format!("qpe-device-{}-{}", device, t))
                    .build()
                    .map_err(|e| warn!(device, error = %e, "device pool unavailable"))
                    .ok()
            })
            .collect();
        Self {
            pools,
            requested: count,
            fallback: ParallelExecutor,
        }
    }

    /// Use already-built pools. An empty list means no device is available.
    pub fn from_pools(pools: Vec<ThreadPool>, requested: usize) -> Self {
        Self {
            pools,
            requested,
            fallback: ParallelExecutor,
        }
    }

    pub fn devices(&self) -> usize {
        self.pools.len()
    }
}

impl Executor for DevicePoolExecutor {
    fn name(&self) -> &str {
        if self.pools.is_empty() {
            "parallel"
        } else {
            "devices"
        }
    }

    fn run_batches(&self, n_batches: usize, task: &BatchTask<'_>) -> EngineResult<Vec<Vec<f64>>> {
        if self.pools.is_empty() {
            warn!(
                requested = self.requested,
                "no device available; running batches on the default pool"
            );
            return self.fallback.run_batches(n_batches, task);
        }

        let devices = self.pools.len();
        let shards: Vec<Vec<usize>> = (0..devices)
            .map(|d| (d..n_batches).step_by(devices).collect())
            .collect();
        debug!(devices, n_batches, "sharding batches across devices");

        let joined: Vec<EngineResult<Vec<(usize, Vec<f64>)>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .pools
                .iter()
                .zip(shards.iter())
                .map(|(pool, shard)| {
                    scope.spawn(move || {
                        pool.install(|| {
                            shard
                                .par_iter()
                                .map(|&b| task(b).map(|values| (b, values)))
                                .collect::<EngineResult<Vec<_>>>()
                        })
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(EngineError::numerical(
                            "device executor",
                            "A device worker panicked",
                        ))
                    })
                })
                .collect()
        });

        let mut slots: Vec<Option<Vec<f64>>> = vec![None; n_batches];
        for shard in joined {
            for (b, values) in shard? {
                slots[b] = Some(values);
            }
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(b, slot)| {
                slot.ok_or_else(|| {
                    EngineError::numerical("device executor", format!("Batch {} never completed", b))
                })
            })
            .collect()
    }

    fn degraded(&self) -> Option<String> {
        if self.pools.is_empty() {
            Some(format!(
                "Requested {} device(s) but none were available; ran on the default parallel executor",
                self.requested
            ))
        } else if self.pools.len() < self.requested {
            Some(format!(
                "Requested {} device(s), {} available",
                self.requested,
                self.pools.len()
            ))
        } else {
            None
        }
    }
}

/// Build the executor named in the engine configuration.
pub fn executor_for(kind: &ExecutorKind) -> Arc<dyn Executor> {
    match kind {
        ExecutorKind::Sequential => Arc::new(SequentialExecutor),
        ExecutorKind::Parallel => Arc::new(ParallelExecutor),
        ExecutorKind::Devices {
            count,
            threads_per_device,
        } => Arc::new(DevicePoolExecutor::new(*count, *threads_per_device)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn square_task(b: usize) -> EngineResult<Vec<f64>> {
        Ok(vec![b as f64, (b * b) as f64])
    }

    #[test]
    fn test_all_executors_return_batches_in_order() {
        let expected: Vec<Vec<f64>> = (0..7).map(|b| square_task(b).unwrap()).collect();
        let executors: Vec<Arc<dyn Executor>> = vec![
            Arc::new(SequentialExecutor),
            Arc::new(ParallelExecutor),
            Arc::new(DevicePoolExecutor::new(3, 1)),
        ];
        for ex in executors {
            assert_eq!(ex.run_batches(7, &square_task).unwrap(), expected, "{}", ex.name());
        }
    }

    #[test]
    fn test_missing_devices_fall_back() {
        let ex = DevicePoolExecutor::from_pools(Vec::new(), 2);
        assert_eq!(ex.name(), "parallel");
        assert!(ex.degraded().is_some());
        let out = ex.run_batches(4, &square_task).unwrap();
        assert_eq!(out[3], vec![3.0, 9.0]);
    }

    #[test]
    fn test_failing_batch_fails_the_call() {
        let task = |b: usize| -> EngineResult<Vec<f64>> {
            if b == 2 {
                Err(EngineError::numerical("test", "boom"))
            } else {
                Ok(vec![b as f64])
            }
        };
        assert!(SequentialExecutor.run_batches(4, &task).is_err());
        assert!(ParallelExecutor.run_batches(4, &task).is_err());
        assert!(DevicePoolExecutor::new(2, 1).run_batches(4, &task).is_err());
    }

    #[test]
    fn test_more_devices_than_batches() {
        let ex = DevicePoolExecutor::new(4, 1);
        let out = ex.run_batches(2, &square_task).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_executor_for_kinds() {
        assert_eq!(executor_for(&ExecutorKind::Sequential).name(), "sequential");
        assert_eq!(executor_for(&ExecutorKind::Parallel).name(), "parallel");
    }
}
