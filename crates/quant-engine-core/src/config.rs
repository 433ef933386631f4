use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::EngineError;
use crate::EngineResult;

/// Which execution unit path batches run on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorKind {
    /// One batch after another on the calling thread.
    Sequential,
    /// Batches spread over the global rayon pool.
    Parallel,
    /// Batches sharded across `count` dedicated thread pools.
    Devices {
        count: usize,
        #[serde(default = "default_threads_per_device")]
        threads_per_device: usize,
    },
}

fn default_threads_per_device() -> usize {
    2
}

impl Default for ExecutorKind {
    fn default() -> Self {
        ExecutorKind::Parallel
    }
}

/// Defaults for iterative optimizer solves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverDefaults {
    pub max_iterations: usize,
    pub tolerance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for SolverDefaults {
    fn default() -> Self {
        Self {
            max_iterations: 5_000,
            tolerance: 1e-9,
            timeout_ms: None,
        }
    }
}

/// Process-level engine settings. Every field has a default so an empty
/// document (or no document at all) is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Paths per simulation batch.
    pub batch_size: usize,
    pub executor: ExecutorKind,
    /// Maximum number of universes held by the covariance cache.
    pub cache_capacity: usize,
    pub default_confidence: f64,
    /// Return observations per year used to annualise sample statistics.
    pub periods_per_year: f64,
    pub solver: SolverDefaults,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            executor: ExecutorKind::default(),
            cache_capacity: 32,
            default_confidence: 0.95,
            periods_per_year: 252.0,
            solver: SolverDefaults::default(),
            simulation_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.batch_size == 0 {
            return Err(EngineError::config("batch_size", "Must be at least 1"));
        }
        if self.cache_capacity == 0 {
            return Err(EngineError::config("cache_capacity", "Must be at least 1"));
        }
        if !(self.default_confidence > 0.0 && self.default_confidence < 1.0) {
            return Err(EngineError::config(
                "default_confidence",
                "Must lie strictly between 0 and 1",
            ));
        }
        if !(self.periods_per_year > 0.0) {
            return Err(EngineError::config("periods_per_year", "Must be positive"));
        }
        if self.solver.max_iterations == 0 {
            return Err(EngineError::config(
                "solver.max_iterations",
                "Must be at least 1",
            ));
        }
        if !(self.solver.tolerance > 0.0) {
            return Err(EngineError::config("solver.tolerance", "Must be positive"));
        }
        if let ExecutorKind::Devices {
            count,
            threads_per_device,
        } = self.executor
        {
            if count == 0 || threads_per_device == 0 {
                return Err(EngineError::config(
                    "executor",
                    "Device count and threads per device must be at least 1",
                ));
            }
        }
        Ok(())
    }

    pub fn simulation_timeout(&self) -> Option<Duration> {
        self.simulation_timeout_ms.map(Duration::from_millis)
    }

    pub fn solver_timeout(&self) -> Option<Duration> {
        self.solver.timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_document_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_document_overrides_only_named_fields() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{"batch_size": 500, "executor": {"kind": "devices", "count": 3}, "solver": {"tolerance": 1e-6}}"#,
        )
        .unwrap();
        assert_eq!(cfg.batch_size, 500);
        assert_eq!(
            cfg.executor,
            ExecutorKind::Devices {
                count: 3,
                threads_per_device: 2
            }
        );
        assert_eq!(cfg.solver.tolerance, 1e-6);
        assert_eq!(cfg.solver.max_iterations, 5_000);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let cfg = EngineConfig {
            batch_size: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Config { .. })));
    }

    #[test]
    fn test_confidence_bounds() {
        let cfg = EngineConfig {
            default_confidence: 1.0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
