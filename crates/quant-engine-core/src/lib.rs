pub mod config;
pub mod constraints;
pub mod error;
pub mod lp;
pub mod math;
pub mod risk;
pub mod statistics;
pub mod types;

#[cfg(feature = "simulation")]
pub mod simulation;

#[cfg(feature = "optimization")]
pub mod optimization;

pub use config::EngineConfig;
pub use error::EngineError;
pub use types::*;

/// Standard result type for all engine operations
pub type EngineResult<T> = Result<T, EngineError>;
