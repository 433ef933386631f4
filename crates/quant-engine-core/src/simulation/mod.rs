pub mod config;
pub mod executor;
pub mod paths;
pub mod pricing;
pub mod stress;

pub use config::{DriftMeasure, JumpConfig, SimulationConfig};
pub use executor::{
    executor_for, DevicePoolExecutor, Executor, ParallelExecutor, SequentialExecutor,
};
pub use paths::{
    run_simulate, simulate, simulate_asset_returns, simulate_gbm, summarize_ensemble,
    EnsembleSummary, PathSimulator, SimulateInput, SimulateOutput, SimulationRun,
};
pub use pricing::{black_scholes_price, price_european, run_price_option, OptionType};
pub use stress::{run_stress_test, standard_scenarios, stress_test, StressScenario};
