pub mod builder;
pub mod cache;
pub mod covariance;

pub use builder::{
    build_statistics, run_build_statistics, MarketStatistics, StatisticsInput, StatisticsOptions,
    StatisticsOutput,
};
pub use cache::{build_statistics_cached, CacheKey, CacheStats, CachedFactorization, CovarianceCache};
pub use covariance::{CholeskyFactor, ConditioningStep, CovarianceMatrix, EIGEN_EPSILON};
