use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or insufficient input series. Never retried.
    #[error("Data error: {field} — {reason}")]
    Data { field: String, reason: String },

    /// Ill-conditioned covariance or a factorization that failed after remediation.
    #[error("Numerical error in {context}: {reason}")]
    Numerical { context: String, reason: String },

    /// Mutually infeasible constraint set; `constraint` names the conflicting rule.
    #[error("Constraint error: {constraint} — {reason}")]
    Constraint { constraint: String, reason: String },

    /// Invalid simulation or optimization parameters, rejected before any work starts.
    #[error("Invalid configuration: {field} — {reason}")]
    Config { field: String, reason: String },

    #[error("Timeout: {operation} exceeded its deadline after {elapsed_ms} ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    pub(crate) fn data(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Data {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn numerical(context: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Numerical {
            context: context.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn constraint(constraint: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Constraint {
            constraint: constraint.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}
