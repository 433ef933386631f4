use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::EngineResult;

/// Lifecycle of a single solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveState {
    Init,
    BuildingProblem,
    Solving,
    Converged,
    Infeasible,
    TimedOut,
}

impl SolveState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SolveState::Converged | SolveState::Infeasible | SolveState::TimedOut
        )
    }

    fn can_move_to(self, next: SolveState) -> bool {
        matches!(
            (self, next),
            (SolveState::Init, SolveState::BuildingProblem)
                | (SolveState::BuildingProblem, SolveState::Solving)
                | (SolveState::BuildingProblem, SolveState::Infeasible)
                | (SolveState::Solving, SolveState::Converged)
                | (SolveState::Solving, SolveState::Infeasible)
                | (SolveState::Solving, SolveState::TimedOut)
        )
    }
}

/// How a solve ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    Converged,
    Infeasible,
    TimedOut,
}

impl SolveStatus {
    pub fn state(self) -> SolveState {
        match self {
            SolveStatus::Converged => SolveState::Converged,
            SolveStatus::Infeasible => SolveState::Infeasible,
            SolveStatus::TimedOut => SolveState::TimedOut,
        }
    }

    /// The worse of two outcomes: infeasible beats timed out beats converged.
    pub fn combine(self, other: SolveStatus) -> SolveStatus {
        use SolveStatus::*;
        match (self, other) {
            (Infeasible, _) | (_, Infeasible) => Infeasible,
            (TimedOut, _) | (_, TimedOut) => TimedOut,
            _ => Converged,
        }
    }
}

/// Records the state trace of one solve and rejects illegal transitions.
#[derive(Debug, Clone)]
pub struct SolveTracker {
    method: &'static str,
    trace: Vec<SolveState>,
}

impl SolveTracker {
    pub fn new(method: &'static str) -> Self {
        Self {
            method,
            trace: vec![SolveState::Init],
        }
    }

    pub fn current(&self) -> SolveState {
        self.trace.last().copied().unwrap_or(SolveState::Init)
    }

    pub fn advance(&mut self, next: SolveState) -> EngineResult<()> {
        let from = self.current();
        if !from.can_move_to(next) {
            return Err(EngineError::numerical(
                "solve state",
                format!("Illegal transition {:?} -> {:?}", from, next),
            ));
        }
        debug!(method = self.method, ?from, to = ?next, "solve state");
        self.trace.push(next);
        Ok(())
    }

    pub fn finish(&mut self, status: SolveStatus) -> EngineResult<()> {
        self.advance(status.state())
    }

    pub fn trace(&self) -> &[SolveState] {
        &self.trace
    }

    pub fn into_trace(self) -> Vec<SolveState> {
        self.trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_happy_path_trace() {
        let mut t = SolveTracker::new("min_variance");
        t.advance(SolveState::BuildingProblem).unwrap();
        t.advance(SolveState::Solving).unwrap();
        t.finish(SolveStatus::Converged).unwrap();
        assert_eq!(
            t.trace(),
            &[
                SolveState::Init,
                SolveState::BuildingProblem,
                SolveState::Solving,
                SolveState::Converged
            ]
        );
        assert!(t.current().is_terminal());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut t = SolveTracker::new("hrp");
        assert!(t.advance(SolveState::Solving).is_err());
        t.advance(SolveState::BuildingProblem).unwrap();
        assert!(t.finish(SolveStatus::TimedOut).is_err());
        t.advance(SolveState::Solving).unwrap();
        t.finish(SolveStatus::TimedOut).unwrap();
        assert!(t.advance(SolveState::Solving).is_err());
    }

    #[test]
    fn test_status_combine() {
        use SolveStatus::*;
        assert_eq!(Converged.combine(TimedOut), TimedOut);
        assert_eq!(TimedOut.combine(Infeasible), Infeasible);
        assert_eq!(Converged.combine(Converged), Converged);
    }
}
