use nalgebra::{Cholesky, SymmetricEigen};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::math::{from_dmatrix, to_dmatrix};
use crate::EngineResult;

/// Smallest eigenvalue at or below this is treated as not positive-definite.
pub const EIGEN_EPSILON: f64 = 1e-10;

/// Extra loading added on top of |min eigenvalue| when repairing a matrix.
const LOADING_EPSILON: f64 = 1e-8;

/// Shrinkage intensities tried, in order, once diagonal loading has failed.
const SHRINKAGE_LADDER: [f64; 5] = [0.1, 0.25, 0.5, 0.75, 1.0];

const SYMMETRY_TOLERANCE: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A remediation applied to produce a conditioned covariance matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConditioningStep {
    /// `amount` added to every diagonal entry.
    DiagonalLoading { amount: f64 },
    /// Convex blend toward the diagonal target: (1 - s) * Sigma + s * diag(Sigma).
    Shrinkage { intensity: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCovariance {
    symbols: Vec<String>,
    values: Vec<Vec<f64>>,
    #[serde(default)]
    conditioning: Vec<ConditioningStep>,
}

/// Square, symmetric covariance matrix over one request's asset universe.
///
/// Never mutated in place: conditioning returns a new instance carrying the
/// list of steps that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCovariance")]
pub struct CovarianceMatrix {
    symbols: Vec<String>,
    values: Vec<Vec<f64>>,
    conditioning: Vec<ConditioningStep>,
}

impl TryFrom<RawCovariance> for CovarianceMatrix {
    type Error = EngineError;

    fn try_from(raw: RawCovariance) -> Result<Self, Self::Error> {
        let mut cov = CovarianceMatrix::new(raw.symbols, raw.values)?;
        cov.conditioning = raw.conditioning;
        Ok(cov)
    }
}

/// Lower-triangular Cholesky factor L with Sigma = L * L'.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CholeskyFactor {
    lower: Vec<Vec<f64>>,
}

impl CholeskyFactor {
    pub fn dim(&self) -> usize {
        self.lower.len()
    }

    pub fn lower(&self) -> &[Vec<f64>] {
        &self.lower
    }

    /// out = L * z. Only the lower triangle is touched.
    #[inline]
    pub fn correlate(&self, z: &[f64], out: &mut [f64]) {
        for (i, row) in self.lower.iter().enumerate() {
            let mut acc = 0.0;
            for (l, zj) in row[..=i].iter().zip(z.iter()) {
                acc += l * zj;
            }
            out[i] = acc;
        }
    }
}

// ---------------------------------------------------------------------------
// Construction and accessors
// ---------------------------------------------------------------------------

impl CovarianceMatrix {
    /// Validate shape, symmetry, finiteness and non-negative variances.
    pub fn new(symbols: Vec<String>, values: Vec<Vec<f64>>) -> EngineResult<Self> {
        let n = symbols.len();
        if n == 0 {
            return Err(EngineError::data(
                "covariance_matrix",
                "At least one asset required",
            ));
        }
        if values.len() != n {
            return Err(EngineError::data(
                "covariance_matrix",
                format!("Expected {}x{} matrix but got {} rows", n, n, values.len()),
            ));
        }
        for (i, row) in values.iter().enumerate() {
            if row.len() != n {
                return Err(EngineError::data(
                    "covariance_matrix",
                    format!("Row {} has {} columns, expected {}", i, row.len(), n),
                ));
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(EngineError::data(
                    "covariance_matrix",
                    format!("Row {} contains a non-finite entry", i),
                ));
            }
            if row[i] < 0.0 {
                return Err(EngineError::data(
                    "covariance_matrix",
                    format!("Negative variance on diagonal [{},{}]", i, i),
                ));
            }
        }
        for i in 0..n {
            for j in (i + 1)..n {
                let scale = values[i][i].max(values[j][j]).max(1.0);
                if (values[i][j] - values[j][i]).abs() > SYMMETRY_TOLERANCE * scale {
                    return Err(EngineError::data(
                        "covariance_matrix",
                        format!(
                            "Not symmetric: [{},{}]={} != [{},{}]={}",
                            i, j, values[i][j], j, i, values[j][i]
                        ),
                    ));
                }
            }
        }
        Ok(Self {
            symbols,
            values,
            conditioning: Vec::new(),
        })
    }

    /// Sigma_ij = rho_ij * sigma_i * sigma_j.
    pub fn from_correlation(
        symbols: Vec<String>,
        volatilities: &[f64],
        correlation: &[Vec<f64>],
    ) -> EngineResult<Self> {
        let n = symbols.len();
        if volatilities.len() != n || correlation.len() != n {
            return Err(EngineError::data(
                "correlation",
                format!("Expected {} volatilities and a {}x{} correlation matrix", n, n, n),
            ));
        }
        let values = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| {
                        let rho = if i == j { 1.0 } else { correlation[i][j] };
                        rho * volatilities[i] * volatilities[j]
                    })
                    .collect()
            })
            .collect();
        Self::new(symbols, values)
    }

    pub fn dim(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn values(&self) -> &[Vec<f64>] {
        &self.values
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i][j]
    }

    pub fn conditioning(&self) -> &[ConditioningStep] {
        &self.conditioning
    }

    pub fn volatilities(&self) -> Vec<f64> {
        (0..self.dim())
            .map(|i| self.values[i][i].max(0.0).sqrt())
            .collect()
    }

    /// Correlation matrix, off-diagonals clamped to [-1, 1].
    /// Zero-variance assets get zero correlation with everything else.
    pub fn correlation(&self) -> Vec<Vec<f64>> {
        let n = self.dim();
        let vols = self.volatilities();
        (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| {
                        if i == j {
                            1.0
                        } else if vols[i] <= f64::EPSILON || vols[j] <= f64::EPSILON {
                            0.0
                        } else {
                            (self.values[i][j] / (vols[i] * vols[j])).clamp(-1.0, 1.0)
                        }
                    })
                    .collect()
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Spectral diagnostics
    // -----------------------------------------------------------------------

    /// Eigenvalues in ascending order.
    pub fn eigenvalues(&self) -> Vec<f64> {
        let eig = SymmetricEigen::new(to_dmatrix(&self.values));
        let mut vals: Vec<f64> = eig.eigenvalues.iter().copied().collect();
        vals.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        vals
    }

    pub fn min_eigenvalue(&self) -> f64 {
        self.eigenvalues().first().copied().unwrap_or(0.0)
    }

    /// lambda_max / lambda_min; infinite when the matrix is singular.
    pub fn condition_number(&self) -> f64 {
        let vals = self.eigenvalues();
        match (vals.first(), vals.last()) {
            (Some(&lo), Some(&hi)) if lo > EIGEN_EPSILON => hi / lo,
            _ => f64::INFINITY,
        }
    }

    pub fn is_positive_definite(&self) -> bool {
        self.min_eigenvalue() > EIGEN_EPSILON && self.cholesky().is_some()
    }

    pub fn cholesky(&self) -> Option<CholeskyFactor> {
        let chol = Cholesky::new(to_dmatrix(&self.values))?;
        let l = chol.l();
        if l.iter().any(|v| !v.is_finite()) {
            return None;
        }
        Some(CholeskyFactor {
            lower: from_dmatrix(&l),
        })
    }

    // -----------------------------------------------------------------------
    // Conditioning (each returns a new instance)
    // -----------------------------------------------------------------------

    pub fn with_diagonal_loading(&self, amount: f64) -> Self {
        let mut values = self.values.clone();
        for (i, row) in values.iter_mut().enumerate() {
            row[i] += amount;
        }
        let mut conditioning = self.conditioning.clone();
        conditioning.push(ConditioningStep::DiagonalLoading { amount });
        Self {
            symbols: self.symbols.clone(),
            values,
            conditioning,
        }
    }

    pub fn shrink_toward_diagonal(&self, intensity: f64) -> Self {
        let s = intensity.clamp(0.0, 1.0);
        let values = self
            .values
            .iter()
            .enumerate()
            .map(|(i, row)| {
                row.iter()
                    .enumerate()
                    .map(|(j, v)| if i == j { *v } else { (1.0 - s) * v })
                    .collect()
            })
            .collect();
        let mut conditioning = self.conditioning.clone();
        conditioning.push(ConditioningStep::Shrinkage { intensity: s });
        Self {
            symbols: self.symbols.clone(),
            values,
            conditioning,
        }
    }

    /// Return a positive-definite version of this matrix.
    ///
    /// Stage one adds |lambda_min| + epsilon to the diagonal. Stage two shrinks
    /// the loaded matrix toward its diagonal with increasing intensity. Only
    /// when both fail is a `Numerical` error surfaced.
    pub fn conditioned(&self) -> EngineResult<Self> {
        let lambda_min = self.min_eigenvalue();
        if lambda_min > EIGEN_EPSILON && self.cholesky().is_some() {
            return Ok(self.clone());
        }

        let amount = lambda_min.abs() + LOADING_EPSILON;
        warn!(
            lambda_min,
            amount, "covariance not positive-definite, applying diagonal loading"
        );
        let loaded = self.with_diagonal_loading(amount);
        if loaded.is_positive_definite() {
            return Ok(loaded);
        }

        for intensity in SHRINKAGE_LADDER {
            let shrunk = loaded.shrink_toward_diagonal(intensity);
            debug!(intensity, "trying shrinkage toward diagonal target");
            if shrunk.is_positive_definite() {
                return Ok(shrunk);
            }
        }

        Err(EngineError::numerical(
            "covariance conditioning",
            format!(
                "Matrix remains indefinite after diagonal loading and shrinkage (lambda_min = {:.3e})",
                lambda_min
            ),
        ))
    }

    /// Covariance rebuilt from this matrix's correlation with new volatilities.
    pub fn with_volatilities(&self, volatilities: &[f64]) -> EngineResult<Self> {
        Self::from_correlation(self.symbols.clone(), volatilities, &self.correlation())
    }
}
