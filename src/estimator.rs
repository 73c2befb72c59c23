//! Linear UCB estimator - ridge regression posterior with an exploration bonus
//!
//! Maintains `A = l2·I + Σ x·xᵀ` and `b = Σ r·x`. The score for a context is
//! `θᵀx + alpha·sqrt(xᵀA⁻¹x)` with `θ = A⁻¹b`. The ridge term keeps `A`
//! positive-definite, so the Cholesky solve cannot fail under the update rule.

use anyhow::anyhow;
use nalgebra::{Cholesky, DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Online linear UCB estimator over a fixed-dimension context.
#[derive(Debug, Clone)]
pub struct LinUcb {
    a: DMatrix<f64>,
    b: DVector<f64>,
    alpha: f64,
    l2: f64,
}

/// Serializable estimator snapshot (`a` is row-major).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorState {
    pub alpha: f64,
    pub l2: f64,
    pub dim: usize,
    pub a: Vec<f64>,
    pub b: Vec<f64>,
}

impl LinUcb {
    /// Fresh estimator: `A = l2·I`, `b = 0`.
    pub fn new(dim: usize, alpha: f64, l2: f64) -> Self {
        Self {
            a: DMatrix::identity(dim, dim) * l2,
            b: DVector::zeros(dim),
            alpha,
            l2,
        }
    }

    pub fn dim(&self) -> usize {
        self.b.len()
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Upper-confidence-bound score for a context. Deterministic given the
    /// current state; higher `alpha` widens the bonus for any non-zero `x`.
    pub fn score(&self, x: &[f64]) -> f64 {
        debug_assert_eq!(x.len(), self.dim());
        let x = DVector::from_column_slice(x);
        match Cholesky::new(self.a.clone()) {
            Some(chol) => {
                let theta = chol.solve(&self.b);
                let a_inv_x = chol.solve(&x);
                let bonus = x.dot(&a_inv_x).max(0.0).sqrt();
                theta.dot(&x) + self.alpha * bonus
            }
            None => {
                // Unreachable while A stays positive-definite; degrade to a
                // zero score rather than panic inside the trading loop.
                warn!("UCB matrix lost positive-definiteness, scoring 0.0");
                0.0
            }
        }
    }

    /// Rank-1 update from an observed reward: `A += x·xᵀ`, `b += r·x`.
    pub fn learn(&mut self, x: &[f64], reward: f64) {
        debug_assert_eq!(x.len(), self.dim());
        let x = DVector::from_column_slice(x);
        self.a += &x * x.transpose();
        self.b += &x * reward;
    }

    /// Export the full posterior for persistence.
    pub fn to_state(&self) -> EstimatorState {
        let dim = self.dim();
        let mut a = Vec::with_capacity(dim * dim);
        for i in 0..dim {
            for j in 0..dim {
                a.push(self.a[(i, j)]);
            }
        }
        EstimatorState {
            alpha: self.alpha,
            l2: self.l2,
            dim,
            a,
            b: self.b.as_slice().to_vec(),
        }
    }

    /// Rebuild from a persisted snapshot. Rejects dimension mismatches so a
    /// stale state file cannot silently corrupt scoring.
    pub fn from_state(state: &EstimatorState) -> anyhow::Result<Self> {
        if state.a.len() != state.dim * state.dim {
            return Err(anyhow!(
                "estimator matrix has {} entries, expected {}",
                state.a.len(),
                state.dim * state.dim
            ));
        }
        if state.b.len() != state.dim {
            return Err(anyhow!(
                "estimator vector has {} entries, expected {}",
                state.b.len(),
                state.dim
            ));
        }
        Ok(Self {
            a: DMatrix::from_row_slice(state.dim, state.dim, &state.a),
            b: DVector::from_column_slice(&state.b),
            alpha: state.alpha,
            l2: state.l2,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::DIM;

    fn unit_vec(k: usize) -> Vec<f64> {
        let mut x = vec![0.0; DIM];
        x[k] = 1.0;
        x
    }

    #[test]
    fn test_alpha_widens_score() {
        let x = unit_vec(3);
        let low = LinUcb::new(DIM, 0.5, 1e-3);
        let high = LinUcb::new(DIM, 2.0, 1e-3);
        assert!(high.score(&x) > low.score(&x));
    }

    #[test]
    fn test_repeated_learning_converges_to_reward() {
        let mut est = LinUcb::new(DIM, 0.3, 1e-3);
        let x = unit_vec(0);
        let reward = 0.7;

        let mut last_gap = f64::INFINITY;
        for i in 0..200 {
            est.learn(&x, reward);
            if i % 20 == 19 {
                let gap = (est.score(&x) - reward).abs();
                assert!(gap <= last_gap + 1e-9, "gap widened: {} > {}", gap, last_gap);
                last_gap = gap;
            }
        }
        assert!(last_gap < 0.05, "did not converge, gap {}", last_gap);
    }

    #[test]
    fn test_negative_reward_scenario() {
        // Gate-estimator scenario: losing observations on a basis vector
        // must push that context's score negative, and further from zero
        // than the score of the zero vector. Two observations are needed
        // before the posterior mean (-1.0) outweighs the alpha=1.2 bonus.
        let mut est = LinUcb::new(DIM, 1.2, 1e-3);
        let x = unit_vec(2);
        est.learn(&x, -1.0);
        est.learn(&x, -1.0);

        let scored = est.score(&x);
        let zero_scored = est.score(&vec![0.0; DIM]);
        assert!(scored < 0.0, "score {} not negative", scored);
        assert!(scored.abs() > zero_scored.abs());
    }

    #[test]
    fn test_state_round_trip_identity() {
        let mut est = LinUcb::new(DIM, 1.2, 1e-3);
        est.learn(&unit_vec(1), 0.4);
        est.learn(&unit_vec(4), -0.9);

        let json = serde_json::to_string(&est.to_state()).unwrap();
        let state: EstimatorState = serde_json::from_str(&json).unwrap();
        let restored = LinUcb::from_state(&state).unwrap();

        let probe = unit_vec(1);
        assert_eq!(est.score(&probe), restored.score(&probe));
        let probe = unit_vec(4);
        assert_eq!(est.score(&probe), restored.score(&probe));
    }

    #[test]
    fn test_from_state_rejects_mismatched_lengths() {
        let state = EstimatorState {
            alpha: 1.0,
            l2: 1e-3,
            dim: DIM,
            a: vec![0.0; 3],
            b: vec![0.0; DIM],
        };
        assert!(LinUcb::from_state(&state).is_err());
    }
}
