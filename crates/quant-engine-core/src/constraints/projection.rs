use super::ConstraintSet;
use crate::math::vec_dot;

const OUTER_BISECTIONS: usize = 100;
const REPAIR_BISECTIONS: usize = 60;
/// Quadratic penalty weight on ESG shortfall (in score/100 units) and excess turnover.
pub const PENALTY_WEIGHT: f64 = 50.0;

/// Find `s` such that `sum_i clamp(v_i - s, lo_i, hi_i) == target`.
///
/// The sum is piecewise linear and non-increasing in `s`, so the root is
/// located between adjacent breakpoints and interpolated exactly. Targets
/// outside the attainable range pin every entry to the nearer bound.
pub fn solve_shift(v: &[f64], lo: &[f64], hi: &[f64], target: f64) -> f64 {
    let total = |s: f64| -> f64 {
        v.iter()
            .zip(lo.iter().zip(hi.iter()))
            .map(|(x, (l, h))| (x - s).clamp(*l, *h))
            .sum()
    };

    let mut points: Vec<f64> = v
        .iter()
        .zip(lo.iter().zip(hi.iter()))
        .flat_map(|(x, (l, h))| [x - h, x - l])
        .collect();
    if points.is_empty() {
        return 0.0;
    }
    points.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let first = points[0];
    let last = points[points.len() - 1];
    if target >= total(first) {
        return first;
    }
    if target <= total(last) {
        return last;
    }

    let (mut a, mut b) = (0usize, points.len() - 1);
    while b - a > 1 {
        let mid = (a + b) / 2;
        if total(points[mid]) >= target {
            a = mid;
        } else {
            b = mid;
        }
    }
    let (sa, sb) = (points[a], points[b]);
    let (fa, fb) = (total(sa), total(sb));
    if fa - fb <= f64::MIN_POSITIVE {
        return sa;
    }
    sa + (fa - target) * (sb - sa) / (fa - fb)
}

/// Euclidean projection onto `{lo <= w <= hi, sum w = budget}`.
pub fn project_box_budget(v: &[f64], lo: &[f64], hi: &[f64], budget: f64) -> Vec<f64> {
    let s = solve_shift(v, lo, hi, budget);
    v.iter()
        .zip(lo.iter().zip(hi.iter()))
        .map(|(x, (l, h))| (x - s).clamp(*l, *h))
        .collect()
}

impl ConstraintSet {
    /// Exact Euclidean projection onto the position bounds, the budget and
    /// the (disjoint) sector ranges.
    ///
    /// The optimum has the form `clamp(v_i - tau - sigma_s, lo_i, hi_i)` where
    /// `sigma_s` is non-zero only for sectors pinned at a limit. For a fixed
    /// `tau` every sector is solved independently, and the resulting total is
    /// monotone in `tau`, so the outer multiplier is found by bisection.
    pub fn project(&self, v: &[f64]) -> Vec<f64> {
        if self.sectors.is_empty() {
            return project_box_budget(v, &self.lower, &self.upper, self.budget);
        }

        let assemble = |tau: f64| -> Vec<f64> {
            let mut w: Vec<f64> = v
                .iter()
                .zip(self.lower.iter().zip(self.upper.iter()))
                .map(|(x, (l, h))| (x - tau).clamp(*l, *h))
                .collect();
            for s in &self.sectors {
                let sum: f64 = s.members.iter().map(|&i| w[i]).sum();
                let target = if sum > s.max {
                    s.max
                } else if sum < s.min {
                    s.min
                } else {
                    continue;
                };
                let vs: Vec<f64> = s.members.iter().map(|&i| v[i] - tau).collect();
                let ls: Vec<f64> = s.members.iter().map(|&i| self.lower[i]).collect();
                let hs: Vec<f64> = s.members.iter().map(|&i| self.upper[i]).collect();
                let sigma = solve_shift(&vs, &ls, &hs, target);
                for (k, &i) in s.members.iter().enumerate() {
                    w[i] = (vs[k] - sigma).clamp(ls[k], hs[k]);
                }
            }
            w
        };

        let mut lo_tau = v
            .iter()
            .zip(self.upper.iter())
            .map(|(x, h)| x - h)
            .fold(f64::INFINITY, f64::min)
            - 1.0;
        let mut hi_tau = v
            .iter()
            .zip(self.lower.iter())
            .map(|(x, l)| x - l)
            .fold(f64::NEG_INFINITY, f64::max)
            + 1.0;

        for _ in 0..OUTER_BISECTIONS {
            let mid = 0.5 * (lo_tau + hi_tau);
            let total: f64 = assemble(mid).iter().sum();
            if total > self.budget {
                lo_tau = mid;
            } else {
                hi_tau = mid;
            }
            if hi_tau - lo_tau <= f64::EPSILON * (1.0 + mid.abs()) {
                break;
            }
        }
        assemble(0.5 * (lo_tau + hi_tau))
    }

    fn linear_extras_hold(&self, w: &[f64]) -> bool {
        let esg_ok = match (&self.esg, self.esg_score(w)) {
            (Some(e), Some(score)) => score >= e.min - 1e-9,
            _ => true,
        };
        let turnover_ok = match &self.turnover {
            Some(t) => self.turnover(w) <= t.max + 1e-9,
            None => true,
        };
        esg_ok && turnover_ok
    }

    /// Project, then pull toward the feasible anchor until ESG and turnover
    /// limits hold. The feasible set is convex, so the admissible blend
    /// factors form an interval containing 0.
    pub fn repair(&self, w: &[f64]) -> Vec<f64> {
        let p = self.project(w);
        let anchor = match &self.anchor {
            Some(a) if !self.linear_extras_hold(&p) => a,
            _ => return p,
        };
        let blend = |theta: f64| -> Vec<f64> {
            anchor
                .iter()
                .zip(p.iter())
                .map(|(a, x)| a + theta * (x - a))
                .collect()
        };
        let (mut lo, mut hi) = (0.0_f64, 1.0_f64);
        for _ in 0..REPAIR_BISECTIONS {
            let mid = 0.5 * (lo + hi);
            if self.linear_extras_hold(&blend(mid)) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        blend(lo)
    }

    /// Quadratic penalty and gradient for ESG shortfall and excess turnover.
    /// Zero whenever both limits hold.
    pub fn penalty(&self, w: &[f64]) -> (f64, Vec<f64>) {
        let n = w.len();
        let mut value = 0.0;
        let mut grad = vec![0.0; n];

        if let Some(e) = &self.esg {
            let score = vec_dot(w, &e.scores) / self.budget;
            let shortfall = (e.min - score) / 100.0;
            if shortfall > 0.0 {
                value += PENALTY_WEIGHT * shortfall * shortfall;
                for (g, s) in grad.iter_mut().zip(e.scores.iter()) {
                    *g -= 2.0 * PENALTY_WEIGHT * shortfall * s / (100.0 * self.budget);
                }
            }
        }

        if let Some(t) = &self.turnover {
            let excess = self.turnover(w) - t.max;
            if excess > 0.0 {
                value += PENALTY_WEIGHT * excess * excess;
                for i in 0..n {
                    let d = w[i] - self.holdings[i];
                    let sign = if d > 0.0 {
                        1.0
                    } else if d < 0.0 {
                        -1.0
                    } else {
                        0.0
                    };
                    grad[i] += 2.0 * PENALTY_WEIGHT * excess * 0.5 * sign;
                }
            }
        }

        (value, grad)
    }
}
