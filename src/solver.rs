//! Adaptive Dormand–Prince 5(4) integrator.
//!
//! Integrates in either direction of time; the error of each step is measured
//! against `abs_tolerance + rel_tolerance * |y|` per component.

use crate::error::{BdmmError, Result};
use crate::ode::OdeSystem;

const C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];

const A: [[f64; 6]; 7] = [
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
    [
        19372.0 / 6561.0,
        -25360.0 / 2187.0,
        64448.0 / 6561.0,
        -212.0 / 729.0,
        0.0,
        0.0,
    ],
    [
        9017.0 / 3168.0,
        -355.0 / 33.0,
        46732.0 / 5247.0,
        49.0 / 176.0,
        -5103.0 / 18656.0,
        0.0,
    ],
    // Last row doubles as the fifth-order weights (FSAL).
    [
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
    ],
];

/// Difference between the fifth- and fourth-order weights.
const E: [f64; 7] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct DormandPrince {
    pub abs_tolerance: f64,
    pub rel_tolerance: f64,
    pub max_evaluations: usize,
    k: [Vec<f64>; 7],
    y_stage: Vec<f64>,
    y_new: Vec<f64>,
}

impl DormandPrince {
    pub fn new(abs_tolerance: f64, rel_tolerance: f64, max_evaluations: usize) -> Self {
        Self {
            abs_tolerance,
            rel_tolerance,
            max_evaluations,
            k: Default::default(),
            y_stage: Vec::new(),
            y_new: Vec::new(),
        }
    }

    fn resize(&mut self, n: usize) {
        if self.y_stage.len() == n {
            return;
        }
        for k in self.k.iter_mut() {
            k.clear();
            k.resize(n, 0.0);
        }
        self.y_stage.clear();
        self.y_stage.resize(n, 0.0);
        self.y_new.clear();
        self.y_new.resize(n, 0.0);
    }

    fn scale(&self, a: f64, b: f64) -> f64 {
        self.abs_tolerance + self.rel_tolerance * a.abs().max(b.abs())
    }

    /// Integrates `y` in place from `t0` to `t1` and returns the number of
    /// derivative evaluations used.
    pub fn integrate<S: OdeSystem>(
        &mut self,
        system: &S,
        t0: f64,
        y: &mut [f64],
        t1: f64,
    ) -> Result<usize> {
        let n = y.len();
        debug_assert_eq!(n, system.dimension());
        if t1 == t0 || n == 0 {
            return Ok(0);
        }
        self.resize(n);

        let dir = (t1 - t0).signum();
        system.derivatives(t0, y, &mut self.k[0]);
        let mut evals = 1;
        if self.k[0].iter().any(|v| !v.is_finite()) {
            return Err(solver_error(t0, t1, "non-finite derivative at start"));
        }
        let mut h = dir * self.initial_step(system, t0, y, t1, &mut evals);

        let mut t = t0;
        loop {
            let remaining = t1 - t;
            let min_step = 16.0 * f64::EPSILON * t.abs().max(t1.abs()).max(1.0);
            if h.abs() < min_step {
                h = dir * min_step;
            }
            let last = h.abs() >= remaining.abs();
            if last {
                h = remaining;
            }

            let error = self.try_step(system, t, y, h);
            evals += 6;

            if error <= 1.0 {
                y.copy_from_slice(&self.y_new);
                self.k.swap(0, 6);
                t = if last { t1 } else { t + h };
                if last {
                    break;
                }
                let factor = if error == 0.0 {
                    MAX_FACTOR
                } else {
                    (SAFETY * error.powf(-0.2)).clamp(MIN_FACTOR, MAX_FACTOR)
                };
                h *= factor;
            } else {
                if h.abs() <= min_step {
                    return Err(solver_error(
                        t0,
                        t1,
                        &format!("step size underflow at t={t} (error norm {error})"),
                    ));
                }
                let factor = if error.is_finite() {
                    (SAFETY * error.powf(-0.2)).clamp(MIN_FACTOR, 1.0)
                } else {
                    MIN_FACTOR
                };
                h *= factor;
            }

            if evals > self.max_evaluations {
                return Err(BdmmError::EvaluationBudgetExceeded {
                    max_evaluations: self.max_evaluations,
                    t_start: t0,
                    t_end: t1,
                });
            }
        }
        Ok(evals)
    }

    /// Computes the fifth-order solution into `y_new` and `f(t+h, y_new)` into
    /// `k[6]`; returns the scaled RMS error estimate.
    fn try_step<S: OdeSystem>(&mut self, system: &S, t: f64, y: &[f64], h: f64) -> f64 {
        let n = y.len();
        let Self { k, y_stage, .. } = self;
        for s in 1..7 {
            for i in 0..n {
                let mut acc = 0.0;
                for (j, a) in A[s].iter().enumerate().take(s) {
                    acc += a * k[j][i];
                }
                y_stage[i] = y[i] + h * acc;
            }
            system.derivatives(t + C[s] * h, y_stage, &mut k[s]);
        }
        self.y_new.copy_from_slice(&self.y_stage);

        let mut sum = 0.0;
        for i in 0..n {
            let mut err = 0.0;
            for (j, e) in E.iter().enumerate() {
                err += e * self.k[j][i];
            }
            let ratio = h * err / self.scale(y[i], self.y_new[i]);
            sum += ratio * ratio;
        }
        let error = (sum / n as f64).sqrt();
        if self.y_new.iter().chain(self.k[6].iter()).any(|v| !v.is_finite()) {
            return f64::INFINITY;
        }
        error
    }

    /// Starting step size magnitude (Hairer, Nørsett & Wanner, II.4).
    fn initial_step<S: OdeSystem>(
        &mut self,
        system: &S,
        t0: f64,
        y: &[f64],
        t1: f64,
        evals: &mut usize,
    ) -> f64 {
        let n = y.len() as f64;
        let span = (t1 - t0).abs();
        let dir = (t1 - t0).signum();

        let mut d0 = 0.0;
        let mut d1 = 0.0;
        for (yi, fi) in y.iter().zip(&self.k[0]) {
            let sc = self.scale(*yi, *yi);
            d0 += (yi / sc) * (yi / sc);
            d1 += (fi / sc) * (fi / sc);
        }
        let d0 = (d0 / n).sqrt();
        let d1 = (d1 / n).sqrt();
        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        }
        .min(span);

        for i in 0..y.len() {
            self.y_stage[i] = y[i] + dir * h0 * self.k[0][i];
        }
        let Self { k, y_stage, .. } = self;
        system.derivatives(t0 + dir * h0, y_stage, &mut k[1]);
        *evals += 1;

        let mut d2 = 0.0;
        for i in 0..y.len() {
            let sc = self.scale(y[i], y[i]);
            let v = (self.k[1][i] - self.k[0][i]) / sc;
            d2 += v * v;
        }
        let d2 = (d2 / n).sqrt() / h0;
        let dmax = d1.max(d2);
        let h1 = if !dmax.is_finite() {
            h0 * 1e-3
        } else if dmax <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / dmax).powf(0.2)
        };
        (100.0 * h0).min(h1).min(span)
    }
}

fn solver_error(t_start: f64, t_end: f64, reason: &str) -> BdmmError {
    BdmmError::Solver {
        t_start,
        t_end,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay {
        rate: f64,
    }

    impl OdeSystem for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn derivatives(&self, _t: f64, y: &[f64], y_dot: &mut [f64]) {
            y_dot[0] = -self.rate * y[0];
        }
    }

    struct Oscillator;

    impl OdeSystem for Oscillator {
        fn dimension(&self) -> usize {
            2
        }

        fn derivatives(&self, _t: f64, y: &[f64], y_dot: &mut [f64]) {
            y_dot[0] = y[1];
            y_dot[1] = -y[0];
        }
    }

    #[test]
    fn exponential_decay_matches_closed_form() {
        let mut solver = DormandPrince::new(1e-100, 1e-10, 100_000);
        let mut y = [1.0];
        solver
            .integrate(&Decay { rate: 1.5 }, 0.0, &mut y, 2.0)
            .expect("integration failed");
        let expected = (-3.0f64).exp();
        assert!((y[0] - expected).abs() < 1e-8 * expected, "{} vs {}", y[0], expected);
    }

    #[test]
    fn integrates_backwards_in_time() {
        let mut solver = DormandPrince::new(1e-100, 1e-10, 100_000);
        let mut y = [1.0];
        solver
            .integrate(&Decay { rate: 1.0 }, 3.0, &mut y, 1.0)
            .expect("integration failed");
        let expected = 2.0f64.exp();
        assert!((y[0] - expected).abs() < 1e-8 * expected);
    }

    #[test]
    fn oscillator_returns_after_full_period() {
        let mut solver = DormandPrince::new(1e-12, 1e-10, 1_000_000);
        let mut y = [1.0, 0.0];
        solver
            .integrate(&Oscillator, 0.0, &mut y, 2.0 * std::f64::consts::PI)
            .expect("integration failed");
        assert!((y[0] - 1.0).abs() < 1e-7);
        assert!(y[1].abs() < 1e-7);
    }

    #[test]
    fn evaluation_budget_is_enforced() {
        let mut solver = DormandPrince::new(1e-100, 1e-12, 20);
        let mut y = [1.0, 0.0];
        let err = solver
            .integrate(&Oscillator, 0.0, &mut y, 100.0)
            .expect_err("expected budget error");
        assert!(matches!(err, BdmmError::EvaluationBudgetExceeded { .. }));
    }
}
