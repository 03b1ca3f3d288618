//! Analytic likelihood for single-type models.
//!
//! Within interval `i` the extinction probability `p_i(t)` and the edge
//! density ratio `q_i(t)` have closed forms parameterized by constants
//! `A_i`, `B_i`, computed from the present back to the origin. Subtree values
//! are log densities at the bottom of an edge divided by `q` there, so an edge
//! contributes only its boundary factors and the parent supplies `q` at the
//! top.

use std::f64::consts::LN_2;

use crate::config::LikelihoodConfig;
use crate::likelihood::{Evaluation, Rejection, TreeLikelihood};
use crate::schedule::RateSchedule;
use crate::tree::{NodeKind, Tree};
use crate::utils::{Precision, ln_factorial};

#[derive(Debug, Clone, Copy)]
struct IntervalConstants {
    a: f64,
    b: f64,
    /// `p` at the interval's end, including that boundary's rho factor.
    p_end: f64,
}

#[derive(Debug, Clone)]
pub struct SingleTypeClosedForm<'a> {
    schedule: &'a RateSchedule,
    precision: Precision,
    constants: Vec<IntervalConstants>,
}

impl<'a> SingleTypeClosedForm<'a> {
    /// Returns `None` unless the schedule has one type and every interval
    /// has `A > 0`.
    pub fn new(schedule: &'a RateSchedule, precision: Precision) -> Option<Self> {
        if schedule.n_types() != 1 {
            return None;
        }
        let n = schedule.interval_count();
        let end_times = schedule.interval_end_times();
        let mut form = Self {
            schedule,
            precision,
            constants: vec![
                IntervalConstants {
                    a: 0.0,
                    b: 0.0,
                    p_end: 1.0,
                };
                n
            ],
        };

        for i in (0..n).rev() {
            let p_prev = if i + 1 < n {
                form.p(i + 1, end_times[i])
            } else {
                1.0
            };
            let (lambda, mu, psi) = form.rates(i);
            let rho = schedule.rho_values()[(i, 0)];

            let a = ((lambda - mu - psi).powi(2) + 4.0 * lambda * psi).sqrt();
            if !(a > 0.0 && a.is_finite()) {
                log::debug!("closed form not applicable: A = {a} in interval {i}");
                return None;
            }
            let p_end = (1.0 - rho) * p_prev;
            let b = ((1.0 - 2.0 * p_end) * lambda + mu + psi) / a;
            form.constants[i] = IntervalConstants { a, b, p_end };
        }
        Some(form)
    }

    fn rates(&self, i: usize) -> (f64, f64, f64) {
        (
            self.schedule.birth_rates()[(i, 0)],
            self.schedule.death_rates()[(i, 0)],
            self.schedule.sampling_rates()[(i, 0)],
        )
    }

    /// Extinction probability at time `t` inside interval `i`.
    pub fn p(&self, i: usize, t: f64) -> f64 {
        let IntervalConstants { a, b, p_end } = self.constants[i];
        let t_i = self.schedule.interval_end_times()[i];
        let (lambda, mu, psi) = self.rates(i);
        if lambda > 0.0 {
            let v = (a * (t_i - t)).exp() * (1.0 + b);
            (lambda + mu + psi - a * (v - (1.0 - b)) / (v + (1.0 - b))) / (2.0 * lambda)
        } else {
            // Linear equation once births vanish; here A = mu + psi.
            let fixed = mu / (mu + psi);
            fixed + (p_end - fixed) * (-a * (t_i - t)).exp()
        }
    }

    pub fn q(&self, i: usize, t: f64) -> f64 {
        let IntervalConstants { a, b, .. } = self.constants[i];
        let t_i = self.schedule.interval_end_times()[i];
        let v = (a * (t_i - t)).exp();
        4.0 * v / (v * (1.0 + b) + (1.0 - b)).powi(2)
    }

    fn p_next(&self, i: usize, t: f64) -> f64 {
        if i + 1 < self.constants.len() {
            self.p(i + 1, t)
        } else {
            1.0
        }
    }

    fn q_next(&self, i: usize, t: f64) -> f64 {
        if i + 1 < self.constants.len() {
            self.q(i + 1, t)
        } else {
            1.0
        }
    }

    /// Interval holding the top of an edge ending at `t`; a top lying on a
    /// boundary belongs to the later interval.
    fn top_interval(&self, t: f64) -> usize {
        self.schedule.interval_index(t + self.precision.threshold)
    }

    pub fn evaluate(&self, tree: &Tree, config: &LikelihoodConfig) -> Evaluation {
        let offset = config.final_sample_offset;
        let root = tree.root();
        let t_root = self.schedule.node_time(tree.height(root), offset);

        let edges = self.edge_values(tree, offset);
        let (mut log_p, t_condition) = match (config.condition_on_root, tree.kind(root)) {
            (true, NodeKind::Birth { first, second }) => {
                let i = self.top_interval(t_root);
                let log_p = edges[first] + edges[second] + LN_2 + 2.0 * self.q(i, t_root).ln();
                (log_p, t_root)
            }
            _ => {
                let i = self.top_interval(0.0);
                (edges[root] + self.q(i, 0.0).ln(), 0.0)
            }
        };

        if config.condition_on_survival {
            let p_no_sample = self.p(self.top_interval(t_condition), t_condition);
            if !(0.0..=1.0).contains(&p_no_sample) {
                return Evaluation::Rejected(Rejection::NoSampleProbabilityOutOfRange);
            }
            log_p -= (1.0 - p_no_sample).ln();
        }

        log_p -= ln_factorial(tree.sample_count());
        Evaluation::Scored(TreeLikelihood {
            log_likelihood: log_p,
            root_type_probs: vec![1.0],
        })
    }

    /// Log value at the top of every edge, each ending at its parent's time
    /// (the origin for the root). Filled in post-order.
    fn edge_values(&self, tree: &Tree, offset: f64) -> Vec<f64> {
        let schedule = self.schedule;
        let mut values = vec![0.0; tree.node_count()];
        for node in tree.post_order() {
            let t_top = tree
                .node(node)
                .parent
                .map(|p| schedule.node_time(tree.height(p), offset))
                .unwrap_or(0.0);
            values[node] = self.edge_value(tree, node, t_top, offset, &values);
        }
        values
    }

    fn edge_value(&self, tree: &Tree, node: usize, t_top: f64, offset: f64, below: &[f64]) -> f64 {
        let schedule = self.schedule;
        let precision = self.precision;
        let end_times = schedule.interval_end_times();

        let t_node = schedule.node_time(tree.height(node), offset);
        let i = schedule.interval_index_at(t_node, precision);
        let t_i = end_times[i];
        let (lambda, _, psi) = self.rates(i);
        let rho = schedule.rho_values()[(i, 0)];
        let r = schedule.removal_probs()[(i, 0)];
        let on_rho = schedule.rho_interval_at(t_node, precision).is_some();

        let mut log_p = match tree.kind(node) {
            NodeKind::Leaf | NodeKind::DirectAncestor => {
                if on_rho {
                    (rho * (r + (1.0 - r) * self.p_next(i, t_node))).ln()
                } else {
                    psi.ln() + (r + (1.0 - r) * self.p(i, t_node)).ln() - self.q(i, t_node).ln()
                }
            }
            NodeKind::SampledAncestor { child, .. } => {
                if on_rho {
                    below[child] + (rho * (1.0 - r) * self.q_next(i, t_node)).ln()
                } else {
                    below[child] + (psi * (1.0 - r)).ln()
                }
            }
            NodeKind::Birth { first, second } => {
                let q_i = self.q(i, t_node);
                let children = if precision.eq(t_i, t_node) {
                    2.0 * ((1.0 - rho) * self.q_next(i, t_node)).ln()
                } else {
                    2.0 * q_i.ln()
                };
                below[first] + below[second] + (2.0 * lambda).ln() - q_i.ln() + children
            }
        };

        // Boundaries crossed strictly inside the edge.
        let mut j = i;
        loop {
            if !precision.gt(end_times[j], t_top) {
                break;
            }
            if precision.lt(end_times[j], t_node) {
                let rho_j = schedule.rho_values()[(j, 0)];
                log_p += ((1.0 - rho_j) * self.q_next(j, end_times[j])).ln();
            }
            if j == 0 {
                break;
            }
            j -= 1;
        }
        log_p
    }
}
