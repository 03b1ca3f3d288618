//! Integration of edge states across rate intervals.
//!
//! Integration always runs from a later process time (closer to the present)
//! towards an earlier one. Crossing the end of interval `k` multiplies the
//! state by `1 - rho[k]`, exactly once, unless the crossing point is the
//! target time itself; the caller applies any event at the target.

use ndarray::{Array2, ArrayView1};

use crate::config::LikelihoodConfig;
use crate::error::Result;
use crate::ode::{P0GeSystem, P0System};
use crate::schedule::RateSchedule;
use crate::solver::DormandPrince;
use crate::state::{P0GeState, P0State};
use crate::utils::Precision;

#[derive(Debug, Clone)]
pub struct IntervalIntegrator<'a> {
    schedule: &'a RateSchedule,
    precision: Precision,
    solver: DormandPrince,
}

impl<'a> IntervalIntegrator<'a> {
    pub fn new(schedule: &'a RateSchedule, config: &LikelihoodConfig) -> Self {
        Self {
            schedule,
            precision: config.precision(),
            solver: DormandPrince::new(
                config.abs_tolerance,
                config.rel_tolerance,
                config.max_evaluations,
            ),
        }
    }

    pub fn schedule(&self) -> &'a RateSchedule {
        self.schedule
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Integrates extinction probabilities from `t_start` back to `t_end`.
    pub fn integrate_p0(&mut self, state: &mut P0State, t_start: f64, t_end: f64) -> Result<()> {
        let schedule = self.schedule;
        let precision = self.precision;
        let end_times = schedule.interval_end_times();

        let mut this_time = t_start;
        let mut this_interval = schedule.interval_index_at(this_time, precision);
        let end_interval = schedule.interval_index(t_end);
        let mut system = P0System::new(schedule, this_interval);

        while this_interval > end_interval {
            let next_time = end_times[this_interval - 1];
            if precision.lt(next_time, this_time) {
                system.set_interval(this_interval);
                self.solver
                    .integrate(&system, this_time, &mut state.p0, next_time)?;
            }
            if precision.gt(next_time, t_end) {
                let rho = schedule.rho_values().row(this_interval - 1);
                for (p, r) in state.p0.iter_mut().zip(rho.iter()) {
                    *p *= 1.0 - r;
                }
            }
            this_time = next_time;
            this_interval -= 1;
        }

        if precision.gt(this_time, t_end) {
            system.set_interval(this_interval);
            self.solver
                .integrate(&system, this_time, &mut state.p0, t_end)?;
        }
        Ok(())
    }

    /// Integrates a joint state from `t_start` back to `t_end`, integrating
    /// on a rescaled copy and rescaling again after every boundary.
    pub fn integrate_p0ge(
        &mut self,
        state: &mut P0GeState,
        t_start: f64,
        t_end: f64,
    ) -> Result<()> {
        let schedule = self.schedule;
        let precision = self.precision;
        let end_times = schedule.interval_end_times();

        let mut scaled = state.to_scaled();
        let mut this_time = t_start;
        let mut this_interval = schedule.interval_index_at(this_time, precision);
        let end_interval = schedule.interval_index(t_end);
        let mut system = P0GeSystem::new(schedule, this_interval);

        while this_interval > end_interval {
            let next_time = end_times[this_interval - 1];
            if precision.lt(next_time, this_time) {
                self.solver
                    .integrate(&system, this_time, &mut scaled.values, next_time)?;
                log::trace!(
                    "integrated interval {this_interval} from {this_time} to {next_time}"
                );
                state.set_from_scaled(&scaled);

                if precision.gt(next_time, t_end) {
                    let rho = schedule.rho_values().row(this_interval - 1);
                    state.discount(rho.iter().copied());
                }
                scaled = state.to_scaled();
            }
            this_time = next_time;
            this_interval -= 1;
            system.set_interval(this_interval);
        }

        if precision.gt(this_time, t_end) {
            self.solver
                .integrate(&system, this_time, &mut scaled.values, t_end)?;
        }
        state.set_from_scaled(&scaled);
        Ok(())
    }

    /// Extinction probabilities at every sample time and at `t_condition`,
    /// from one sweep starting at the present.
    ///
    /// Values at a time that coincides with a rho-sampling boundary do not
    /// include that boundary's `1 - rho` factor.
    pub fn initial_conditions(
        &mut self,
        sample_times: &[f64],
        t_condition: f64,
    ) -> Result<InitialConditions> {
        let schedule = self.schedule;
        let precision = self.precision;
        let n_types = schedule.n_types();
        let n = sample_times.len();

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| sample_times[a].total_cmp(&sample_times[b]));

        let mut p0 = Array2::zeros((n, n_types));
        let mut state = P0State::ones(n_types);
        let mut t_prev = schedule.origin();

        for pos in (0..n).rev() {
            let idx = order[pos];
            let t = sample_times[idx];

            if precision.eq(t, t_prev) {
                if pos + 1 < n {
                    let prev_row = p0.row(order[pos + 1]).to_owned();
                    p0.row_mut(idx).assign(&prev_row);
                } else {
                    p0.row_mut(idx).assign(&ArrayView1::from(&state.p0[..]));
                }
                t_prev = t;
                continue;
            }

            self.leave_boundary(&mut state, t_prev);
            self.integrate_p0(&mut state, t_prev, t)?;
            p0.row_mut(idx)
                .assign(&ArrayView1::from(&state.p0[..]));
            t_prev = t;
        }

        if precision.gt(t_prev, t_condition) {
            self.leave_boundary(&mut state, t_prev);
        }
        self.integrate_p0(&mut state, t_prev, t_condition)?;

        Ok(InitialConditions {
            p0,
            at_condition: state.p0,
        })
    }

    /// Applies the rho factor of a boundary the sweep is about to leave.
    fn leave_boundary(&self, state: &mut P0State, t: f64) {
        let schedule = self.schedule;
        let k = schedule.interval_index_at(t, self.precision);
        if self.precision.eq(schedule.interval_end_times()[k], t) {
            let rho = schedule.rho_values().row(k);
            for (p, r) in state.p0.iter_mut().zip(rho.iter()) {
                *p *= 1.0 - r;
            }
        }
    }
}

/// Extinction probabilities per sample (`[sample, type]`) and at the
/// conditioning time.
#[derive(Debug, Clone)]
pub struct InitialConditions {
    pub p0: Array2<f64>,
    pub at_condition: Vec<f64>,
}
