//! Right-hand sides of the extinction (`p0`) and lineage-density (`p0`, `ge`)
//! systems.
//!
//! A system is a read-only view of the schedule plus an interval cursor; the
//! integrator moves the cursor as it crosses interval boundaries. Each
//! traversal task owns its own copy, so no state is shared between workers.

use crate::schedule::RateSchedule;

pub trait OdeSystem {
    fn dimension(&self) -> usize;

    fn derivatives(&self, t: f64, y: &[f64], y_dot: &mut [f64]);
}

#[derive(Debug, Clone, Copy)]
pub struct P0System<'a> {
    schedule: &'a RateSchedule,
    interval: usize,
}

impl<'a> P0System<'a> {
    pub fn new(schedule: &'a RateSchedule, interval: usize) -> Self {
        Self { schedule, interval }
    }

    /// System with its cursor on the interval containing `t`.
    pub fn at_time(schedule: &'a RateSchedule, t: f64) -> Self {
        Self::new(schedule, schedule.interval_index(t))
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    pub fn set_interval(&mut self, interval: usize) {
        self.interval = interval;
    }
}

impl OdeSystem for P0System<'_> {
    fn dimension(&self) -> usize {
        self.schedule.n_types()
    }

    fn derivatives(&self, _t: f64, y: &[f64], y_dot: &mut [f64]) {
        p0_derivatives(self.schedule, self.interval, y, y_dot);
    }
}

/// Joint system over `[p0..., ge...]`. The `ge` half is linear in `ge`, so it
/// can be integrated on a common rescaling of the densities.
#[derive(Debug, Clone, Copy)]
pub struct P0GeSystem<'a> {
    schedule: &'a RateSchedule,
    interval: usize,
}

impl<'a> P0GeSystem<'a> {
    pub fn new(schedule: &'a RateSchedule, interval: usize) -> Self {
        Self { schedule, interval }
    }

    pub fn at_time(schedule: &'a RateSchedule, t: f64) -> Self {
        Self::new(schedule, schedule.interval_index(t))
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    pub fn set_interval(&mut self, interval: usize) {
        self.interval = interval;
    }
}

impl OdeSystem for P0GeSystem<'_> {
    fn dimension(&self) -> usize {
        2 * self.schedule.n_types()
    }

    fn derivatives(&self, _t: f64, y: &[f64], y_dot: &mut [f64]) {
        let n = self.schedule.n_types();
        let (p0, ge) = y.split_at(n);
        let (p0_dot, ge_dot) = y_dot.split_at_mut(n);
        p0_derivatives(self.schedule, self.interval, p0, p0_dot);

        let k = self.interval;
        let birth = self.schedule.birth_rates();
        let death = self.schedule.death_rates();
        let sampling = self.schedule.sampling_rates();
        let cross = self.schedule.cross_birth_rates();
        let mig = self.schedule.migration_rates();

        for i in 0..n {
            let b = birth[(k, i)];
            let mut d = (b + death[(k, i)] + sampling[(k, i)] - 2.0 * b * p0[i]) * ge[i];
            for j in 0..n {
                if i == j {
                    continue;
                }
                let c = cross[(k, i, j)];
                let m = mig[(k, i, j)];
                d += c * ge[i] - c * (p0[i] * ge[j] + p0[j] * ge[i]);
                d += m * ge[i] - m * ge[j];
            }
            ge_dot[i] = d;
        }
    }
}

fn p0_derivatives(schedule: &RateSchedule, k: usize, p0: &[f64], p0_dot: &mut [f64]) {
    let n = schedule.n_types();
    let birth = schedule.birth_rates();
    let death = schedule.death_rates();
    let sampling = schedule.sampling_rates();
    let cross = schedule.cross_birth_rates();
    let mig = schedule.migration_rates();

    for i in 0..n {
        let b = birth[(k, i)];
        let d = death[(k, i)];
        let mut v = (b + d + sampling[(k, i)]) * p0[i] - b * p0[i] * p0[i] - d;
        for j in 0..n {
            if i == j {
                continue;
            }
            let c = cross[(k, i, j)];
            let m = mig[(k, i, j)];
            v += c * p0[i] - c * p0[i] * p0[j];
            v += m * p0[i] - m * p0[j];
        }
        p0_dot[i] = v;
    }
}
