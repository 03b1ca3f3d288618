//! Piecewise-constant rate schedule of the birth-death-migration process.
//!
//! Process time runs from the origin (`t = 0`) towards the present
//! (`t = origin`). Interval `k` covers `(end[k-1], end[k]]`; a rho-sampling
//! event with proportions `rho[k]` happens at `end[k]`.

use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::error::{BdmmError, Result};
use crate::utils::Precision;

/// Serialized form of a schedule. Rate tables are indexed
/// `[interval][type]`, pairwise tables `[interval][from][to]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateScheduleSpec {
    /// Length of the process, from the origin to the present.
    pub origin: f64,
    #[serde(default)]
    pub types: Option<Vec<String>>,
    /// Interior interval boundaries in process time, strictly increasing.
    #[serde(default)]
    pub change_times: Vec<f64>,
    pub birth: Vec<Vec<f64>>,
    pub death: Vec<Vec<f64>>,
    pub sampling: Vec<Vec<f64>>,
    #[serde(default)]
    pub removal: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    pub rho: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    pub cross_birth: Option<Vec<Vec<Vec<f64>>>>,
    #[serde(default)]
    pub migration: Option<Vec<Vec<Vec<f64>>>>,
}

impl RateScheduleSpec {
    /// Schedule of the given shape with all rates zero (removal probability one).
    pub fn zeros(origin: f64, change_times: Vec<f64>, n_types: usize) -> Self {
        let n_intervals = change_times.len() + 1;
        let per_type = |v: f64| vec![vec![v; n_types]; n_intervals];
        let pairwise = vec![vec![vec![0.0; n_types]; n_types]; n_intervals];
        Self {
            origin,
            types: None,
            change_times,
            birth: per_type(0.0),
            death: per_type(0.0),
            sampling: per_type(0.0),
            removal: Some(per_type(1.0)),
            rho: Some(per_type(0.0)),
            cross_birth: Some(pairwise.clone()),
            migration: Some(pairwise),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateSchedule {
    n_types: usize,
    origin: f64,
    type_names: Vec<String>,
    start_times: Vec<f64>,
    end_times: Vec<f64>,
    birth: Array2<f64>,
    death: Array2<f64>,
    sampling: Array2<f64>,
    removal: Array2<f64>,
    rho: Array2<f64>,
    cross_birth: Array3<f64>,
    migration: Array3<f64>,
}

impl RateSchedule {
    pub fn new(spec: RateScheduleSpec) -> Result<Self> {
        if !(spec.origin > 0.0 && spec.origin.is_finite()) {
            return Err(invalid(format!(
                "origin must be positive and finite, got {}",
                spec.origin
            )));
        }
        let n_types = spec.birth.first().map(Vec::len).unwrap_or(0);
        if n_types == 0 {
            return Err(invalid("birth rates must list at least one type".to_string()));
        }

        let mut prev = 0.0;
        for &t in &spec.change_times {
            if !t.is_finite() || t <= prev || t >= spec.origin {
                return Err(invalid(format!(
                    "change times must be strictly increasing within (0, {}), got {:?}",
                    spec.origin, spec.change_times
                )));
            }
            prev = t;
        }
        let n_intervals = spec.change_times.len() + 1;

        let birth = per_type_table("birth", &spec.birth, n_intervals, n_types, None)?;
        let death = per_type_table("death", &spec.death, n_intervals, n_types, None)?;
        let sampling = per_type_table("sampling", &spec.sampling, n_intervals, n_types, None)?;
        let removal = match &spec.removal {
            Some(v) => per_type_table("removal", v, n_intervals, n_types, Some(1.0))?,
            None => Array2::from_elem((n_intervals, n_types), 1.0),
        };
        let rho = match &spec.rho {
            Some(v) => per_type_table("rho", v, n_intervals, n_types, Some(1.0))?,
            None => Array2::zeros((n_intervals, n_types)),
        };
        let cross_birth = match &spec.cross_birth {
            Some(v) => pairwise_table("cross_birth", v, n_intervals, n_types)?,
            None => Array3::zeros((n_intervals, n_types, n_types)),
        };
        let migration = match &spec.migration {
            Some(v) => pairwise_table("migration", v, n_intervals, n_types)?,
            None => Array3::zeros((n_intervals, n_types, n_types)),
        };

        let type_names = match spec.types {
            Some(names) => {
                if names.len() != n_types {
                    return Err(invalid(format!(
                        "{} type names given for {} types",
                        names.len(),
                        n_types
                    )));
                }
                names
            }
            None => (0..n_types).map(|k| k.to_string()).collect(),
        };

        let mut start_times = Vec::with_capacity(n_intervals);
        start_times.push(0.0);
        start_times.extend_from_slice(&spec.change_times);
        let mut end_times = spec.change_times.clone();
        end_times.push(spec.origin);

        Ok(Self {
            n_types,
            origin: spec.origin,
            type_names,
            start_times,
            end_times,
            birth,
            death,
            sampling,
            removal,
            rho,
            cross_birth,
            migration,
        })
    }

    pub fn n_types(&self) -> usize {
        self.n_types
    }

    pub fn interval_count(&self) -> usize {
        self.end_times.len()
    }

    /// Index of the interval containing `t`. A time equal to an interval end
    /// belongs to that interval; times outside the process are clamped.
    pub fn interval_index(&self, t: f64) -> usize {
        let idx = self.end_times.partition_point(|&e| e < t);
        idx.min(self.end_times.len() - 1)
    }

    /// Like `interval_index`, but a time within the precision threshold of an
    /// interval end is placed on that end.
    pub fn interval_index_at(&self, t: f64, precision: Precision) -> usize {
        self.interval_index(t - precision.threshold)
    }

    pub fn interval_start_times(&self) -> &[f64] {
        &self.start_times
    }

    pub fn interval_end_times(&self) -> &[f64] {
        &self.end_times
    }

    pub fn birth_rates(&self) -> &Array2<f64> {
        &self.birth
    }

    pub fn death_rates(&self) -> &Array2<f64> {
        &self.death
    }

    pub fn sampling_rates(&self) -> &Array2<f64> {
        &self.sampling
    }

    pub fn removal_probs(&self) -> &Array2<f64> {
        &self.removal
    }

    pub fn rho_values(&self) -> &Array2<f64> {
        &self.rho
    }

    pub fn cross_birth_rates(&self) -> &Array3<f64> {
        &self.cross_birth
    }

    pub fn migration_rates(&self) -> &Array3<f64> {
        &self.migration
    }

    pub fn origin(&self) -> f64 {
        self.origin
    }

    pub fn type_names(&self) -> &[String] {
        &self.type_names
    }

    /// Process time of a node at the given height above the most recent sample.
    pub fn node_time(&self, height: f64, final_sample_offset: f64) -> f64 {
        self.origin - height - final_sample_offset
    }

    pub fn rho_sampling_times(&self) -> Vec<f64> {
        (0..self.interval_count())
            .filter(|&k| self.has_rho(k))
            .map(|k| self.end_times[k])
            .collect()
    }

    /// Interval whose end coincides with `t` and carries a rho-sampling event.
    pub fn rho_interval_at(&self, t: f64, precision: Precision) -> Option<usize> {
        (0..self.interval_count()).find(|&k| self.has_rho(k) && precision.eq(self.end_times[k], t))
    }

    fn has_rho(&self, interval: usize) -> bool {
        self.rho.row(interval).iter().any(|&r| r > 0.0)
    }

    /// Resolves a sample label to a type index. Numeric labels such as "1.0"
    /// match the type named "1".
    pub fn type_index(&self, label: &str) -> Option<usize> {
        let label = label.trim();
        if let Some(k) = self.type_names.iter().position(|n| n == label) {
            return Some(k);
        }
        let value: f64 = label.parse().ok()?;
        if !value.is_finite() {
            return None;
        }
        let rounded = (value.round() as i64).to_string();
        self.type_names.iter().position(|n| *n == rounded)
    }
}

fn invalid(msg: String) -> BdmmError {
    BdmmError::InvalidSchedule(msg)
}

fn check_value(name: &str, v: f64, upper: Option<f64>) -> Result<()> {
    if !v.is_finite() || v < 0.0 {
        return Err(invalid(format!("{name} values must be finite and >= 0, got {v}")));
    }
    if let Some(hi) = upper
        && v > hi
    {
        return Err(invalid(format!("{name} values must be <= {hi}, got {v}")));
    }
    Ok(())
}

fn per_type_table(
    name: &str,
    rows: &[Vec<f64>],
    n_intervals: usize,
    n_types: usize,
    upper: Option<f64>,
) -> Result<Array2<f64>> {
    if rows.len() != n_intervals {
        return Err(invalid(format!(
            "{name} has {} intervals, expected {n_intervals}",
            rows.len()
        )));
    }
    let mut out = Array2::zeros((n_intervals, n_types));
    for (k, row) in rows.iter().enumerate() {
        if row.len() != n_types {
            return Err(invalid(format!(
                "{name}[{k}] has {} types, expected {n_types}",
                row.len()
            )));
        }
        for (i, &v) in row.iter().enumerate() {
            check_value(name, v, upper)?;
            out[(k, i)] = v;
        }
    }
    Ok(out)
}

fn pairwise_table(
    name: &str,
    rows: &[Vec<Vec<f64>>],
    n_intervals: usize,
    n_types: usize,
) -> Result<Array3<f64>> {
    if rows.len() != n_intervals {
        return Err(invalid(format!(
            "{name} has {} intervals, expected {n_intervals}",
            rows.len()
        )));
    }
    let mut out = Array3::zeros((n_intervals, n_types, n_types));
    for (k, matrix) in rows.iter().enumerate() {
        if matrix.len() != n_types || matrix.iter().any(|r| r.len() != n_types) {
            return Err(invalid(format!(
                "{name}[{k}] must be a {n_types}x{n_types} matrix"
            )));
        }
        for i in 0..n_types {
            for j in 0..n_types {
                if i == j {
                    continue;
                }
                let v = matrix[i][j];
                check_value(name, v, None)?;
                out[(k, i, j)] = v;
            }
        }
    }
    Ok(out)
}
