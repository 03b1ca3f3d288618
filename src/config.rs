use serde::{Deserialize, Serialize};

use crate::error::{BdmmError, Result};
use crate::utils::Precision;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LikelihoodConfig {
    pub rel_tolerance: f64,
    pub abs_tolerance: f64,
    /// Absolute tolerance for deciding that two times coincide.
    pub precision_threshold: f64,
    /// Derivative evaluations allowed per solver call.
    pub max_evaluations: usize,
    pub parallelize: bool,
    /// Both children of a node must carry more than this fraction of the total
    /// tree length before one of them is handed to another worker.
    pub parallelization_factor: f64,
    pub threads: Option<usize>,
    pub use_single_type_closed_form: bool,
    pub condition_on_survival: bool,
    pub condition_on_root: bool,
    pub final_sample_offset: f64,
}

impl Default for LikelihoodConfig {
    fn default() -> Self {
        Self {
            rel_tolerance: 1e-7,
            abs_tolerance: 1e-100,
            precision_threshold: 1e-10,
            max_evaluations: 1_000_000,
            parallelize: true,
            parallelization_factor: 1.0 / 10.0,
            threads: None,
            use_single_type_closed_form: true,
            condition_on_survival: true,
            condition_on_root: false,
            final_sample_offset: 0.0,
        }
    }
}

impl LikelihoodConfig {
    pub fn precision(&self) -> Precision {
        Precision::new(self.precision_threshold)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("rel_tolerance", self.rel_tolerance),
            ("abs_tolerance", self.abs_tolerance),
            ("precision_threshold", self.precision_threshold),
        ];
        for (name, v) in positive {
            if !(v > 0.0 && v.is_finite()) {
                return Err(BdmmError::InvalidConfig(format!(
                    "{name} must be a positive finite number, got {v}"
                )));
            }
        }
        if self.max_evaluations == 0 {
            return Err(BdmmError::InvalidConfig(
                "max_evaluations must be >= 1".to_string(),
            ));
        }
        if !(self.parallelization_factor > 0.0 && self.parallelization_factor <= 1.0) {
            return Err(BdmmError::InvalidConfig(format!(
                "parallelization_factor must lie in (0, 1], got {}",
                self.parallelization_factor
            )));
        }
        if self.threads == Some(0) {
            return Err(BdmmError::InvalidConfig("threads must be >= 1".to_string()));
        }
        if !(self.final_sample_offset >= 0.0 && self.final_sample_offset.is_finite()) {
            return Err(BdmmError::InvalidConfig(format!(
                "final_sample_offset must be finite and non-negative, got {}",
                self.final_sample_offset
            )));
        }
        Ok(())
    }
}
