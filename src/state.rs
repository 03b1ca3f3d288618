use std::fmt;

use crate::small_number::SmallNumber;

/// Extinction probabilities per type.
#[derive(Debug, Clone, PartialEq)]
pub struct P0State {
    pub p0: Vec<f64>,
}

impl P0State {
    /// State at the present: no lineage has had a chance to be sampled yet.
    pub fn ones(n_types: usize) -> Self {
        Self {
            p0: vec![1.0; n_types],
        }
    }
}

/// Extinction probability and observed-subtree density per type at one point
/// of an edge.
#[derive(Debug, Clone, PartialEq)]
pub struct P0GeState {
    pub p0: Vec<f64>,
    pub ge: Vec<SmallNumber>,
}

impl P0GeState {
    pub fn n_types(&self) -> usize {
        self.p0.len()
    }

    /// Plain-`f64` form for the ODE solver: `p0` unscaled, `ge` sharing one
    /// binary exponent chosen so the largest density has a mantissa in `[1, 2)`.
    pub fn to_scaled(&self) -> ScaledState {
        let n = self.n_types();
        let exponent = self
            .ge
            .iter()
            .filter(|g| !g.is_zero() && g.mantissa().is_finite())
            .map(SmallNumber::exponent)
            .max()
            .unwrap_or(0);

        let mut values = Vec::with_capacity(2 * n);
        values.extend_from_slice(&self.p0);
        values.extend(self.ge.iter().map(|g| g.relative_to(exponent)));
        ScaledState { values, exponent }
    }

    pub fn from_scaled(scaled: &ScaledState) -> Self {
        let n = scaled.n_types();
        let mut state = Self {
            p0: vec![0.0; n],
            ge: vec![SmallNumber::zero(); n],
        };
        state.set_from_scaled(scaled);
        state
    }

    pub fn set_from_scaled(&mut self, scaled: &ScaledState) {
        let n = self.n_types();
        debug_assert_eq!(scaled.values.len(), 2 * n);
        self.p0.copy_from_slice(&scaled.values[..n]);
        for (g, &v) in self.ge.iter_mut().zip(&scaled.values[n..]) {
            // The solver may overshoot a vanishing density slightly below zero.
            *g = SmallNumber::from_parts(v.max(0.0), scaled.exponent);
        }
    }

    /// Multiplies every type's `p0` and `ge` by `1 - rho_i`.
    pub fn discount(&mut self, rho: impl IntoIterator<Item = f64>) {
        for ((p, g), r) in self.p0.iter_mut().zip(self.ge.iter_mut()).zip(rho) {
            *p *= 1.0 - r;
            *g = g.scalar_multiply(1.0 - r);
        }
    }
}

impl fmt::Display for P0GeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (p, g)) in self.p0.iter().zip(&self.ge).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "p0[{i}]={p} ge[{i}]={g}")?;
        }
        Ok(())
    }
}

/// `P0GeState` as a flat vector `[p0..., ge...]` with `ge_i = values[n+i] * 2^exponent`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaledState {
    pub values: Vec<f64>,
    pub exponent: i64,
}

impl ScaledState {
    pub fn n_types(&self) -> usize {
        self.values.len() / 2
    }
}
