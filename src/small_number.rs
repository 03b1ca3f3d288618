//! Non-negative reals stored as `mantissa * 2^exponent`.
//!
//! Lineage densities on trees with many samples are products of one factor per
//! sample and leave the range of `f64` long before the likelihood itself
//! becomes negligible. `SmallNumber` keeps the mantissa in `[1, 2)` and moves
//! the magnitude into an unbounded integer exponent.

use std::fmt;
use std::ops::{Add, Mul};

const MANTISSA_BITS: u64 = 52;
const EXPONENT_MASK: u64 = 0x7ff << MANTISSA_BITS;
const EXPONENT_BIAS: i64 = 1023;

/// Mantissas further apart than this many binary orders cannot affect a sum.
const ADD_CUTOFF: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmallNumber {
    mantissa: f64,
    exponent: i64,
}

impl SmallNumber {
    pub const fn zero() -> Self {
        Self {
            mantissa: 0.0,
            exponent: 0,
        }
    }

    pub fn new(value: f64) -> Self {
        Self::from_parts(value, 0)
    }

    /// Builds `value * 2^exponent`, renormalizing the mantissa.
    pub fn from_parts(value: f64, exponent: i64) -> Self {
        if value == 0.0 {
            return Self::zero();
        }
        if !value.is_finite() {
            // Kept unnormalized so callers can still detect it.
            return Self {
                mantissa: value,
                exponent,
            };
        }
        let (mantissa, shift) = split(value);
        Self {
            mantissa,
            exponent: exponent + shift,
        }
    }

    /// Builds the number whose natural logarithm is `ln_value`.
    pub fn from_ln(ln_value: f64) -> Self {
        if ln_value == f64::NEG_INFINITY {
            return Self::zero();
        }
        let log2 = ln_value / std::f64::consts::LN_2;
        let exponent = log2.floor();
        let mantissa = (log2 - exponent).exp2();
        Self::from_parts(mantissa, exponent as i64)
    }

    pub fn mantissa(&self) -> f64 {
        self.mantissa
    }

    pub fn exponent(&self) -> i64 {
        self.exponent
    }

    pub fn is_zero(&self) -> bool {
        self.mantissa == 0.0
    }

    pub fn multiply(&self, other: &SmallNumber) -> SmallNumber {
        if self.is_zero() || other.is_zero() {
            return Self::zero();
        }
        Self::from_parts(self.mantissa * other.mantissa, self.exponent + other.exponent)
    }

    pub fn scalar_multiply(&self, k: f64) -> SmallNumber {
        if self.is_zero() || k == 0.0 {
            return Self::zero();
        }
        Self::from_parts(self.mantissa * k, self.exponent)
    }

    pub fn add_scaled(&self, other: &SmallNumber) -> SmallNumber {
        if self.is_zero() {
            return *other;
        }
        if other.is_zero() {
            return *self;
        }
        let (big, small) = if self.exponent >= other.exponent {
            (self, other)
        } else {
            (other, self)
        };
        let diff = small.exponent - big.exponent;
        if diff < -ADD_CUTOFF {
            return *big;
        }
        Self::from_parts(
            big.mantissa + small.mantissa * (diff as f64).exp2(),
            big.exponent,
        )
    }

    /// Natural logarithm; `-inf` for zero.
    pub fn ln(&self) -> f64 {
        if self.is_zero() {
            return f64::NEG_INFINITY;
        }
        self.mantissa.ln() + self.exponent as f64 * std::f64::consts::LN_2
    }

    /// Plain `f64` value; underflows to zero (or overflows to infinity) when
    /// the magnitude is outside the representable range.
    pub fn to_f64(&self) -> f64 {
        if self.is_zero() {
            return 0.0;
        }
        scale_by_exp2(self.mantissa, self.exponent)
    }

    /// Mantissa scaled by `2^(exponent - reference)`, the representation used
    /// when many numbers share one common exponent.
    pub fn relative_to(&self, reference: i64) -> f64 {
        if self.is_zero() {
            return 0.0;
        }
        scale_by_exp2(self.mantissa, self.exponent - reference)
    }
}

impl Default for SmallNumber {
    fn default() -> Self {
        Self::zero()
    }
}

impl Mul for SmallNumber {
    type Output = SmallNumber;

    fn mul(self, rhs: SmallNumber) -> SmallNumber {
        self.multiply(&rhs)
    }
}

impl Add for SmallNumber {
    type Output = SmallNumber;

    fn add(self, rhs: SmallNumber) -> SmallNumber {
        self.add_scaled(&rhs)
    }
}

impl fmt::Display for SmallNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x2^{}", self.mantissa, self.exponent)
    }
}

/// Splits a finite non-zero value into a mantissa in `[1, 2)` (sign kept) and a
/// binary exponent.
fn split(value: f64) -> (f64, i64) {
    let mut bits = value.to_bits();
    let mut raw = ((bits & EXPONENT_MASK) >> MANTISSA_BITS) as i64;
    let mut shift = 0i64;
    if raw == 0 {
        // Subnormal: lift into the normal range first.
        let lifted = value * (64f64).exp2();
        bits = lifted.to_bits();
        raw = ((bits & EXPONENT_MASK) >> MANTISSA_BITS) as i64;
        shift = -64;
    }
    let mantissa = f64::from_bits((bits & !EXPONENT_MASK) | ((EXPONENT_BIAS as u64) << MANTISSA_BITS));
    (mantissa, raw - EXPONENT_BIAS + shift)
}

/// `value * 2^exponent` computed in steps so intermediate powers of two never
/// overflow or underflow on their own.
fn scale_by_exp2(value: f64, exponent: i64) -> f64 {
    let mut result = value;
    let mut remaining = exponent;
    while remaining > 1000 {
        result *= (1000f64).exp2();
        remaining -= 1000;
        if result.is_infinite() {
            return result;
        }
    }
    while remaining < -1000 {
        result *= (-1000f64).exp2();
        remaining += 1000;
        if result == 0.0 {
            return 0.0;
        }
    }
    result * (remaining as f64).exp2()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, eps: f64) {
        assert!(
            (a - b).abs() <= eps,
            "expected {a} ~= {b} within eps={eps}, got diff={}",
            (a - b).abs()
        );
    }

    #[test]
    fn mantissa_is_normalized() {
        for v in [1e-300, 3.5, 0.75, 1e300, f64::MIN_POSITIVE / 8.0] {
            let n = SmallNumber::new(v);
            assert!(n.mantissa() >= 1.0 && n.mantissa() < 2.0, "{n}");
            approx_eq(n.ln(), v.ln(), 1e-12 * v.ln().abs().max(1.0));
        }
    }

    #[test]
    fn log_of_product_is_sum_of_logs() {
        let a = SmallNumber::new(1e-200);
        let b = SmallNumber::new(3e-250);
        let prod = a.multiply(&b);
        approx_eq(prod.ln(), a.ln() + b.ln(), 1e-9);
        assert_eq!(prod, b.multiply(&a));
        // The plain double product would have underflowed.
        assert_eq!(1e-200 * 3e-250, 0.0);
        assert!(prod.ln().is_finite());
    }

    #[test]
    fn addition_is_commutative_and_exact_for_plain_values() {
        let a = SmallNumber::new(0.125);
        let b = SmallNumber::new(3.0);
        assert_eq!(a.add_scaled(&b), b.add_scaled(&a));
        approx_eq(a.add_scaled(&b).to_f64(), 3.125, 1e-15);
    }

    #[test]
    fn adding_negligible_term_returns_larger() {
        let big = SmallNumber::new(1.0);
        let tiny = SmallNumber::from_ln(-1000.0);
        assert_eq!(big.add_scaled(&tiny), big);
    }

    #[test]
    fn zero_handling() {
        let z = SmallNumber::zero();
        let a = SmallNumber::new(2.5);
        assert!(a.multiply(&z).is_zero());
        assert_eq!(a.multiply(&z).ln(), f64::NEG_INFINITY);
        assert_eq!(a.add_scaled(&z), a);
        assert!(a.scalar_multiply(0.0).is_zero());
    }

    #[test]
    fn from_ln_roundtrips() {
        for l in [-5000.0, -745.5, -1.0, 0.0, 12.25] {
            approx_eq(SmallNumber::from_ln(l).ln(), l, 1e-9 * l.abs().max(1.0));
        }
    }
}
