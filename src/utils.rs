/// Absolute tolerance used to decide whether two process times coincide.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Precision {
    pub threshold: f64,
}

impl Precision {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    #[inline]
    pub fn eq(&self, a: f64, b: f64) -> bool {
        (a - b).abs() < self.threshold
    }

    #[inline]
    pub fn lt(&self, a: f64, b: f64) -> bool {
        a < b - self.threshold
    }

    #[inline]
    pub fn gt(&self, a: f64, b: f64) -> bool {
        a > b + self.threshold
    }
}

impl Default for Precision {
    fn default() -> Self {
        Self { threshold: 1e-10 }
    }
}

/// ln(n!), i.e. lnGamma(n + 1) for integer n.
pub fn ln_factorial(n: usize) -> f64 {
    (2..=n).map(|k| (k as f64).ln()).sum()
}
