//! Limited-memory inverse-Hessian approximation.
//!
//! The memory holds the most recent `(s, y)` pairs, `s = x_{k+1} - x_k` and
//! `y = g_{k+1} - g_k`, and the direction engine applies the implicit inverse
//! Hessian to a gradient with the two-loop recursion (Nocedal & Wright,
//! Algorithm 7.4).

use ndarray::Array1;
use std::collections::VecDeque;
use thiserror::Error;

/// One accepted curvature pair with its cached `1 / (s·y)`.
#[derive(Debug, Clone)]
pub struct CurvaturePair {
    s: Array1<f64>,
    y: Array1<f64>,
    rho: f64,
}

impl CurvaturePair {
    pub fn position_delta(&self) -> &Array1<f64> {
        &self.s
    }

    /// `s·y`, always strictly positive for a stored pair.
    pub fn curvature(&self) -> f64 {
        1.0 / self.rho
    }
}

/// Bounded FIFO history of curvature pairs, oldest first.
#[derive(Debug, Clone, Default)]
pub struct LbfgsMemory {
    pairs: VecDeque<CurvaturePair>,
}

impl LbfgsMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Pairs from oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &CurvaturePair> {
        self.pairs.iter()
    }

    pub fn newest(&self) -> Option<&CurvaturePair> {
        self.pairs.back()
    }

    fn push(&mut self, pair: CurvaturePair, cap: usize) {
        if cap == 0 {
            self.pairs.clear();
            return;
        }
        while self.pairs.len() >= cap {
            self.pairs.pop_front();
        }
        self.pairs.push_back(pair);
    }

    fn retain_newest(&mut self, cap: usize) {
        while self.pairs.len() > cap {
            self.pairs.pop_front();
        }
    }
}

/// Problems reported by the direction engine. The controller classifies all
/// of them as an invalid diagonal matrix.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DirectionError {
    #[error("curvature pair rejected: s·y = {curvature:.3e} is not positive")]
    InvalidCurvature { curvature: f64 },
    #[error("initial inverse-Hessian scaling {scale:.3e} is not positive")]
    InvalidDiagonal { scale: f64 },
}

/// A search direction together with its cached Euclidean norm.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchDirection {
    vector: Array1<f64>,
    magnitude: f64,
    steepest_descent: bool,
}

impl SearchDirection {
    fn new(vector: Array1<f64>, steepest_descent: bool) -> Self {
        let magnitude = euclidean_norm(&vector);
        Self {
            vector,
            magnitude,
            steepest_descent,
        }
    }

    pub fn vector(&self) -> &Array1<f64> {
        &self.vector
    }

    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    /// True when the direction is the normalized negative gradient, either
    /// because the memory was empty or because the two-loop result was not a
    /// descent direction.
    pub fn is_steepest_descent(&self) -> bool {
        self.steepest_descent
    }

    pub fn into_vector(self) -> Array1<f64> {
        self.vector
    }
}

/// Euclidean norm computed on the vector divided by its largest magnitude, so
/// finite vectors with huge components do not overflow.
pub(crate) fn euclidean_norm(v: &Array1<f64>) -> f64 {
    if v.iter().any(|x| x.is_nan()) {
        return f64::NAN;
    }
    let scale = v.iter().fold(0.0_f64, |m, x| m.max(x.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return scale;
    }
    let sum: f64 = v.iter().map(|x| (x / scale).powi(2)).sum();
    scale * sum.sqrt()
}

/// Normalized negative gradient; zero when the gradient vanishes.
fn steepest_descent(gradient: &Array1<f64>) -> SearchDirection {
    let g_norm = euclidean_norm(gradient);
    if g_norm > 0.0 && g_norm.is_finite() {
        SearchDirection::new(-gradient / g_norm, true)
    } else {
        SearchDirection::new(Array1::zeros(gradient.len()), true)
    }
}

/// The LBFGS direction engine. Its only state is the memory capacity, which
/// the controller reconfigures at every level transition.
#[derive(Debug, Clone)]
pub struct LbfgsDirection {
    capacity: usize,
}

impl Default for LbfgsDirection {
    fn default() -> Self {
        Self::new(5)
    }
}

impl LbfgsDirection {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// Returns `memory` trimmed to the current capacity, oldest pairs first out.
    pub fn fit(&self, memory: &LbfgsMemory) -> LbfgsMemory {
        let mut fitted = memory.clone();
        fitted.retain_newest(self.capacity);
        fitted
    }

    /// Approximates `-H⁻¹ g` from the stored history.
    ///
    /// With an empty memory the result is `-g / ‖g‖`, so the line search's
    /// initial step length is the distance of its first trial point.
    pub fn compute_direction(
        &self,
        gradient: &Array1<f64>,
        memory: &LbfgsMemory,
    ) -> Result<SearchDirection, DirectionError> {
        let Some(newest) = memory.newest() else {
            return Ok(steepest_descent(gradient));
        };

        let y_norm = euclidean_norm(&newest.y);
        let gamma = newest.curvature() / y_norm / y_norm;
        if !gamma.is_finite() || gamma <= 0.0 {
            return Err(DirectionError::InvalidDiagonal { scale: gamma });
        }

        let mut q = gradient.clone();
        let mut alphas = Vec::with_capacity(memory.len());
        for pair in memory.iter().rev() {
            let a = pair.rho * pair.s.dot(&q);
            q.scaled_add(-a, &pair.y);
            alphas.push(a);
        }
        let mut r = q * gamma;
        for (pair, a) in memory.iter().zip(alphas.iter().rev()) {
            let b = pair.rho * pair.y.dot(&r);
            r.scaled_add(a - b, &pair.s);
        }
        r.mapv_inplace(|v| -v);

        let gdotd = gradient.dot(&r);
        let finite = r.iter().all(|v| v.is_finite());
        if !finite || (gdotd >= 0.0 && gradient.iter().any(|&v| v != 0.0)) {
            log::warn!(
                "[LBFGS Memory] Non-descent direction (gᵀd = {:.2e}); falling back to -g.",
                gdotd
            );
            return Ok(steepest_descent(gradient));
        }
        Ok(SearchDirection::new(r, false))
    }

    /// Returns a new memory holding `(s, y)` as its newest pair.
    ///
    /// The pair is only accepted when `s·y > 0`; otherwise the input memory is
    /// left as it was and [`DirectionError::InvalidCurvature`] is returned.
    pub fn update(
        &self,
        memory: &LbfgsMemory,
        position_delta: Array1<f64>,
        gradient_delta: Array1<f64>,
    ) -> Result<LbfgsMemory, DirectionError> {
        let sy = position_delta.dot(&gradient_delta);
        if !sy.is_finite() || sy <= 0.0 {
            log::warn!(
                "[LBFGS Memory] Rejecting curvature pair with sᵀy = {:.3e}.",
                sy
            );
            return Err(DirectionError::InvalidCurvature { curvature: sy });
        }
        let mut next = memory.clone();
        next.push(
            CurvaturePair {
                s: position_delta,
                y: gradient_delta,
                rho: 1.0 / sy,
            },
            self.capacity,
        );
        Ok(next)
    }
}
