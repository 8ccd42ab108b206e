//! A bounded one-dimensional search enforcing the strong Wolfe conditions.
//!
//! The search follows the structure of Algorithms 3.5 and 3.6 in Nocedal &
//! Wright: an expansion phase that doubles the trial step until the minimum
//! is bracketed, followed by a zoom phase that refines the bracket with
//! safeguarded cubic interpolation. Every trial costs one oracle evaluation
//! and counts as one inner iteration against `MaximumNumberOfLineSearchIterations`.

use ndarray::Array1;
use thiserror::Error;

use crate::config::LevelConfig;
use crate::error::MetricError;
use crate::lbfgs::euclidean_norm;
use crate::oracle::{CostOracle, sized_evaluate};

/// Relative width below which a zoom bracket is considered collapsed.
const MIN_BRACKET_WIDTH: f64 = 1e-14;

/// Ways a line search can end without an acceptable step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LineSearchFailure {
    #[error("no step satisfied the strong Wolfe conditions within {budget} iterations")]
    MaxIterations { budget: usize },
    #[error("search direction is not a descent direction (gᵀd = {derivative:.3e})")]
    NotDescent { derivative: f64 },
    #[error("the bracket collapsed around step {step_length:.3e} without satisfying the strong Wolfe conditions")]
    BracketCollapsed { step_length: f64 },
    #[error(transparent)]
    Metric(#[from] MetricError),
}

/// Live state of the search, refreshed at every inner iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct LineSearchDiagnostics {
    /// Inner iteration index; zero at the start notification.
    pub iteration: usize,
    pub value: f64,
    pub step_length: f64,
    pub directional_derivative: f64,
    pub gradient: Array1<f64>,
    /// Sufficient decrease (first Wolfe condition) holds at the current step.
    pub sufficient_decrease: bool,
    /// Strong curvature (second Wolfe condition) holds at the current step.
    pub curvature: bool,
}

impl Default for LineSearchDiagnostics {
    fn default() -> Self {
        Self {
            iteration: 0,
            value: 0.0,
            step_length: 0.0,
            directional_derivative: 0.0,
            gradient: Array1::zeros(0),
            sufficient_decrease: false,
            curvature: false,
        }
    }
}

impl LineSearchDiagnostics {
    pub fn gradient_norm(&self) -> f64 {
        euclidean_norm(&self.gradient)
    }
}

/// Notification interface handed to [`WolfeLineSearch::search`].
///
/// Both callbacks receive the search itself so the receiver can read the live
/// diagnostics and the current direction.
pub trait LineSearchEvents {
    fn on_search_start(&mut self, search: &WolfeLineSearch);
    fn on_search_iteration(&mut self, search: &WolfeLineSearch);
}

impl LineSearchEvents for () {
    fn on_search_start(&mut self, _: &WolfeLineSearch) {}
    fn on_search_iteration(&mut self, _: &WolfeLineSearch) {}
}

/// An accepted step.
#[derive(Debug, Clone)]
pub struct LineSearchOutcome {
    pub step_length: f64,
    pub position: Array1<f64>,
    pub value: f64,
    pub gradient: Array1<f64>,
    pub directional_derivative: f64,
    pub sufficient_decrease: bool,
    pub curvature: bool,
    /// Number of oracle evaluations spent.
    pub iterations: usize,
}

// One end of a bracket along the line.
#[derive(Debug, Clone, Copy)]
struct Endpoint {
    alpha: f64,
    f: f64,
    dphi: f64,
    deriv_known: bool,
}

/// Strong Wolfe line search. Created once by the controller and reconfigured
/// at every level transition.
#[derive(Debug, Clone)]
pub struct WolfeLineSearch {
    max_iterations: usize,
    initial_step_length: f64,
    c1: f64,
    c2: f64,
    max_step_length: f64,
    direction: Array1<f64>,
    diagnostics: LineSearchDiagnostics,
}

impl Default for WolfeLineSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl WolfeLineSearch {
    pub fn new() -> Self {
        let defaults = LevelConfig::default();
        let mut search = Self {
            max_iterations: 0,
            initial_step_length: 0.0,
            c1: 0.0,
            c2: 0.0,
            max_step_length: 1e20,
            direction: Array1::zeros(0),
            diagnostics: LineSearchDiagnostics::default(),
        };
        search.configure(&defaults);
        search
    }

    /// Applies the line-search fields of a level configuration.
    ///
    /// Diagnostics from an earlier level are cleared.
    pub fn configure(&mut self, config: &LevelConfig) {
        self.max_iterations = config.max_line_search_iterations;
        self.initial_step_length = config.initial_step_length;
        self.c1 = config.line_search_value_tolerance;
        self.c2 = config.line_search_gradient_tolerance;
        self.direction = Array1::zeros(0);
        self.diagnostics = LineSearchDiagnostics::default();
    }

    /// Upper bound on trial steps during expansion (default: 1e20).
    pub fn with_max_step_length(mut self, max_step_length: f64) -> Self {
        if max_step_length.is_finite() && max_step_length > 0.0 {
            self.max_step_length = max_step_length;
        }
        self
    }

    pub fn max_step_length(&self) -> f64 {
        self.max_step_length
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn initial_step_length(&self) -> f64 {
        self.initial_step_length
    }

    /// The `(c1, c2)` pair in use.
    pub fn wolfe_constants(&self) -> (f64, f64) {
        (self.c1, self.c2)
    }

    pub fn diagnostics(&self) -> &LineSearchDiagnostics {
        &self.diagnostics
    }

    /// Direction of the current (or last) search.
    pub fn direction(&self) -> &Array1<f64> {
        &self.direction
    }

    /// Searches along `d` from `x0`, where `f0`/`g0` are the cost and gradient
    /// at `x0`. On failure no step is returned.
    pub fn search<O>(
        &mut self,
        oracle: &mut O,
        x0: &Array1<f64>,
        d: &Array1<f64>,
        f0: f64,
        g0: &Array1<f64>,
        events: &mut dyn LineSearchEvents,
    ) -> Result<LineSearchOutcome, LineSearchFailure>
    where
        O: CostOracle + ?Sized,
    {
        let dphi0 = g0.dot(d);
        self.direction = d.clone();
        self.diagnostics = LineSearchDiagnostics {
            iteration: 0,
            value: f0,
            step_length: 0.0,
            directional_derivative: dphi0,
            gradient: g0.clone(),
            sufficient_decrease: false,
            curvature: false,
        };
        if !(dphi0 < 0.0) {
            log::warn!(
                "[LBFGS Wolfe] Non-descent direction detected (gᵀd = {:.2e} >= 0).",
                dphi0
            );
            return Err(LineSearchFailure::NotDescent { derivative: dphi0 });
        }
        events.on_search_start(self);

        let origin = Endpoint {
            alpha: 0.0,
            f: f0,
            dphi: dphi0,
            deriv_known: true,
        };
        let mut prev = origin;
        let mut alpha = self.initial_step_length.min(self.max_step_length);
        // Smallest step known to produce a non-finite cost.
        let mut alpha_wall = f64::INFINITY;
        let mut evals = 0;

        let (mut lo, mut hi) = loop {
            if evals >= self.max_iterations {
                return Err(self.exhausted());
            }
            let trial = self.try_step(oracle, x0, d, alpha, f0, dphi0, &mut evals)?;
            events.on_search_iteration(self);
            let Some((f, g, dphi)) = trial else {
                alpha_wall = alpha;
                alpha = 0.5 * (prev.alpha + alpha);
                continue;
            };
            if self.diagnostics.sufficient_decrease && self.diagnostics.curvature {
                return Ok(self.accept(x0, d, alpha, f, g, dphi, evals));
            }
            let current = Endpoint {
                alpha,
                f,
                dphi,
                deriv_known: true,
            };
            if !self.diagnostics.sufficient_decrease || (prev.alpha > 0.0 && f >= prev.f) {
                break (prev, current);
            }
            if dphi >= 0.0 {
                break (current, prev);
            }
            // The step is too short, expand the search interval.
            prev = current;
            alpha = if alpha_wall.is_finite() {
                0.5 * (alpha + alpha_wall)
            } else {
                (2.0 * alpha).min(self.max_step_length)
            };
            if alpha <= prev.alpha {
                return Err(LineSearchFailure::BracketCollapsed {
                    step_length: prev.alpha,
                });
            }
        };

        log::debug!(
            "[LBFGS Wolfe] Bracketed minimum between {:.3e} and {:.3e} after {} iterations.",
            lo.alpha,
            hi.alpha,
            evals
        );

        while evals < self.max_iterations {
            let width = (hi.alpha - lo.alpha).abs();
            if width <= MIN_BRACKET_WIDTH * lo.alpha.max(hi.alpha).max(1.0) {
                return Err(LineSearchFailure::BracketCollapsed {
                    step_length: lo.alpha,
                });
            }
            let alpha_j = interpolate(&lo, &hi);
            let trial = self.try_step(oracle, x0, d, alpha_j, f0, dphi0, &mut evals)?;
            events.on_search_iteration(self);
            let Some((f_j, g_j, dphi_j)) = trial else {
                // Shrink toward the finite end; derivative there is unknown.
                hi = Endpoint {
                    alpha: alpha_j,
                    f: f64::INFINITY,
                    dphi: 0.0,
                    deriv_known: false,
                };
                continue;
            };
            let current = Endpoint {
                alpha: alpha_j,
                f: f_j,
                dphi: dphi_j,
                deriv_known: true,
            };
            if !self.diagnostics.sufficient_decrease || f_j >= lo.f {
                hi = current;
                continue;
            }
            if self.diagnostics.curvature {
                return Ok(self.accept(x0, d, alpha_j, f_j, g_j, dphi_j, evals));
            }
            if dphi_j * (hi.alpha - lo.alpha) >= 0.0 {
                hi = lo;
            }
            lo = current;
        }
        Err(self.exhausted())
    }

    fn exhausted(&self) -> LineSearchFailure {
        log::debug!(
            "[LBFGS Wolfe] Line search failed: max iterations reached ({}).",
            self.max_iterations
        );
        LineSearchFailure::MaxIterations {
            budget: self.max_iterations,
        }
    }

    // Evaluates φ(alpha) and refreshes the diagnostics. `None` means the cost
    // or its gradient was non-finite at the trial point.
    #[allow(clippy::too_many_arguments, clippy::type_complexity)]
    fn try_step<O>(
        &mut self,
        oracle: &mut O,
        x0: &Array1<f64>,
        d: &Array1<f64>,
        alpha: f64,
        f0: f64,
        dphi0: f64,
        evals: &mut usize,
    ) -> Result<Option<(f64, Array1<f64>, f64)>, LineSearchFailure>
    where
        O: CostOracle + ?Sized,
    {
        let x = x0 + &(d * alpha);
        let (f, g) = sized_evaluate(oracle, &x)?;
        *evals += 1;
        let dphi = g.dot(d);
        let finite = f.is_finite() && dphi.is_finite() && g.iter().all(|v| v.is_finite());
        let sufficient_decrease = finite && f <= f0 + self.c1 * alpha * dphi0;
        let curvature = finite && dphi.abs() <= self.c2 * dphi0.abs();
        self.diagnostics = LineSearchDiagnostics {
            iteration: *evals,
            value: f,
            step_length: alpha,
            directional_derivative: dphi,
            gradient: g.clone(),
            sufficient_decrease,
            curvature,
        };
        if finite {
            Ok(Some((f, g, dphi)))
        } else {
            log::debug!(
                "[LBFGS Wolfe] Non-finite cost at step {:.3e}; shrinking.",
                alpha
            );
            Ok(None)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn accept(
        &self,
        x0: &Array1<f64>,
        d: &Array1<f64>,
        alpha: f64,
        f: f64,
        g: Array1<f64>,
        dphi: f64,
        evals: usize,
    ) -> LineSearchOutcome {
        LineSearchOutcome {
            step_length: alpha,
            position: x0 + &(d * alpha),
            value: f,
            gradient: g,
            directional_derivative: dphi,
            sufficient_decrease: true,
            curvature: true,
            iterations: evals,
        }
    }
}

/// Picks the next zoom trial inside the bracket: the minimizer of the cubic
/// through both endpoints when it is well inside, otherwise the midpoint.
fn interpolate(lo: &Endpoint, hi: &Endpoint) -> f64 {
    let (a, b) = if lo.alpha <= hi.alpha { (lo, hi) } else { (hi, lo) };
    let mid = 0.5 * (a.alpha + b.alpha);
    let width = b.alpha - a.alpha;
    if !(a.deriv_known && b.deriv_known && a.f.is_finite() && b.f.is_finite()) {
        return mid;
    }
    let d1 = a.dphi + b.dphi - 3.0 * (b.f - a.f) / width;
    let d2_sq = d1 * d1 - a.dphi * b.dphi;
    if !(d2_sq >= 0.0 && d2_sq.is_finite()) {
        return mid;
    }
    let d2 = d2_sq.sqrt();
    let trial = b.alpha - width * (b.dphi + d2 - d1) / (b.dphi - a.dphi + 2.0 * d2);
    // Keep the trial away from the endpoints so the bracket keeps shrinking.
    let margin = 0.1 * width;
    if !trial.is_finite() || trial < a.alpha + margin || trial > b.alpha - margin {
        mid
    } else {
        trial
    }
}

#[cfg(test)]
mod tests {
    use super::{LineSearchEvents, LineSearchFailure, WolfeLineSearch};
    use crate::config::LevelConfig;
    use crate::error::MetricError;
    use ndarray::{Array1, array};
    use spectral::prelude::*;

    type OracleResult = Result<(f64, Array1<f64>), MetricError>;

    fn shifted_quadratic(x: &Array1<f64>) -> OracleResult {
        Ok(((x[0] - 3.0).powi(2), array![2.0 * (x[0] - 3.0)]))
    }

    fn rosenbrock(x: &Array1<f64>) -> OracleResult {
        let a = 1.0;
        let b = 100.0;
        let f = (a - x[0]).powi(2) + b * (x[1] - x[0].powi(2)).powi(2);
        let g = array![
            -2.0 * (a - x[0]) - 4.0 * b * (x[1] - x[0].powi(2)) * x[0],
            2.0 * b * (x[1] - x[0].powi(2))
        ];
        Ok((f, g))
    }

    // A quadratic with a wall of infinite cost beyond x = 70.
    fn wall_with_minimum(x: &Array1<f64>) -> OracleResult {
        if x[0] > 70.0 {
            Ok((f64::INFINITY, array![f64::INFINITY]))
        } else {
            Ok(((x[0] - 60.0).powi(2), array![2.0 * (x[0] - 60.0)]))
        }
    }

    // A quadratic with a pocket of infinite cost around its minimum at x = 1.
    fn pocket_around_minimum(x: &Array1<f64>) -> OracleResult {
        if x[0] > 0.6 && x[0] < 1.5 {
            Ok((f64::INFINITY, array![f64::INFINITY]))
        } else {
            Ok(((x[0] - 1.0).powi(2), array![2.0 * (x[0] - 1.0)]))
        }
    }

    #[derive(Default)]
    struct CountingEvents {
        starts: usize,
        iterations: Vec<usize>,
        start_iteration: Option<usize>,
    }

    impl LineSearchEvents for CountingEvents {
        fn on_search_start(&mut self, search: &WolfeLineSearch) {
            self.starts += 1;
            self.start_iteration = Some(search.diagnostics().iteration);
        }
        fn on_search_iteration(&mut self, search: &WolfeLineSearch) {
            self.iterations.push(search.diagnostics().iteration);
        }
    }

    fn search_with(
        config: &LevelConfig,
        oracle: fn(&Array1<f64>) -> OracleResult,
        x0: Array1<f64>,
        d: Array1<f64>,
    ) -> (
        Result<super::LineSearchOutcome, LineSearchFailure>,
        CountingEvents,
    ) {
        let mut search = WolfeLineSearch::new();
        search.configure(config);
        let mut oracle = oracle;
        let (f0, g0) = oracle(&x0).unwrap();
        let mut events = CountingEvents::default();
        let result = search.search(&mut oracle, &x0, &d, f0, &g0, &mut events);
        (result, events)
    }

    #[test]
    fn test_unit_step_accepted_when_wolfe_holds() {
        let (result, events) = search_with(
            &LevelConfig::default(),
            shifted_quadratic,
            array![0.0],
            array![1.0],
        );
        let outcome = result.unwrap();
        assert_that!(&outcome.step_length).is_close_to(1.0, 1e-15);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(events.starts, 1);
        assert_eq!(events.start_iteration, Some(0));
        assert_eq!(events.iterations, vec![1]);
    }

    #[test]
    fn test_tight_curvature_expands_then_zooms() {
        let config = LevelConfig::default().with_wolfe_tolerances(1e-4, 0.1);
        let (result, events) =
            search_with(&config, shifted_quadratic, array![0.0], array![1.0]);
        let outcome = result.unwrap();
        assert_that!(&outcome.step_length).is_close_to(3.0, 0.3);
        assert_that!(&outcome.directional_derivative.abs()).is_less_than_or_equal_to(0.6);
        assert_eq!(events.iterations.len(), outcome.iterations);
        assert!(outcome.iterations > 1);
    }

    #[test]
    fn test_accepted_step_satisfies_strong_wolfe() {
        let starts = [
            (array![-1.2, 1.0], array![1.0, 0.0]),
            (array![-1.2, 1.0], array![0.5, -0.3]),
            (array![0.0, 0.0], array![1.0, 0.1]),
            (array![2.0, 2.0], array![-1.0, -3.0]),
        ];
        for c2 in [0.9, 0.5, 0.1] {
            let config = LevelConfig::default()
                .with_wolfe_tolerances(1e-4, c2)
                .with_max_line_search_iterations(40);
            for (x0, raw) in starts.iter() {
                let (f0, g0) = rosenbrock(x0).unwrap();
                // Point the trial direction downhill.
                let d = if g0.dot(raw) < 0.0 { raw.clone() } else { -raw };
                let mut search = WolfeLineSearch::new();
                search.configure(&config);
                let mut oracle = rosenbrock;
                let outcome = search.search(&mut oracle, x0, &d, f0, &g0, &mut ()).unwrap();
                assert!(outcome.sufficient_decrease && outcome.curvature);
                let dphi0 = g0.dot(&d);
                let (f1, g1) = rosenbrock(&(x0 + &(&d * outcome.step_length))).unwrap();
                assert_that!(&f1).is_less_than_or_equal_to(
                    f0 + 1e-4 * outcome.step_length * dphi0,
                );
                assert_that!(&g1.dot(&d).abs()).is_less_than_or_equal_to(c2 * dphi0.abs());
                let diag = search.diagnostics();
                assert!(diag.sufficient_decrease && diag.curvature);
            }
        }
    }

    #[test]
    fn test_exhausted_budget_is_reported() {
        let config = LevelConfig::default()
            .with_wolfe_tolerances(1e-4, 0.1)
            .with_max_line_search_iterations(1);
        let (result, events) =
            search_with(&config, shifted_quadratic, array![0.0], array![1.0]);
        assert_eq!(result.unwrap_err(), LineSearchFailure::MaxIterations { budget: 1 });
        assert_eq!(events.iterations, vec![1]);
    }

    #[test]
    fn test_ascent_direction_is_rejected() {
        let (result, events) = search_with(
            &LevelConfig::default(),
            shifted_quadratic,
            array![0.0],
            array![-1.0],
        );
        assert!(matches!(
            result,
            Err(LineSearchFailure::NotDescent { derivative }) if derivative > 0.0
        ));
        assert_eq!(events.starts, 0);
    }

    #[test]
    fn test_line_search_handles_inf() {
        let config = LevelConfig::default().with_initial_step_length(100.0);
        let (result, events) = search_with(&config, wall_with_minimum, array![10.0], array![1.0]);
        let outcome = result.unwrap();
        assert!(outcome.value.is_finite());
        assert_that!(&outcome.position[0]).is_less_than_or_equal_to(70.0);
        assert!(events.iterations.len() >= 2);
    }

    #[test]
    fn test_zoom_shrinks_away_from_infinite_trial() {
        let config = LevelConfig::default().with_initial_step_length(3.0);
        let (result, events) =
            search_with(&config, pocket_around_minimum, array![0.0], array![1.0]);
        let outcome = result.unwrap();
        // Expansion brackets [0, 3], the cubic lands on the pocket at 1,
        // and bisection of [0, 1] gives the accepted step.
        assert_eq!(events.iterations, vec![1, 2, 3]);
        assert_that!(&outcome.step_length).is_close_to(0.5, 1e-12);
        assert_that!(&outcome.value).is_close_to(0.25, 1e-12);
    }

    #[test]
    fn test_step_cap_collapses_expansion() {
        let config = LevelConfig::default().with_wolfe_tolerances(1e-4, 0.1);
        let mut search = WolfeLineSearch::new().with_max_step_length(1.5);
        search.configure(&config);
        assert_that!(&search.max_step_length()).is_close_to(1.5, 1e-15);
        let x0 = array![0.0];
        let (f0, g0) = shifted_quadratic(&x0).unwrap();
        let mut oracle = shifted_quadratic;
        let mut events = CountingEvents::default();
        let result = search.search(&mut oracle, &x0, &array![1.0], f0, &g0, &mut events);
        assert_eq!(
            result.unwrap_err(),
            LineSearchFailure::BracketCollapsed { step_length: 1.5 }
        );
        assert_eq!(events.iterations, vec![1, 2]);
        assert_that!(&search.diagnostics().step_length).is_close_to(1.5, 1e-15);
    }

    #[test]
    fn test_oracle_failure_propagates() {
        let mut calls = 0;
        let mut oracle = |x: &Array1<f64>| -> OracleResult {
            calls += 1;
            if calls > 1 {
                Err(MetricError::evaluation("sampler exhausted"))
            } else {
                shifted_quadratic(x)
            }
        };
        let x0 = array![0.0];
        let (f0, g0) = oracle(&x0).unwrap();
        let mut search = WolfeLineSearch::new();
        let result = search.search(&mut oracle, &x0, &array![1.0], f0, &g0, &mut ());
        assert_eq!(
            result.unwrap_err(),
            LineSearchFailure::Metric(MetricError::evaluation("sampler exhausted"))
        );
    }

    #[test]
    fn test_configure_applies_level_fields() {
        let mut search = WolfeLineSearch::new();
        let config = LevelConfig::default()
            .with_max_line_search_iterations(7)
            .with_initial_step_length(0.25)
            .with_wolfe_tolerances(1e-3, 0.5);
        search.configure(&config);
        assert_eq!(search.max_iterations(), 7);
        assert_that!(&search.initial_step_length()).is_close_to(0.25, 1e-15);
        assert_eq!(search.wolfe_constants(), (1e-3, 0.5));
    }
}
