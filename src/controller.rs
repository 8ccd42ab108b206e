//! The outer iteration controller.
//!
//! [`QuasiNewtonLbfgs`] owns the parameter vector, the LBFGS memory, the
//! direction engine and the line search, and walks the state machine
//!
//! ```text
//! Idle -> LevelReady -> MainEvaluating -> DirectionComputed -> LineSearching
//!      -> StepAccepted -> (DirectionComputed | Stopped)
//! ```
//!
//! once per resolution level. Every termination is classified as a
//! [`StopCondition`]; only API misuse is reported as an error.

use ndarray::Array1;
use std::fmt;

use crate::config::{LevelConfig, LevelConfigSource};
use crate::error::{MetricError, OptimizerError};
use crate::lbfgs::{LbfgsDirection, LbfgsMemory, euclidean_norm};
use crate::line_search::{LineSearchFailure, WolfeLineSearch};
use crate::oracle::{CostOracle, Evaluation, checked_evaluate};
use crate::relay::{EventRelay, IterationObserver, IterationRecord, LineSearchStep, Phase};

/// Why a level stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopCondition {
    /// The cost oracle failed or returned non-finite output.
    MetricError,
    /// The line search exhausted its budget without a strong Wolfe step.
    LineSearchError,
    /// The outer iteration budget was used up.
    MaxIterationsReached,
    /// A curvature pair was rejected or the inverse-Hessian scaling was invalid.
    InvalidDiagonalMatrix,
    /// The gradient norm fell to the configured tolerance.
    GradientVanished,
    #[default]
    Unknown,
}

impl StopCondition {
    /// Fatal conditions end the whole run instead of moving to the next level.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StopCondition::MetricError
                | StopCondition::LineSearchError
                | StopCondition::InvalidDiagonalMatrix
                | StopCondition::Unknown
        )
    }
}

impl fmt::Display for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            StopCondition::MetricError => "Error in metric",
            StopCondition::LineSearchError => "Error in LineSearch",
            StopCondition::MaxIterationsReached => "Maximum number of iterations has been reached",
            StopCondition::InvalidDiagonalMatrix => "The diagonal matrix is invalid",
            StopCondition::GradientVanished => "The gradient magnitude has (nearly) vanished",
            StopCondition::Unknown => "Unknown",
        };
        f.write_str(message)
    }
}

/// Where the controller currently is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    LevelReady,
    MainEvaluating,
    DirectionComputed,
    LineSearching,
    StepAccepted,
    Stopped(StopCondition),
}

/// Per-level iteration bookkeeping. All vectors live in the optimizer's
/// (possibly scaled) coordinates.
#[derive(Debug, Clone, Default)]
pub struct IterationState {
    pub current_iteration: usize,
    pub current_value: f64,
    pub current_gradient: Array1<f64>,
    pub current_direction: Array1<f64>,
    pub search_direction_magnitude: f64,
    pub current_step_length: f64,
    pub in_line_search: bool,
    pub start_of_line_search: bool,
}

impl IterationState {
    pub fn gradient_norm(&self) -> f64 {
        euclidean_norm(&self.current_gradient)
    }

    fn reset_for_level(&mut self) {
        self.current_iteration = 0;
        self.search_direction_magnitude = 0.0;
        self.current_step_length = 0.0;
        self.in_line_search = false;
        self.start_of_line_search = false;
    }
}

/// Outcome of one resolution level.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelSummary {
    pub level: usize,
    pub stop_condition: StopCondition,
    /// Outer iterations performed in this level.
    pub iterations: usize,
    pub final_value: f64,
    pub final_gradient_norm: f64,
    /// Oracle evaluations spent in this level.
    pub evaluations: usize,
}

/// Outcome of a multi-level run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Final parameters in the caller's (unscaled) coordinates.
    pub final_point: Array1<f64>,
    pub final_value: f64,
    pub final_gradient_norm: f64,
    /// Stop condition of the last level that ran.
    pub stop_condition: StopCondition,
    /// Outer iterations summed over all levels.
    pub iterations: usize,
    pub evaluations: usize,
    pub levels: Vec<LevelSummary>,
}

// Presents the caller's oracle in the optimizer's scaled coordinates
// `y = x * s`: positions are divided by the scales before evaluation and the
// gradient is divided by them afterwards.
struct ScaledOracle<'a, O: ?Sized> {
    inner: &'a mut O,
    scales: Option<&'a Array1<f64>>,
    evaluations: usize,
}

impl<'a, O: CostOracle + ?Sized> ScaledOracle<'a, O> {
    fn new(inner: &'a mut O, scales: Option<&'a Array1<f64>>) -> Self {
        Self {
            inner,
            scales,
            evaluations: 0,
        }
    }
}

impl<O: CostOracle + ?Sized> CostOracle for ScaledOracle<'_, O> {
    fn evaluate(&mut self, position: &Array1<f64>) -> Result<Evaluation, MetricError> {
        self.evaluations += 1;
        let Some(scales) = self.scales else {
            return self.inner.evaluate(position);
        };
        let x = position / scales;
        let (value, gradient) = self.inner.evaluate(&x)?;
        if gradient.len() != scales.len() {
            return Err(MetricError::GradientLength {
                expected: scales.len(),
                found: gradient.len(),
            });
        }
        Ok((value, gradient / scales))
    }

    fn select_new_samples(&mut self) {
        self.inner.select_new_samples();
    }
}

/// Multi-resolution LBFGS optimizer with a strong Wolfe line search.
///
/// # Arguments
/// * `O` - the cost oracle, see [`CostOracle`].
/// * `S` - the iteration observer, see [`IterationObserver`]; `()` discards
///   the report.
pub struct QuasiNewtonLbfgs<O, S = ()> {
    oracle: O,
    observer: S,
    line_search: WolfeLineSearch,
    direction: LbfgsDirection,
    memory: LbfgsMemory,
    config: LevelConfig,
    scales: Option<Array1<f64>>,
    // Optimization variable, scaled when `scales` is set.
    position: Array1<f64>,
    state: IterationState,
    controller_state: ControllerState,
    stop_condition: StopCondition,
    curvature_rejected: bool,
    level: Option<usize>,
    total_iterations: usize,
    level_evaluations: usize,
    total_evaluations: usize,
}

impl<O> QuasiNewtonLbfgs<O, ()>
where
    O: CostOracle,
{
    /// Creates an optimizer that discards the iteration report.
    pub fn new(x0: Array1<f64>, oracle: O) -> Self {
        Self::with_observer(x0, oracle, ())
    }
}

impl<O, S> QuasiNewtonLbfgs<O, S>
where
    O: CostOracle,
    S: IterationObserver,
{
    /// Creates an optimizer reporting every iteration to `observer`.
    ///
    /// # Arguments
    /// * `x0` - The initial parameters.
    /// * `oracle` - The cost, returning `(value, gradient)` or a [`MetricError`].
    /// * `observer` - Receives one record per outer and inner iteration.
    pub fn with_observer(x0: Array1<f64>, oracle: O, observer: S) -> Self {
        Self {
            oracle,
            observer,
            line_search: WolfeLineSearch::new(),
            direction: LbfgsDirection::default(),
            memory: LbfgsMemory::new(),
            config: LevelConfig::default(),
            scales: None,
            position: x0,
            state: IterationState::default(),
            controller_state: ControllerState::Idle,
            stop_condition: StopCondition::Unknown,
            curvature_rejected: false,
            level: None,
            total_iterations: 0,
            level_evaluations: 0,
            total_evaluations: 0,
        }
    }

    /// Caps the trial steps the line search may take while expanding.
    /// Non-positive or non-finite caps are ignored.
    pub fn with_max_step_length(mut self, max_step_length: f64) -> Self {
        self.line_search = self.line_search.with_max_step_length(max_step_length);
        self
    }

    /// Sets per-parameter scales. Scaling is only active when the length
    /// matches the parameters and the scales differ from all ones.
    pub fn with_scales(mut self, scales: Array1<f64>) -> Result<Self, OptimizerError> {
        if self.level.is_some() {
            return Err(OptimizerError::ScalesAfterStart);
        }
        if let Some(index) = scales.iter().position(|v| !(v.is_finite() && *v > 0.0)) {
            return Err(OptimizerError::InvalidScales {
                index,
                value: scales[index],
            });
        }
        if scales.len() != self.position.len() {
            log::warn!(
                "[LBFGS] Ignoring {} scales for {} parameters.",
                scales.len(),
                self.position.len()
            );
            return Ok(self);
        }
        if scales.iter().any(|&s| s != 1.0) {
            self.position = &self.position * &scales;
            self.scales = Some(scales);
        }
        Ok(self)
    }

    pub fn scales_active(&self) -> bool {
        self.scales.is_some()
    }

    /// Current parameters in the caller's coordinates.
    pub fn current_position(&self) -> Array1<f64> {
        match &self.scales {
            Some(scales) => &self.position / scales,
            None => self.position.clone(),
        }
    }

    /// Current parameters in the optimizer's (scaled) coordinates.
    pub fn scaled_position(&self) -> &Array1<f64> {
        &self.position
    }

    pub fn current_value(&self) -> f64 {
        self.state.current_value
    }

    pub fn iteration_state(&self) -> &IterationState {
        &self.state
    }

    /// Current state of the level state machine.
    pub fn state(&self) -> ControllerState {
        self.controller_state
    }

    pub fn stop_condition(&self) -> StopCondition {
        self.stop_condition
    }

    /// Phase tag of the step being executed.
    pub fn phase(&self) -> Phase {
        if self.state.in_line_search {
            Phase::LineOptimizing
        } else {
            Phase::Main
        }
    }

    pub fn memory(&self) -> &LbfgsMemory {
        &self.memory
    }

    pub fn line_search(&self) -> &WolfeLineSearch {
        &self.line_search
    }

    pub fn level_config(&self) -> &LevelConfig {
        &self.config
    }

    pub fn current_level(&self) -> Option<usize> {
        self.level
    }

    /// Outer iterations summed over all levels run so far.
    pub fn total_iterations(&self) -> usize {
        self.total_iterations
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn observer(&self) -> &S {
        &self.observer
    }

    pub fn into_observer(self) -> S {
        self.observer
    }

    /// Applies `config` and arms the controller for `level`.
    ///
    /// The iteration counter, the direction magnitude and both line-search
    /// flags are reset; the LBFGS memory is kept but trimmed to the level's
    /// update accuracy.
    pub fn begin_level(&mut self, level: usize, config: LevelConfig) -> Result<(), OptimizerError> {
        if self.position.is_empty() {
            return Err(OptimizerError::EmptyParameters);
        }
        config.validate()?;
        self.line_search.configure(&config);
        self.direction.set_capacity(config.update_accuracy);
        self.memory = self.direction.fit(&self.memory);
        self.state.reset_for_level();
        self.stop_condition = StopCondition::Unknown;
        self.curvature_rejected = false;
        self.level_evaluations = 0;
        self.level = Some(level);
        self.controller_state = ControllerState::LevelReady;
        log::info!(
            "[LBFGS] Level {}: max_iter={}, max_ls_iter={}, step={:.3e}, c1={:.1e}, c2={:.2}, tol={:.1e}, m={}",
            level,
            config.max_iterations,
            config.max_line_search_iterations,
            config.initial_step_length,
            config.line_search_value_tolerance,
            config.line_search_gradient_tolerance,
            config.gradient_magnitude_tolerance,
            config.update_accuracy
        );
        self.observer.on_level_start(level, &config);
        self.config = config;
        Ok(())
    }

    /// Runs the armed level until it stops.
    pub fn run_level(&mut self) -> Result<LevelSummary, OptimizerError> {
        if self.controller_state != ControllerState::LevelReady {
            return Err(OptimizerError::LevelNotReady);
        }

        self.controller_state = ControllerState::MainEvaluating;
        let evaluated = {
            let mut oracle = ScaledOracle::new(&mut self.oracle, self.scales.as_ref());
            let result = checked_evaluate(&mut oracle, &self.position);
            self.level_evaluations += oracle.evaluations;
            result
        };
        match evaluated {
            Ok((value, gradient)) => {
                self.state.current_value = value;
                self.state.current_gradient = gradient;
            }
            Err(e) => {
                log::warn!("[LBFGS] Cost evaluation failed at level start: {e}");
                return Ok(self.stop(StopCondition::MetricError));
            }
        }
        self.report_main();
        if self.config.max_iterations == 0 {
            return Ok(self.stop(StopCondition::MaxIterationsReached));
        }
        if self.state.gradient_norm() <= self.config.gradient_magnitude_tolerance {
            return Ok(self.stop(StopCondition::GradientVanished));
        }

        loop {
            self.controller_state = ControllerState::DirectionComputed;
            if self.curvature_rejected {
                return Ok(self.stop(StopCondition::InvalidDiagonalMatrix));
            }
            let direction = match self
                .direction
                .compute_direction(&self.state.current_gradient, &self.memory)
            {
                Ok(direction) => direction,
                Err(e) => {
                    log::warn!("[LBFGS] {e}");
                    return Ok(self.stop(StopCondition::InvalidDiagonalMatrix));
                }
            };
            self.state.current_direction = direction.into_vector();

            self.controller_state = ControllerState::LineSearching;
            self.state.in_line_search = true;
            let x0 = self.position.clone();
            let d = self.state.current_direction.clone();
            let f0 = self.state.current_value;
            let g0 = self.state.current_gradient.clone();
            let searched = {
                let mut oracle = ScaledOracle::new(&mut self.oracle, self.scales.as_ref());
                let mut relay = EventRelay::new(&mut self.state, &mut self.observer);
                let result = self
                    .line_search
                    .search(&mut oracle, &x0, &d, f0, &g0, &mut relay);
                self.level_evaluations += oracle.evaluations;
                result
            };
            self.state.in_line_search = false;
            let outcome = match searched {
                Ok(outcome) => outcome,
                Err(LineSearchFailure::Metric(e)) => {
                    log::warn!("[LBFGS] Cost evaluation failed during line search: {e}");
                    return Ok(self.stop(StopCondition::MetricError));
                }
                Err(e) => {
                    log::warn!(
                        "[LBFGS] Line search failed at iteration {}: {e}",
                        self.state.current_iteration
                    );
                    return Ok(self.stop(StopCondition::LineSearchError));
                }
            };

            self.controller_state = ControllerState::StepAccepted;
            let (value, gradient, resample_failure) = if self.config.new_samples_every_iteration {
                let mut oracle = ScaledOracle::new(&mut self.oracle, self.scales.as_ref());
                oracle.select_new_samples();
                let result = checked_evaluate(&mut oracle, &outcome.position);
                self.level_evaluations += oracle.evaluations;
                match result {
                    Ok((value, gradient)) => (value, gradient, None),
                    Err(e) => (outcome.value, outcome.gradient.clone(), Some(e)),
                }
            } else {
                (outcome.value, outcome.gradient.clone(), None)
            };

            let s = &outcome.position - &x0;
            let y = &gradient - &g0;
            match self.direction.update(&self.memory, s, y) {
                Ok(memory) => self.memory = memory,
                Err(e) => {
                    log::warn!("[LBFGS] {e}; stopping before the next direction.");
                    self.curvature_rejected = true;
                }
            }
            self.position = outcome.position;
            self.state.current_value = value;
            self.state.current_gradient = gradient;
            self.state.current_step_length = outcome.step_length;
            self.state.current_iteration += 1;
            self.total_iterations += 1;

            if let Some(e) = resample_failure {
                log::warn!("[LBFGS] Cost re-evaluation after new samples failed: {e}");
                return Ok(self.stop(StopCondition::MetricError));
            }
            self.report_main();
            log::debug!(
                "[LBFGS] iter={}, f={:.6e}, ||g||={:.3e}, step={:.3e}, ls_iters={}",
                self.state.current_iteration,
                self.state.current_value,
                self.state.gradient_norm(),
                outcome.step_length,
                outcome.iterations
            );

            if self.state.current_iteration >= self.config.max_iterations {
                return Ok(self.stop(StopCondition::MaxIterationsReached));
            }
            if self.state.gradient_norm() <= self.config.gradient_magnitude_tolerance {
                return Ok(self.stop(StopCondition::GradientVanished));
            }
            // The accepted point's value and gradient are already known.
            self.controller_state = ControllerState::MainEvaluating;
        }
    }

    /// Runs `levels` resolution levels with configurations from `source`.
    ///
    /// Levels ending in a non-fatal condition hand over to the next level;
    /// the first fatal condition ends the run.
    pub fn optimize<C>(&mut self, source: &C, levels: usize) -> Result<RunSummary, OptimizerError>
    where
        C: LevelConfigSource + ?Sized,
    {
        if levels == 0 {
            return Err(OptimizerError::InvalidConfig {
                field: "NumberOfResolutions",
                reason: "must be at least 1",
            });
        }
        let mut summaries = Vec::with_capacity(levels);
        for level in 0..levels {
            self.begin_level(level, source.level_config(level))?;
            let summary = self.run_level()?;
            let fatal = summary.stop_condition.is_fatal();
            summaries.push(summary);
            if fatal {
                log::warn!("[LBFGS] Run aborted at level {level}: {}", self.stop_condition);
                break;
            }
        }
        log::info!("[LBFGS] Final metric value  = {}", self.state.current_value);
        Ok(RunSummary {
            final_point: self.current_position(),
            final_value: self.state.current_value,
            final_gradient_norm: self.state.gradient_norm(),
            stop_condition: self.stop_condition,
            iterations: self.total_iterations,
            evaluations: self.total_evaluations,
            levels: summaries,
        })
    }

    fn report_main(&mut self) {
        let diag = self.line_search.diagnostics();
        let record = IterationRecord {
            search_direction_number: self.state.current_iteration,
            line_search_iteration: LineSearchStep::Iteration(diag.iteration),
            metric_value: self.state.current_value,
            step_length: self.state.current_step_length,
            gradient_norm: self.state.gradient_norm(),
            search_direction_norm: self.state.search_direction_magnitude,
            directional_derivative: diag.directional_derivative,
            phase: Phase::Main,
            wolfe1: diag.sufficient_decrease,
            wolfe2: diag.curvature,
        };
        self.observer.on_iteration(&record);
    }

    fn stop(&mut self, condition: StopCondition) -> LevelSummary {
        self.stop_condition = condition;
        self.controller_state = ControllerState::Stopped(condition);
        self.total_evaluations += self.level_evaluations;
        let summary = LevelSummary {
            level: self.level.unwrap_or(0),
            stop_condition: condition,
            iterations: self.state.current_iteration,
            final_value: self.state.current_value,
            final_gradient_norm: self.state.gradient_norm(),
            evaluations: self.level_evaluations,
        };
        log::info!(
            "[LBFGS] Level {} stopped after {} iterations ({} evaluations): {}.",
            summary.level,
            summary.iterations,
            summary.evaluations,
            condition
        );
        self.observer.on_level_end(&summary);
        summary
    }
}
