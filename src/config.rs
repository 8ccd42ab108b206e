//! Per-resolution-level configuration.
//!
//! Field names on the serde side follow the registration parameter-file
//! vocabulary so a schedule can be loaded straight from a JSON export of a
//! parameter file.

use serde::{Deserialize, Serialize};

use crate::error::OptimizerError;

/// Numeric settings applied to the optimizer for one resolution level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelConfig {
    /// Outer iteration budget (default: 100).
    #[serde(rename = "MaximumNumberOfIterations")]
    pub max_iterations: usize,
    /// Inner evaluation budget of a single line search (default: 20).
    #[serde(rename = "MaximumNumberOfLineSearchIterations")]
    pub max_line_search_iterations: usize,
    /// First trial step of every line search (default: 1.0).
    #[serde(rename = "StepLength")]
    pub initial_step_length: f64,
    /// Sufficient-decrease constant `c1` (default: 1e-4).
    #[serde(rename = "LineSearchValueTolerance")]
    pub line_search_value_tolerance: f64,
    /// Curvature constant `c2` (default: 0.9).
    #[serde(rename = "LineSearchGradientTolerance")]
    pub line_search_gradient_tolerance: f64,
    /// Convergence threshold on the gradient norm (default: 1e-6).
    #[serde(rename = "GradientMagnitudeTolerance")]
    pub gradient_magnitude_tolerance: f64,
    /// Number of curvature pairs kept in memory (default: 5).
    #[serde(rename = "LBFGSUpdateAccuracy")]
    pub update_accuracy: usize,
    /// Re-sample the cost and re-evaluate after every accepted step (default: false).
    #[serde(rename = "NewSamplesEveryIteration")]
    pub new_samples_every_iteration: bool,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_line_search_iterations: 20,
            initial_step_length: 1.0,
            line_search_value_tolerance: 1e-4, // Standard value for sufficient decrease
            line_search_gradient_tolerance: 0.9, // Standard value for curvature condition
            gradient_magnitude_tolerance: 1e-6,
            update_accuracy: 5,
            new_samples_every_iteration: false,
        }
    }
}

impl LevelConfig {
    /// Sets the outer iteration budget.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Sets the inner line-search budget.
    pub fn with_max_line_search_iterations(mut self, max_iterations: usize) -> Self {
        self.max_line_search_iterations = max_iterations;
        self
    }

    /// Sets the first trial step of the line search.
    pub fn with_initial_step_length(mut self, step_length: f64) -> Self {
        self.initial_step_length = step_length;
        self
    }

    /// Sets the strong Wolfe constants `c1` (value) and `c2` (gradient).
    pub fn with_wolfe_tolerances(mut self, c1: f64, c2: f64) -> Self {
        self.line_search_value_tolerance = c1;
        self.line_search_gradient_tolerance = c2;
        self
    }

    /// Sets the gradient-norm convergence threshold.
    pub fn with_gradient_magnitude_tolerance(mut self, tolerance: f64) -> Self {
        self.gradient_magnitude_tolerance = tolerance;
        self
    }

    /// Sets the LBFGS memory size.
    pub fn with_update_accuracy(mut self, pairs: usize) -> Self {
        self.update_accuracy = pairs;
        self
    }

    /// Enables re-sampling and re-evaluation after each accepted step.
    pub fn with_new_samples_every_iteration(mut self, enable: bool) -> Self {
        self.new_samples_every_iteration = enable;
        self
    }

    /// Checks the numeric ranges the line search and the controller rely on.
    pub fn validate(&self) -> Result<(), OptimizerError> {
        let c1 = self.line_search_value_tolerance;
        let c2 = self.line_search_gradient_tolerance;
        if !(c1.is_finite() && c1 > 0.0 && c1 < 1.0) {
            return Err(OptimizerError::InvalidConfig {
                field: "LineSearchValueTolerance",
                reason: "must lie in (0, 1)",
            });
        }
        if !(c2.is_finite() && c2 > c1 && c2 < 1.0) {
            return Err(OptimizerError::InvalidConfig {
                field: "LineSearchGradientTolerance",
                reason: "must lie in (LineSearchValueTolerance, 1)",
            });
        }
        if !(self.initial_step_length.is_finite() && self.initial_step_length > 0.0) {
            return Err(OptimizerError::InvalidConfig {
                field: "StepLength",
                reason: "must be finite and positive",
            });
        }
        if self.max_line_search_iterations == 0 {
            return Err(OptimizerError::InvalidConfig {
                field: "MaximumNumberOfLineSearchIterations",
                reason: "must be at least 1",
            });
        }
        let tol = self.gradient_magnitude_tolerance;
        if !(tol.is_finite() && tol >= 0.0) {
            return Err(OptimizerError::InvalidConfig {
                field: "GradientMagnitudeTolerance",
                reason: "must be finite and non-negative",
            });
        }
        Ok(())
    }
}

/// Supplies the configuration of each resolution level.
pub trait LevelConfigSource {
    fn level_config(&self, level: usize) -> LevelConfig;
}

/// A single configuration applies to every level.
impl LevelConfigSource for LevelConfig {
    fn level_config(&self, _: usize) -> LevelConfig {
        self.clone()
    }
}

/// An explicit per-level list of configurations.
///
/// Levels beyond the end of the list reuse the last entry; an empty schedule
/// yields [`LevelConfig::default`] everywhere.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LevelSchedule {
    levels: Vec<LevelConfig>,
}

impl LevelSchedule {
    pub fn new(levels: Vec<LevelConfig>) -> Self {
        Self { levels }
    }

    /// Number of explicitly configured levels.
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

impl LevelConfigSource for LevelSchedule {
    fn level_config(&self, level: usize) -> LevelConfig {
        match self.levels.get(level).or_else(|| self.levels.last()) {
            Some(config) => config.clone(),
            None => LevelConfig::default(),
        }
    }
}

impl FromIterator<LevelConfig> for LevelSchedule {
    fn from_iter<I: IntoIterator<Item = LevelConfig>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::{LevelConfig, LevelConfigSource, LevelSchedule};
    use crate::error::OptimizerError;
    use spectral::prelude::*;

    #[test]
    fn test_defaults_match_parameter_file_defaults() {
        let config = LevelConfig::default();
        assert_eq!(config.max_iterations, 100);
        assert_eq!(config.max_line_search_iterations, 20);
        assert_that!(&config.initial_step_length).is_close_to(1.0, 1e-15);
        assert_that!(&config.line_search_value_tolerance).is_close_to(1e-4, 1e-15);
        assert_that!(&config.line_search_gradient_tolerance).is_close_to(0.9, 1e-15);
        assert_that!(&config.gradient_magnitude_tolerance).is_close_to(1e-6, 1e-15);
        assert_eq!(config.update_accuracy, 5);
        assert!(!config.new_samples_every_iteration);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_wolfe_constants() {
        let config = LevelConfig::default().with_wolfe_tolerances(0.5, 0.1);
        assert!(matches!(
            config.validate(),
            Err(OptimizerError::InvalidConfig {
                field: "LineSearchGradientTolerance",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_line_search_budget() {
        let config = LevelConfig::default().with_max_line_search_iterations(0);
        assert!(config.validate().is_err());
        let config = LevelConfig::default().with_initial_step_length(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_schedule_reuses_last_level() {
        let schedule: LevelSchedule = [
            LevelConfig::default().with_max_iterations(10),
            LevelConfig::default().with_max_iterations(20),
        ]
        .into_iter()
        .collect();
        assert_eq!(schedule.level_config(0).max_iterations, 10);
        assert_eq!(schedule.level_config(1).max_iterations, 20);
        assert_eq!(schedule.level_config(5).max_iterations, 20);
        assert_eq!(LevelSchedule::default().level_config(3), LevelConfig::default());
    }

    #[test]
    fn test_schedule_loads_from_parameter_names() {
        let json = r#"[
            {"MaximumNumberOfIterations": 250, "StepLength": 0.5},
            {"LBFGSUpdateAccuracy": 10, "NewSamplesEveryIteration": true}
        ]"#;
        let schedule: LevelSchedule = serde_json::from_str(json).unwrap();
        assert_eq!(schedule.len(), 2);
        let first = schedule.level_config(0);
        assert_eq!(first.max_iterations, 250);
        assert_that!(&first.initial_step_length).is_close_to(0.5, 1e-15);
        assert_eq!(first.update_accuracy, 5);
        let second = schedule.level_config(1);
        assert_eq!(second.max_iterations, 100);
        assert_eq!(second.update_accuracy, 10);
        assert!(second.new_samples_every_iteration);
    }
}
