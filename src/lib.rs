//! A multi-resolution LBFGS optimizer with a strong Wolfe line search.
//!
//! This crate minimizes a smooth cost given as a value+gradient oracle,
//! following the limited-memory quasi-Newton method and the line search of
//! "Numerical Optimization" by Nocedal & Wright (Algorithms 7.4, 3.5 and 3.6).
//! The optimization runs over one or more resolution levels; each level has
//! its own [`LevelConfig`], while the parameters and the curvature memory
//! carry over from one level to the next.
//!
//! # Features
//! - Two-loop recursion over a bounded FIFO of curvature pairs, scaled by
//!   `H0 = sᵀy / yᵀy`. Pairs with `sᵀy <= 0` are rejected.
//! - Strong Wolfe line search with step expansion and a safeguarded cubic zoom.
//! - Explicit stop conditions ([`StopCondition`]) instead of errors for every
//!   way a level can end.
//! - Per-iteration reporting through an [`IterationObserver`]; [`LogObserver`]
//!   writes the classic tab-separated iteration table through `log`.
//! - Optional per-parameter scales and per-iteration resampling for
//!   stochastic metrics ([`CostOracle::select_new_samples`]).
//!
//! ## Defaults (per level)
//! - `MaximumNumberOfIterations = 100`, `MaximumNumberOfLineSearchIterations = 20`.
//! - `StepLength = 1.0`, `c1 = 1e-4`, `c2 = 0.9`.
//! - `GradientMagnitudeTolerance = 1e-6`, `LBFGSUpdateAccuracy = 5`.
//!
//! # Example
//!
//! ```
//! use wolfe_lbfgs::{LevelConfig, MetricError, QuasiNewtonLbfgs, StopCondition};
//! use ndarray::{array, Array1};
//!
//! let sphere = |x: &Array1<f64>| -> Result<(f64, Array1<f64>), MetricError> {
//!     Ok((x.dot(x), 2.0 * x))
//! };
//!
//! let mut optimizer = QuasiNewtonLbfgs::new(array![5.0, 5.0], sphere);
//! let summary = optimizer
//!     .optimize(&LevelConfig::default().with_max_iterations(50), 1)
//!     .expect("valid configuration");
//!
//! assert_eq!(summary.stop_condition, StopCondition::GradientVanished);
//! assert!(summary.final_point.iter().all(|v| v.abs() < 1e-3));
//! ```

mod config;
mod controller;
mod error;
mod lbfgs;
mod line_search;
mod oracle;
mod relay;

pub use config::{LevelConfig, LevelConfigSource, LevelSchedule};
pub use controller::{
    ControllerState, IterationState, LevelSummary, QuasiNewtonLbfgs, RunSummary, StopCondition,
};
pub use error::{MetricError, OptimizerError};
pub use lbfgs::{CurvaturePair, DirectionError, LbfgsDirection, LbfgsMemory, SearchDirection};
pub use line_search::{
    LineSearchDiagnostics, LineSearchEvents, LineSearchFailure, LineSearchOutcome, WolfeLineSearch,
};
pub use oracle::{CostOracle, Evaluation};
pub use relay::{EventRelay, IterationObserver, IterationRecord, LineSearchStep, LogObserver, Phase};
