use thiserror::Error;

/// Failure reported by a [`CostOracle`](crate::CostOracle) evaluation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricError {
    #[error("cost evaluation failed: {0}")]
    Evaluation(String),
    #[error("cost evaluation returned a non-finite {quantity}")]
    NonFinite {
        /// Either `"value"` or `"gradient"`.
        quantity: &'static str,
    },
    #[error("cost gradient has {found} components, expected {expected}")]
    GradientLength { expected: usize, found: usize },
}

impl MetricError {
    /// Convenience constructor for oracle implementations.
    pub fn evaluation(message: impl Into<String>) -> Self {
        MetricError::Evaluation(message.into())
    }
}

/// Errors caused by misuse of the optimizer API.
///
/// Termination of a level is never reported through this type; every stop
/// reason is carried by a [`StopCondition`](crate::StopCondition).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizerError {
    #[error("invalid level configuration: `{field}` {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: &'static str,
    },
    #[error("scales must be finite and strictly positive (component {index} is {value})")]
    InvalidScales { index: usize, value: f64 },
    #[error("scales must be set before the first resolution level starts")]
    ScalesAfterStart,
    #[error("no resolution level is active; call `begin_level` first")]
    LevelNotReady,
    #[error("the parameter vector is empty")]
    EmptyParameters,
}
