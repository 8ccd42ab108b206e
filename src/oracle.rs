use ndarray::Array1;

use crate::error::MetricError;

/// Value and gradient of the cost at one position.
pub type Evaluation = (f64, Array1<f64>);

/// The value+gradient oracle the optimizer minimizes.
///
/// Any closure `FnMut(&Array1<f64>) -> Result<(f64, Array1<f64>), MetricError>`
/// implements this trait.
pub trait CostOracle {
    /// Evaluates the cost and its gradient at `position`.
    fn evaluate(&mut self, position: &Array1<f64>) -> Result<Evaluation, MetricError>;

    /// Draws a fresh sample set for stochastic metrics.
    ///
    /// Called before the re-evaluation that follows each accepted step when
    /// `NewSamplesEveryIteration` is enabled. Deterministic costs keep the
    /// default, which does nothing.
    fn select_new_samples(&mut self) {}
}

impl<F> CostOracle for F
where
    F: FnMut(&Array1<f64>) -> Result<Evaluation, MetricError>,
{
    fn evaluate(&mut self, position: &Array1<f64>) -> Result<Evaluation, MetricError> {
        (*self)(position)
    }
}

// Shape check only; non-finite output is left to the caller.
pub(crate) fn sized_evaluate<O>(
    oracle: &mut O,
    position: &Array1<f64>,
) -> Result<Evaluation, MetricError>
where
    O: CostOracle + ?Sized,
{
    let (value, gradient) = oracle.evaluate(position)?;
    if gradient.len() != position.len() {
        return Err(MetricError::GradientLength {
            expected: position.len(),
            found: gradient.len(),
        });
    }
    Ok((value, gradient))
}

/// Evaluates the oracle and rejects outputs the optimizer cannot use: a
/// gradient of the wrong length, or a non-finite value or gradient.
pub(crate) fn checked_evaluate<O>(
    oracle: &mut O,
    position: &Array1<f64>,
) -> Result<Evaluation, MetricError>
where
    O: CostOracle + ?Sized,
{
    let (value, gradient) = sized_evaluate(oracle, position)?;
    if !value.is_finite() {
        return Err(MetricError::NonFinite { quantity: "value" });
    }
    if gradient.iter().any(|v| !v.is_finite()) {
        return Err(MetricError::NonFinite {
            quantity: "gradient",
        });
    }
    Ok((value, gradient))
}

#[cfg(test)]
mod tests {
    use super::{CostOracle, checked_evaluate};
    use crate::error::MetricError;
    use ndarray::{Array1, array};

    #[test]
    fn test_closure_is_an_oracle() {
        let mut oracle = |x: &Array1<f64>| -> Result<(f64, Array1<f64>), MetricError> {
            Ok((x.dot(x), 2.0 * x))
        };
        let (value, gradient) = oracle.evaluate(&array![1.0, 2.0]).unwrap();
        assert_eq!(value, 5.0);
        assert_eq!(gradient, array![2.0, 4.0]);
    }

    #[test]
    fn test_checked_evaluate_flags_non_finite_output() {
        let mut oracle = |x: &Array1<f64>| -> Result<(f64, Array1<f64>), MetricError> {
            Ok((f64::NAN, x.clone()))
        };
        assert_eq!(
            checked_evaluate(&mut oracle, &array![1.0]),
            Err(MetricError::NonFinite { quantity: "value" })
        );

        let mut oracle = |x: &Array1<f64>| -> Result<(f64, Array1<f64>), MetricError> {
            Ok((x[0], array![f64::INFINITY]))
        };
        assert_eq!(
            checked_evaluate(&mut oracle, &array![1.0]),
            Err(MetricError::NonFinite {
                quantity: "gradient"
            })
        );
    }

    #[test]
    fn test_checked_evaluate_flags_gradient_length() {
        let mut oracle = |x: &Array1<f64>| -> Result<(f64, Array1<f64>), MetricError> {
            Ok((x.sum(), array![1.0]))
        };
        assert_eq!(
            checked_evaluate(&mut oracle, &array![1.0, 2.0]),
            Err(MetricError::GradientLength {
                expected: 2,
                found: 1
            })
        );
    }
}
