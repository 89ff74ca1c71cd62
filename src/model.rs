//! The forward-model contract: parameters in, predicted observables out.

use crate::error::{Result, SmcError};
use crate::particle::Params;

/// Maps a parameter set to predicted observables on a fixed measurement grid.
///
/// Implementations must be deterministic: identical parameters give identical predictions.
/// Models are evaluated concurrently from the rayon pool, hence the `Sync` bound.
pub trait ForwardModel: Sync {
    fn evaluate(&self, params: &Params) -> Result<Vec<f64>>;
}

/// Any infallible closure is a model.
impl<F> ForwardModel for F
where
    F: Fn(&Params) -> Vec<f64> + Sync,
{
    fn evaluate(&self, params: &Params) -> Result<Vec<f64>> {
        Ok(self(params))
    }
}

/// `y = a * x + b` evaluated on a fixed grid of `x` values.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    pub x: Vec<f64>,
    pub slope: String,
    pub intercept: String,
}

impl LinearModel {
    /// A linear model reading its slope from `"a"` and its intercept from `"b"`.
    pub fn new(x: Vec<f64>) -> Self {
        Self {
            x,
            slope: "a".to_string(),
            intercept: "b".to_string(),
        }
    }
}

impl ForwardModel for LinearModel {
    fn evaluate(&self, params: &Params) -> Result<Vec<f64>> {
        let lookup = |name: &str| {
            params
                .get(name)
                .copied()
                .ok_or_else(|| SmcError::key_error("params", name))
        };
        let a = lookup(&self.slope)?;
        let b = lookup(&self.intercept)?;
        Ok(self.x.iter().map(|x| a * x + b).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_models() {
        let model = |p: &Params| vec![p["a"] * 2.0];
        let params: Params = [("a".to_string(), 1.5)].into();
        assert_eq!(model.evaluate(&params).unwrap(), vec![3.0]);
    }

    #[test]
    fn linear_model_needs_both_params() {
        let model = LinearModel::new(vec![0.0, 1.0, 2.0]);
        let params: Params = [("a".to_string(), 2.0), ("b".to_string(), 1.0)].into();
        assert_eq!(model.evaluate(&params).unwrap(), vec![1.0, 3.0, 5.0]);
        let partial: Params = [("a".to_string(), 2.0)].into();
        assert!(model.evaluate(&partial).is_err());
    }
}
