//! Log-likelihood of the observed data under a forward model.

use ndarray::Array1;
use std::f64::consts::PI;

use crate::error::{Result, SmcError};
use crate::model::ForwardModel;
use crate::particle::Params;

/// Untempered log-likelihood of the data for a parameter set.
///
/// The sampler applies the temperature itself (`t * log_likelihood`), so implementations
/// only ever see the full-data likelihood. Must return a finite value for parameters in
/// the prior support.
pub trait Likelihood: Sync {
    fn log_likelihood(&self, params: &Params) -> Result<f64>;
}

impl<F> Likelihood for F
where
    F: Fn(&Params) -> Result<f64> + Sync,
{
    fn log_likelihood(&self, params: &Params) -> Result<f64> {
        self(params)
    }
}

/// Independent Gaussian measurement noise with a fixed standard deviation.
#[derive(Debug, Clone)]
pub struct GaussianLikelihood<M> {
    model: M,
    data: Array1<f64>,
    std_dev: f64,
}

impl<M: ForwardModel> GaussianLikelihood<M> {
    /// Fails with a value error when `std_dev` is not a positive finite number or when
    /// `data` is empty.
    pub fn new(model: M, data: Vec<f64>, std_dev: f64) -> Result<Self> {
        if !(std_dev.is_finite() && std_dev > 0.0) {
            return Err(SmcError::value_error(
                "noise std_dev",
                format!("must be positive, got {std_dev}"),
            ));
        }
        if data.is_empty() {
            return Err(SmcError::value_error("data", "no observations"));
        }
        Ok(Self {
            model,
            data: Array1::from(data),
            std_dev,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn data(&self) -> &Array1<f64> {
        &self.data
    }

    pub fn std_dev(&self) -> f64 {
        self.std_dev
    }

    /// Gaussian log-likelihood of the data given a model prediction.
    pub fn log_likelihood_of(&self, prediction: &[f64]) -> Result<f64> {
        if prediction.len() != self.data.len() {
            return Err(SmcError::Model(format!(
                "prediction has {} values but there are {} observations",
                prediction.len(),
                self.data.len()
            )));
        }
        let var = self.std_dev * self.std_dev;
        let n = self.data.len() as f64;
        let sq_err: f64 = self
            .data
            .iter()
            .zip(prediction)
            .map(|(d, m)| (d - m) * (d - m))
            .sum();
        Ok(-0.5 * n * (2.0 * PI * var).ln() - sq_err / (2.0 * var))
    }
}

impl<M: ForwardModel> Likelihood for GaussianLikelihood<M> {
    fn log_likelihood(&self, params: &Params) -> Result<f64> {
        let prediction = self.model.evaluate(params)?;
        self.log_likelihood_of(&prediction)
    }
}
