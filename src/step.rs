/*!
# Particle population at one tempering stage

[`SmcStep`] owns the particles of a single stage together with the stage temperature. It
provides weight normalization (log-sum-exp), the effective sample size, weighted moments
and systematic resampling.

```rust
use mini_smc::particle::{Params, Particle};
use mini_smc::step::SmcStep;

let params: Params = [("a".to_string(), 1.0), ("b".to_string(), 2.0)].into();
let mut step = SmcStep::new();
step.set_particles(vec![Particle::new(params, 0.0, -0.2); 4]).unwrap();

let weights = step.normalize_step_weights();
assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-10);
assert!((step.compute_ess() - 4.0).abs() < 1e-10);
```
*/

use ndarray::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SmcError};
use crate::particle::{Params, Particle};
use crate::stats::{finalize_covariance, log_sum_exp, weighted_scatter, weighted_sum};

/// A population of particles at one tempering stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmcStep {
    particles: Vec<Particle>,
    temperature: f64,
}

impl Default for SmcStep {
    fn default() -> Self {
        Self::new()
    }
}

impl SmcStep {
    /// An empty step at temperature zero.
    pub fn new() -> Self {
        Self {
            particles: Vec::new(),
            temperature: 0.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Builds a step from `particles`, checking that they share one parameter-name set.
    pub fn from_particles(particles: Vec<Particle>, temperature: f64) -> Result<Self> {
        let mut step = Self::new().with_temperature(temperature);
        step.set_particles(particles)?;
        Ok(step)
    }

    /// Replaces the population.
    ///
    /// Fails with a type error when the particles do not all carry the same ordered
    /// parameter names; the current population is left untouched in that case.
    pub fn set_particles(&mut self, particles: Vec<Particle>) -> Result<()> {
        if let Some(first) = particles.first() {
            if !particles.iter().all(|p| p.has_same_names(first)) {
                return Err(SmcError::type_error(
                    "particles",
                    "particles sharing one ordered parameter-name set",
                ));
            }
        }
        self.particles = particles;
        Ok(())
    }

    pub fn add_particle(&mut self, particle: Particle) -> Result<()> {
        if let Some(first) = self.particles.first() {
            if !particle.has_same_names(first) {
                return Err(SmcError::type_error(
                    "particle",
                    "a particle with the step's parameter names",
                ));
            }
        }
        self.particles.push(particle);
        Ok(())
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn into_particles(self) -> Vec<Particle> {
        self.particles
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn param_names(&self) -> Vec<&str> {
        self.particles
            .first()
            .map(|p| p.params().keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Deep copy of the step; particles of the copy never alias the original.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Shifts every log-weight by the log-sum-exp of the population so that the weights
    /// sum to one. Normalizing twice is a no-op up to rounding.
    pub fn normalize_step_log_weights(&mut self) {
        if self.particles.is_empty() {
            return;
        }
        let log_norm = log_sum_exp(&self.get_log_weights());
        self.shift_log_weights(log_norm);
    }

    /// Normalizes the population (see [`SmcStep::normalize_step_log_weights`]) and returns
    /// the normalized weights.
    pub fn normalize_step_weights(&mut self) -> Vec<f64> {
        self.normalize_step_log_weights();
        self.get_weights()
    }

    /// Subtracts `log_norm` from every log-weight. A non-finite normalizer means no particle
    /// carries any weight; the population is then reset to uniform weights.
    pub(crate) fn shift_log_weights(&mut self, log_norm: f64) {
        if !log_norm.is_finite() {
            log::warn!("all particle weights vanished (log normalizer {log_norm}); using uniform weights");
            self.fill_log_weights(-(self.particles.len() as f64).ln());
            return;
        }
        self.particles = self
            .particles
            .iter()
            .map(|p| p.with_log_weight(p.log_weight() - log_norm))
            .collect();
    }

    /// Gives every particle the same log-weight.
    pub(crate) fn fill_log_weights(&mut self, log_weight: f64) {
        self.particles = self
            .particles
            .iter()
            .map(|p| p.with_log_weight(log_weight))
            .collect();
    }

    /// Weights normalized to sum to one, without modifying the step.
    fn normalized_weights(&self) -> Array1<f64> {
        normalized_weights(&self.get_log_weights())
    }

    /// Effective sample size `1 / Σ w²` of the normalized weights.
    ///
    /// Lies in `[1, N]`, equals `N` for uniform weights and `0` for an empty step.
    pub fn compute_ess(&self) -> f64 {
        effective_sample_size(&self.get_log_weights())
    }

    /// Particle values as an `N × d` matrix, columns in parameter order.
    pub fn param_matrix(&self) -> Array2<f64> {
        let dim = self.param_names().len();
        let mut matrix = Array2::zeros((self.particles.len(), dim));
        for (mut row, particle) in matrix.rows_mut().into_iter().zip(&self.particles) {
            for (slot, value) in row.iter_mut().zip(particle.values()) {
                *slot = value;
            }
        }
        matrix
    }

    /// Weighted mean of every parameter.
    pub fn get_mean(&self) -> Params {
        let names = self.param_names();
        if names.is_empty() {
            return Params::new();
        }
        let mean = weighted_sum(self.param_matrix().view(), self.normalized_weights().view());
        names
            .into_iter()
            .map(String::from)
            .zip(mean.iter().copied())
            .collect()
    }

    /// Weighted covariance of the parameters (unbiased for the weights).
    ///
    /// Falls back to the identity matrix when the estimate is not positive-definite, e.g.
    /// when every particle holds the same values.
    pub fn calculate_covariance(&self) -> Array2<f64> {
        self.weighted_moments().1
    }

    /// Weighted mean and covariance, both in parameter order.
    pub(crate) fn weighted_moments(&self) -> (Array1<f64>, Array2<f64>) {
        let weights = self.normalized_weights();
        let samples = self.param_matrix();
        let mean = weighted_sum(samples.view(), weights.view());
        let scatter = weighted_scatter(samples.view(), weights.view(), mean.view());
        let cov = finalize_covariance(scatter, weights.sum(), weights.dot(&weights));
        (mean, cov)
    }

    /// Systematic resampling with replacement.
    ///
    /// Draws a single uniform offset from `rng` and places `N` evenly spaced pointers on
    /// the cumulative normalized weights. The resulting population has the same size and
    /// uniform weights `1 / N`.
    pub fn resample<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        if self.particles.is_empty() {
            return;
        }
        let weights = self.normalized_weights();
        let indices = systematic_indices(&weights.to_vec(), rng.gen::<f64>());
        log::debug!(
            "resampled {} particles into {} distinct ancestors",
            indices.len(),
            count_distinct(&indices)
        );
        self.particles = resampled_population(&self.particles, &indices);
    }

    /// Values of one parameter across the population.
    pub fn get_params(&self, name: &str) -> Result<Array1<f64>> {
        self.particles
            .iter()
            .map(|p| p.param(name).ok_or_else(|| SmcError::key_error("params", name)))
            .collect()
    }

    pub fn get_param_dicts(&self) -> Vec<Params> {
        self.particles.iter().map(|p| p.params().clone()).collect()
    }

    /// Untempered likelihoods `exp(log_like)`.
    pub fn get_likes(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.log_like().exp()).collect()
    }

    pub fn get_log_likes(&self) -> Vec<f64> {
        self.particles.iter().map(Particle::log_like).collect()
    }

    pub fn get_log_weights(&self) -> Vec<f64> {
        self.particles.iter().map(Particle::log_weight).collect()
    }

    pub fn get_weights(&self) -> Vec<f64> {
        self.particles.iter().map(Particle::weight).collect()
    }

    /// Human-readable description of the particle at `index`.
    pub fn particle_info(&self, index: usize) -> Option<String> {
        let info = self.particles.get(index).map(|p| format!("particle {index}: {p}"));
        if let Some(text) = &info {
            log::debug!("{text}");
        }
        info
    }
}

/// Normalizes `log_weights` into weights summing to one; uniform when none carries weight.
pub(crate) fn normalized_weights(log_weights: &[f64]) -> Array1<f64> {
    let log_norm = log_sum_exp(log_weights);
    if !log_norm.is_finite() {
        let n = log_weights.len() as f64;
        return Array1::from_elem(log_weights.len(), 1.0 / n);
    }
    log_weights.iter().map(|lw| (lw - log_norm).exp()).collect()
}

/// `1 / Σ w²` of the normalized weights, `0` when there are none.
pub(crate) fn effective_sample_size(log_weights: &[f64]) -> f64 {
    if log_weights.is_empty() {
        return 0.0;
    }
    let weights = normalized_weights(log_weights);
    1.0 / weights.dot(&weights)
}

/// Ancestor indices chosen by systematic resampling.
///
/// `weights` must be normalized and `offset` drawn uniformly from `[0, 1)`. The pointer
/// for slot `i` is `(offset + i) / N`.
pub fn systematic_indices(weights: &[f64], offset: f64) -> Vec<usize> {
    let n = weights.len();
    let mut indices = Vec::with_capacity(n);
    let mut cumulative = weights.first().copied().unwrap_or(0.0);
    let mut j = 0;
    for i in 0..n {
        let pointer = (offset + i as f64) / n as f64;
        while cumulative <= pointer && j + 1 < n {
            j += 1;
            cumulative += weights[j];
        }
        indices.push(j);
    }
    indices
}

/// Copies the chosen ancestors and resets every weight to `1 / N`.
pub(crate) fn resampled_population(particles: &[Particle], indices: &[usize]) -> Vec<Particle> {
    let uniform = -(indices.len() as f64).ln();
    indices
        .iter()
        .map(|&i| particles[i].with_log_weight(uniform))
        .collect()
}

fn count_distinct(indices: &[usize]) -> usize {
    // Systematic indices are non-decreasing.
    indices.windows(2).filter(|w| w[0] != w[1]).count() + usize::from(!indices.is_empty())
}
