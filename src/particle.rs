//! A single weighted sample of the parameter vector.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered mapping from parameter name to value.
pub type Params = IndexMap<String, f64>;

/// One weighted parameter sample.
///
/// Only the log-weight is stored; [`Particle::weight`] is derived from it, so the two
/// can never disagree. `log_like` is the *untempered* log-likelihood of the observed data;
/// the tempered value at temperature `t` is `t * log_like`.
///
/// Particles are values: reweighting and mutation return new particles instead of
/// changing an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    params: Params,
    log_weight: f64,
    log_like: f64,
}

impl Particle {
    pub fn new(params: Params, log_weight: f64, log_like: f64) -> Self {
        Self {
            params,
            log_weight,
            log_like,
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<f64> {
        self.params.get(name).copied()
    }

    pub fn log_weight(&self) -> f64 {
        self.log_weight
    }

    pub fn weight(&self) -> f64 {
        self.log_weight.exp()
    }

    pub fn log_like(&self) -> f64 {
        self.log_like
    }

    /// Same parameters and likelihood, new log-weight.
    pub fn with_log_weight(&self, log_weight: f64) -> Self {
        Self {
            params: self.params.clone(),
            log_weight,
            log_like: self.log_like,
        }
    }

    /// Same weight, new parameters and likelihood (an accepted mutation move).
    pub fn with_state(&self, params: Params, log_like: f64) -> Self {
        Self {
            params,
            log_weight: self.log_weight,
            log_like,
        }
    }

    /// Parameter values in the particle's own order.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.params.values().copied()
    }

    pub(crate) fn has_same_names(&self, other: &Particle) -> bool {
        self.params.len() == other.params.len()
            && self.params.keys().zip(other.params.keys()).all(|(a, b)| a == b)
    }
}

impl fmt::Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "params = {{")?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "'{name}': {value}")?;
        }
        write!(
            f,
            "}}, weight = {}, log_weight = {}, log_like = {}",
            self.weight(),
            self.log_weight,
            self.log_like
        )
    }
}
