//! The ordered history of tempering stages held by the coordinator.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SmcError};
use crate::particle::{Params, Particle};
use crate::step::SmcStep;

/// Sequence of [`SmcStep`] snapshots, index = stage number starting at 0.
///
/// The chain is append-only; the only way to remove stages is
/// [`ParticleChain::restart_from`], used when resuming a checkpointed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticleChain {
    steps: Vec<SmcStep>,
}

impl ParticleChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a copy of `step` as the newest stage.
    pub fn append(&mut self, step: &SmcStep) {
        self.steps.push(step.copy());
    }

    pub fn get_num_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[SmcStep] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<SmcStep> {
        self.steps
    }

    pub fn get_step(&self, index: usize) -> Option<&SmcStep> {
        self.steps.get(index)
    }

    pub fn last_step(&self) -> Option<&SmcStep> {
        self.steps.last()
    }

    /// Particles of stage `index`, or of the latest stage when `index` is `None`.
    pub fn get_particles(&self, index: Option<usize>) -> &[Particle] {
        self.select(index).map(SmcStep::particles).unwrap_or(&[])
    }

    pub fn get_weights(&self, index: Option<usize>) -> Vec<f64> {
        self.select(index).map(SmcStep::get_weights).unwrap_or_default()
    }

    pub fn get_log_likes(&self, index: Option<usize>) -> Vec<f64> {
        self.select(index).map(SmcStep::get_log_likes).unwrap_or_default()
    }

    /// Temperatures of the stored stages, in order.
    pub fn temperatures(&self) -> Vec<f64> {
        self.steps.iter().map(SmcStep::temperature).collect()
    }

    /// Weighted parameter means of every stage.
    pub fn get_means(&self) -> Vec<Params> {
        self.steps.iter().map(SmcStep::get_mean).collect()
    }

    /// Truncates the chain to stages `0..=index` and returns the population to resume from.
    ///
    /// Fails with a value error if `index` is negative or not a stored stage; the chain is
    /// left unchanged in that case.
    pub fn restart_from(&mut self, index: i64) -> Result<&SmcStep> {
        let stored = self.steps.len();
        let valid = usize::try_from(index).ok().filter(|i| *i < stored);
        let Some(index) = valid else {
            return Err(SmcError::value_error(
                "restart stage",
                format!("{index} is outside the {stored} stored stages"),
            ));
        };
        self.steps.truncate(index + 1);
        Ok(&self.steps[index])
    }

    fn select(&self, index: Option<usize>) -> Option<&SmcStep> {
        match index {
            Some(i) => self.steps.get(i),
            None => self.steps.last(),
        }
    }
}
