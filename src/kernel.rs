/*!
# Mutation kernel

After reweighting (and possibly resampling) each particle is moved by a few steps of
random-walk Metropolis–Hastings targeting the tempered posterior

\[
\pi_\tau(\theta) \propto p(\theta)\, L(\theta)^\tau .
\]

Proposals are multivariate normal around the current position with covariance
`proposal_scale * Σ`, where `Σ` is the weighted covariance of the whole population. The
proposal is symmetric, so the acceptance ratio in log-space is

\[
\log \alpha = \left[\log p(\theta') + \tau \ell(\theta')\right]
            - \left[\log p(\theta) + \tau \ell(\theta)\right].
\]

A proposal outside the prior support has `log p = -∞` and is rejected without evaluating
the likelihood.

Each particle walks with its own RNG, seeded from the master seed, the stage and the
particle's global index, so the outcome depends neither on the rayon schedule nor on how
particles are split across ranks.
*/

use ndarray::prelude::*;
use rand::prelude::*;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::distributions::Prior;
use crate::error::Result;
use crate::likelihood::Likelihood;
use crate::particle::{Params, Particle};
use crate::seed::mutation_rng;
use crate::stats::cholesky;

/// `τ · ℓ`, with the convention that temperature zero ignores the likelihood entirely.
pub(crate) fn tempered(temperature: f64, log_like: f64) -> f64 {
    if temperature == 0.0 {
        0.0
    } else {
        temperature * log_like
    }
}

/// Proposal and acceptance counts of one mutation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationStats {
    pub proposed: usize,
    pub accepted: usize,
}

impl MutationStats {
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            proposed: self.proposed + other.proposed,
            accepted: self.accepted + other.accepted,
        }
    }
}

/// Random-walk Metropolis–Hastings moves applied to every particle of a stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MutationKernel {
    /// Metropolis–Hastings steps per particle and stage.
    pub num_mcmc_steps: usize,
    /// Multiplier applied to the population covariance.
    pub proposal_scale: f64,
}

impl MutationKernel {
    pub fn new(num_mcmc_steps: usize, proposal_scale: f64) -> Self {
        Self {
            num_mcmc_steps,
            proposal_scale,
        }
    }

    /**
    Moves every particle of `particles` at temperature `temperature`.

    `offset` is the global index of `particles[0]`; it selects the per-particle RNG
    streams. Log-weights are carried over unchanged, only positions and log-likelihoods
    move.

    # Examples

    ```rust
    use mini_smc::distributions::{Distribution, Prior};
    use mini_smc::kernel::MutationKernel;
    use mini_smc::particle::{Params, Particle};
    use ndarray::Array2;

    let prior = Prior::new().with("a", Distribution::uniform(-5.0, 5.0).unwrap());
    let like = |p: &Params| -> mini_smc::Result<f64> { Ok(-0.5 * p["a"] * p["a"]) };
    let start: Params = [("a".to_string(), 0.5)].into();
    let particles = vec![Particle::new(start, -(2f64.ln()), -0.125); 2];

    let kernel = MutationKernel::new(5, 1.0);
    let (moved, stats) = kernel
        .mutate(&like, &prior, &particles, 0, 1.0, &Array2::eye(1), 42, 1)
        .unwrap();
    assert_eq!(moved.len(), 2);
    assert_eq!(stats.proposed, 10);
    ```
    */
    #[allow(clippy::too_many_arguments)]
    pub fn mutate<L: Likelihood + ?Sized>(
        &self,
        likelihood: &L,
        prior: &Prior,
        particles: &[Particle],
        offset: usize,
        temperature: f64,
        covariance: &Array2<f64>,
        seed: u64,
        stage: usize,
    ) -> Result<(Vec<Particle>, MutationStats)> {
        let dim = covariance.nrows();
        let scaled = covariance * self.proposal_scale;
        let factor = cholesky(&scaled).unwrap_or_else(|| {
            log::warn!("scaled proposal covariance is not positive-definite; using identity");
            Array2::eye(dim)
        });

        let moved: Vec<(Particle, MutationStats)> = particles
            .par_iter()
            .enumerate()
            .map(|(i, particle)| -> Result<(Particle, MutationStats)> {
                let mut walk = ParticleWalk {
                    likelihood,
                    prior,
                    factor: &factor,
                    temperature,
                    current: particle.clone(),
                    current_lp: prior.log_density(particle.params()),
                    rng: mutation_rng(seed, stage, offset + i),
                    stats: MutationStats::default(),
                };
                for _ in 0..self.num_mcmc_steps {
                    walk.step()?;
                }
                Ok((walk.current, walk.stats))
            })
            .collect::<Result<_>>()?;

        let stats = moved
            .iter()
            .fold(MutationStats::default(), |acc, (_, s)| acc.merge(*s));
        log::debug!(
            "mutation at temperature {temperature:.4}: {}/{} proposals accepted",
            stats.accepted,
            stats.proposed
        );
        Ok((moved.into_iter().map(|(p, _)| p).collect(), stats))
    }
}

/// One particle's random walk during a mutation sweep.
struct ParticleWalk<'a, L: ?Sized> {
    likelihood: &'a L,
    prior: &'a Prior,
    /// Lower Cholesky factor of the proposal covariance.
    factor: &'a Array2<f64>,
    temperature: f64,
    current: Particle,
    current_lp: f64,
    rng: SmallRng,
    stats: MutationStats,
}

impl<L: Likelihood + ?Sized> ParticleWalk<'_, L> {
    fn propose(&mut self) -> Params {
        let z: Array1<f64> = (0..self.factor.ncols())
            .map(|_| self.rng.sample::<f64, _>(StandardNormal))
            .collect();
        let shift = self.factor.dot(&z);
        self.current
            .params()
            .iter()
            .zip(shift.iter())
            .map(|((name, value), dx)| (name.clone(), value + dx))
            .collect()
    }

    fn step(&mut self) -> Result<()> {
        let proposed = self.propose();
        self.stats.proposed += 1;
        let proposed_lp = self.prior.log_density(&proposed);
        if proposed_lp == f64::NEG_INFINITY {
            // Still consume the uniform so every step uses the same number of draws.
            let _: f64 = self.rng.gen();
            return Ok(());
        }
        let proposed_ll = self.likelihood.log_likelihood(&proposed)?;
        let log_accept_ratio = (proposed_lp + tempered(self.temperature, proposed_ll))
            - (self.current_lp + tempered(self.temperature, self.current.log_like()));
        let u: f64 = self.rng.gen();
        if log_accept_ratio > u.ln() {
            self.current = self.current.with_state(proposed, proposed_ll);
            self.current_lp = proposed_lp;
            self.stats.accepted += 1;
        }
        Ok(())
    }
}
