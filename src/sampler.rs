/*!
# Tempered SMC sampler

[`SmcSampler`] drives a whole run on one rank:

1. draw the rank's share of the initial population (from the prior, or from a proposal
   with importance weights),
2. for every temperature of the schedule: reweight, normalize, resample when the ESS is
   too low, mutate,
3. after every stage gather the population on the coordinator, append it to the chain and
   write a checkpoint if one is configured.

Every rank of a run calls [`SmcSampler::sample`] with the same configuration. The
coordinator's [`SmcOutput`] holds the chain; the other ranks only keep their final local
population.

```rust
use mini_smc::config::RunConfig;
use mini_smc::distributions::{Distribution, Prior};
use mini_smc::distributor::SingleProcess;
use mini_smc::likelihood::GaussianLikelihood;
use mini_smc::model::LinearModel;
use mini_smc::sampler::SmcSampler;

let x: Vec<f64> = (0..20).map(|i| i as f64).collect();
let data = x.iter().map(|x| 2.0 * x + 3.0).collect();
let likelihood = GaussianLikelihood::new(LinearModel::new(x), data, 0.5).unwrap();
let prior = Prior::new()
    .with("a", Distribution::uniform(0.0, 5.0).unwrap())
    .with("b", Distribution::uniform(0.0, 5.0).unwrap());

let sampler = SmcSampler::new(likelihood, prior, SingleProcess);
let output = sampler.sample(&RunConfig::new(64, 5, 2).with_seed(1)).unwrap();
let chain = output.chain.unwrap();
assert_eq!(chain.get_num_steps(), 5);
assert_eq!(chain.last_step().unwrap().temperature(), 1.0);
```
*/

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::chain::ParticleChain;
use crate::checkpoint::{BinaryFileStore, Checkpoint, CheckpointStore};
use crate::config::{RestartConfig, RunConfig};
use crate::distributions::{Prior, ProposalDistribution};
use crate::distributor::{
    agree, assemble, global_covariance, global_ess, global_normalize, global_resample,
    local_slice, partition, partition_offset, Communicator,
};
use crate::error::{Result, SmcError};
use crate::kernel::{tempered, MutationKernel};
use crate::likelihood::Likelihood;
use crate::particle::Particle;
use crate::role::{Coordinator, Role, RunLayout, StageSummary, Worker};
use crate::seed::{init_rng, resample_rng};
use crate::step::SmcStep;

/// Temperatures visited by a run with `num_stages` stages: `[1.0]` for a single stage,
/// otherwise `num_stages` evenly spaced values from `0.0` to `1.0`.
pub fn temperature_schedule(num_stages: usize) -> Vec<f64> {
    match num_stages {
        0 => Vec::new(),
        1 => vec![1.0],
        k => (0..k).map(|i| i as f64 / (k - 1) as f64).collect(),
    }
}

/// Index of the schedule entry the initial population is weighted to.
///
/// A proposal-drawn population is importance-weighted straight to the first non-zero
/// temperature, so the `0.0` entry is skipped.
pub fn start_index(schedule_len: usize, has_proposal: bool) -> usize {
    usize::from(has_proposal && schedule_len > 1)
}

/// Result of a run on one rank.
#[derive(Debug, Clone)]
pub struct SmcOutput {
    /// Every stage of the run; only the coordinator holds it.
    pub chain: Option<ParticleChain>,
    /// Diagnostics of the stages computed by this call, in order.
    pub summaries: Vec<StageSummary>,
    /// This rank's share of the final population.
    pub local: SmcStep,
}

impl SmcOutput {
    pub fn steps(&self) -> Option<&[SmcStep]> {
        self.chain.as_ref().map(ParticleChain::steps)
    }

    pub fn into_steps(self) -> Option<Vec<SmcStep>> {
        self.chain.map(ParticleChain::into_steps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SamplerState {
    Initializing,
    Resuming,
    Stepping { stage: usize },
    Checkpointing { stage: usize },
    Done,
}

/// What the coordinator sends every rank when resuming from a checkpoint.
#[derive(Serialize, Deserialize)]
struct ResumePoint {
    step: SmcStep,
    layout: RunLayout,
}

pub struct SmcSampler<L, C> {
    likelihood: L,
    prior: Prior,
    comm: C,
}

impl<L: Likelihood, C: Communicator> SmcSampler<L, C> {
    pub fn new(likelihood: L, prior: Prior, comm: C) -> Self {
        Self {
            likelihood,
            prior,
            comm,
        }
    }

    pub fn likelihood(&self) -> &L {
        &self.likelihood
    }

    pub fn prior(&self) -> &Prior {
        &self.prior
    }

    pub fn communicator(&self) -> &C {
        &self.comm
    }

    /// Runs the sampler. Collective: every rank must call it with the same `config`.
    pub fn sample(&self, config: &RunConfig) -> Result<SmcOutput> {
        config.validate(&self.prior)?;
        let mut state = SamplerState::Initializing;

        let (mut role, mut local, layout, first_stage) = match &config.restart {
            Some(restart) => {
                self.transition(&mut state, SamplerState::Resuming);
                self.resume(config, restart)?
            }
            None => self.start(config)?,
        };

        let mut summaries = Vec::new();
        if first_stage == 0 {
            let summary = StageSummary {
                stage: 0,
                temperature: local.temperature(),
                ess: global_ess(&self.comm, &local)?,
                resampled: false,
                acceptance_rate: 0.0,
            };
            self.record(config, role.as_mut(), &local, &summary, &mut state)?;
            summaries.push(summary);
        }

        let num_steps = layout.schedule.len() - layout.start_index;
        for stage in first_stage.max(1)..num_steps {
            self.transition(&mut state, SamplerState::Stepping { stage });
            let temperature = layout.schedule[layout.start_index + stage];
            let (next, summary) = self.advance(config, local, stage, temperature, layout.seed)?;
            local = next;
            self.record(config, role.as_mut(), &local, &summary, &mut state)?;
            summaries.push(summary);
        }

        self.transition(&mut state, SamplerState::Done);
        Ok(SmcOutput {
            chain: role.finish(),
            summaries,
            local,
        })
    }

    fn transition(&self, state: &mut SamplerState, next: SamplerState) {
        log::debug!("rank {}: {:?} -> {:?}", self.comm.rank(), state, next);
        *state = next;
    }

    fn make_role(
        &self,
        config: &RunConfig,
        layout: RunLayout,
        chain: ParticleChain,
    ) -> Box<dyn Role> {
        if !self.comm.is_coordinator() {
            return Box::new(Worker);
        }
        let store = config
            .checkpoint
            .as_ref()
            .map(|path| Box::new(BinaryFileStore::new(path)) as Box<dyn CheckpointStore>);
        let coordinator = Coordinator::resume(chain, layout, store);
        if config.progress {
            Box::new(coordinator.with_progress())
        } else {
            Box::new(coordinator)
        }
    }

    /// Builds the schedule and the initial population of a fresh run.
    fn start(&self, config: &RunConfig) -> Result<(Box<dyn Role>, SmcStep, RunLayout, usize)> {
        let proposal = match &config.proposal {
            Some(p) => Some(ProposalDistribution::new(&self.prior, &p.center, &p.scales)?),
            None => None,
        };
        // Every rank samples from the coordinator's proposal and follows its schedule.
        let proposal: Option<ProposalDistribution> = self.comm.broadcast(Some(&proposal))?;
        let schedule = temperature_schedule(config.num_stages);
        let layout = RunLayout {
            start_index: start_index(schedule.len(), proposal.is_some()),
            schedule,
            seed: config.seed,
        };
        let layout: RunLayout = self.comm.broadcast(Some(&layout))?;

        let local = self.initialize(config, &layout, proposal.as_ref())?;
        let role = self.make_role(config, layout.clone(), ParticleChain::new());
        Ok((role, local, layout, 0))
    }

    fn initialize(
        &self,
        config: &RunConfig,
        layout: &RunLayout,
        proposal: Option<&ProposalDistribution>,
    ) -> Result<SmcStep> {
        let (size, rank) = (self.comm.size(), self.comm.rank());
        let offset = partition_offset(config.num_particles, size, rank);
        let count = partition(config.num_particles, size)[rank];
        let temperature = layout.schedule[layout.start_index];
        let (likelihood, prior, seed) = (&self.likelihood, &self.prior, layout.seed);

        let drawn: Vec<Result<Particle>> = (offset..offset + count)
            .into_par_iter()
            .map(|index| draw_particle(likelihood, prior, proposal, seed, index, temperature))
            .collect();
        let particles = agree(&self.comm, drawn.into_iter().collect::<Result<Vec<_>>>())?;

        let mut step = SmcStep::from_particles(particles, temperature)?;
        global_normalize(&self.comm, &mut step)?;
        log::debug!(
            "rank {rank}: initialized particles {offset}..{} at temperature {temperature}",
            offset + count
        );
        Ok(step)
    }

    /// Loads the checkpoint on the coordinator and hands every rank its share of the
    /// population to resume from.
    fn resume(
        &self,
        config: &RunConfig,
        restart: &RestartConfig,
    ) -> Result<(Box<dyn Role>, SmcStep, RunLayout, usize)> {
        let loaded = if self.comm.is_coordinator() {
            Some(self.load_checkpoint(config, restart))
        } else {
            None
        };
        let loaded = agree(&self.comm, loaded.transpose())?;

        let point = loaded.as_ref().map(|(chain, layout)| ResumePoint {
            step: chain.last_step().cloned().unwrap_or_default(),
            layout: layout.clone(),
        });
        let point: ResumePoint = self.comm.broadcast(point.as_ref())?;
        let local = local_slice(&self.comm, point.step);

        let chain = loaded.map(|(chain, _)| chain).unwrap_or_default();
        // `validate` has rejected negative stages.
        let next_stage = restart.stage as usize + 1;
        log::info!(
            "resuming after stage {} at temperature {}",
            restart.stage,
            local.temperature()
        );
        let role = self.make_role(config, point.layout.clone(), chain);
        Ok((role, local, point.layout, next_stage))
    }

    fn load_checkpoint(
        &self,
        config: &RunConfig,
        restart: &RestartConfig,
    ) -> Result<(ParticleChain, RunLayout)> {
        let mut checkpoint = BinaryFileStore::new(&restart.checkpoint).load()?;
        let stored = checkpoint.chain.get_num_steps();
        if stored > 0 && checkpoint.schedule_index(stored - 1) >= checkpoint.schedule.len() {
            return Err(SmcError::Restart {
                stage: restart.stage,
                reason: format!(
                    "{stored} stored stages exceed the {} scheduled temperatures",
                    checkpoint.schedule.len().saturating_sub(checkpoint.start_index)
                ),
            });
        }
        let population = checkpoint.chain.restart_from(restart.stage)?.len();
        if population != config.num_particles {
            return Err(SmcError::value_error(
                "num_particles",
                format!(
                    "checkpoint stage {} holds {population} particles, configured {}",
                    restart.stage, config.num_particles
                ),
            ));
        }
        if checkpoint.schedule.len() != config.num_stages {
            log::warn!(
                "checkpoint schedule has {} temperatures, configured {}; following the checkpoint",
                checkpoint.schedule.len(),
                config.num_stages
            );
        }
        // `restart_from` has accepted the stage, so it is non-negative.
        let remaining = checkpoint.remaining_schedule(restart.stage as usize);
        log::info!(
            "checkpoint stage {} leaves {} temperatures to visit",
            restart.stage,
            remaining.len()
        );
        let Checkpoint {
            schedule,
            start_index,
            seed,
            chain,
        } = checkpoint;
        let layout = RunLayout {
            schedule,
            start_index,
            seed,
        };
        Ok((chain, layout))
    }

    /// Reweights, resamples if needed and mutates the local population for one stage.
    fn advance(
        &self,
        config: &RunConfig,
        local: SmcStep,
        stage: usize,
        temperature: f64,
        seed: u64,
    ) -> Result<(SmcStep, StageSummary)> {
        let delta = temperature - local.temperature();
        let reweighted = local
            .particles()
            .iter()
            .map(|p| p.with_log_weight(p.log_weight() + tempered(delta, p.log_like())))
            .collect();
        let mut step = SmcStep::from_particles(reweighted, temperature)?;
        global_normalize(&self.comm, &mut step)?;
        let ess = global_ess(&self.comm, &step)?;

        let threshold = config.ess_threshold_or_default();
        let decision = ess < threshold;
        let resampled: bool = self.comm.broadcast(Some(&decision))?;
        if resampled {
            step = global_resample(&self.comm, &step, &mut resample_rng(seed, stage))?;
        }

        let covariance = global_covariance(&self.comm, &step, self.prior.len())?;
        let offset = partition_offset(config.num_particles, self.comm.size(), self.comm.rank());
        let kernel = MutationKernel::new(config.num_mcmc_steps, config.proposal_scale);
        let mutated = kernel.mutate(
            &self.likelihood,
            &self.prior,
            step.particles(),
            offset,
            temperature,
            &covariance,
            seed,
            stage,
        );
        let (moved, stats) = agree(&self.comm, mutated)?;
        step.set_particles(moved)?;

        let totals = self
            .comm
            .all_reduce_sum(&[stats.accepted as f64, stats.proposed as f64])?;
        let acceptance_rate = if totals[1] > 0.0 {
            totals[0] / totals[1]
        } else {
            0.0
        };
        let summary = StageSummary {
            stage,
            temperature,
            ess,
            resampled,
            acceptance_rate,
        };
        Ok((step, summary))
    }

    /// Gathers the stage on the coordinator, checkpoints it and reports progress.
    fn record(
        &self,
        config: &RunConfig,
        role: &mut dyn Role,
        local: &SmcStep,
        summary: &StageSummary,
        state: &mut SamplerState,
    ) -> Result<()> {
        role.record_stage(assemble(&self.comm, local)?)?;
        if config.checkpoint.is_some() {
            if role.wants_checkpoint() {
                self.transition(state, SamplerState::Checkpointing { stage: summary.stage });
            }
            agree(&self.comm, role.checkpoint())?;
        }
        if self.comm.is_coordinator() {
            log::info!(
                "stage {}: temperature {:.4}, ESS {:.1}, resampled {}, acceptance {:.3}",
                summary.stage,
                summary.temperature,
                summary.ess,
                summary.resampled,
                summary.acceptance_rate
            );
        }
        role.stage_finished(summary);
        Ok(())
    }
}

/// Draws the particle with global index `index` and weights it to `temperature`.
fn draw_particle<L: Likelihood + ?Sized>(
    likelihood: &L,
    prior: &Prior,
    proposal: Option<&ProposalDistribution>,
    seed: u64,
    index: usize,
    temperature: f64,
) -> Result<Particle> {
    let mut rng = init_rng(seed, index);
    let Some(proposal) = proposal else {
        let params = prior.sample(&mut rng);
        let log_like = finite_or_error(likelihood.log_likelihood(&params)?, index)?;
        return Ok(Particle::new(params, tempered(temperature, log_like), log_like));
    };

    let params = proposal.sample(&mut rng);
    if let Some((param, value)) = prior.support_violation(&params) {
        return Err(SmcError::Support { param, value });
    }
    let log_like = likelihood.log_likelihood(&params)?;
    if !log_like.is_finite() {
        return Err(SmcError::Support {
            param: "log_like".to_string(),
            value: log_like,
        });
    }
    let log_weight = prior.log_density(&params) + tempered(temperature, log_like)
        - proposal.log_density(&params);
    Ok(Particle::new(params, log_weight, log_like))
}

/// `-inf` is a valid (zero) likelihood; NaN is a broken model.
fn finite_or_error(log_like: f64, index: usize) -> Result<f64> {
    if log_like.is_nan() {
        return Err(SmcError::Model(format!(
            "log-likelihood of particle {index} is NaN"
        )));
    }
    Ok(log_like)
}
