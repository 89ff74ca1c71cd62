/*!
# mini-smc

Tempered Sequential Monte Carlo for Bayesian parameter estimation.

A population of weighted particles is moved from the prior to the posterior through a
schedule of temperatures `0 = τ_0 < τ_1 < … < τ_K = 1`. At every stage the particles are
reweighted by `(τ_i − τ_{i−1}) · log_like`, resampled when the effective sample size gets
too small, and diversified by a few Metropolis–Hastings moves.

The particles of a run can be spread over several ranks (see [`distributor`]); the
coordinator gathers every stage into a [`ParticleChain`] and can checkpoint it so that an
interrupted run resumes where it stopped.

```rust
use mini_smc::{Distribution, LinearModel, GaussianLikelihood, Prior, RunConfig, SingleProcess, SmcSampler};

let x: Vec<f64> = (0..30).map(|i| i as f64).collect();
let data = x.iter().map(|x| 1.5 * x - 2.0).collect();
let likelihood = GaussianLikelihood::new(LinearModel::new(x), data, 0.5).unwrap();
let prior = Prior::new()
    .with("a", Distribution::uniform(-5.0, 5.0).unwrap())
    .with("b", Distribution::uniform(-5.0, 5.0).unwrap());

let output = SmcSampler::new(likelihood, prior, SingleProcess)
    .sample(&RunConfig::new(100, 8, 3).with_seed(4))
    .unwrap();
let posterior = output.chain.unwrap();
println!("{:?}", posterior.last_step().unwrap().get_mean());
```
*/

pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod distributions;
pub mod distributor;
pub mod error;
pub mod io;
pub mod kernel;
pub mod likelihood;
pub mod model;
pub mod particle;
pub mod role;
pub mod sampler;
pub mod seed;
pub mod stats;
pub mod step;

pub use chain::ParticleChain;
pub use checkpoint::{BinaryFileStore, Checkpoint, CheckpointStore};
pub use config::{ProposalConfig, RestartConfig, RunConfig};
pub use distributions::{Distribution, Prior, ProposalDistribution};
pub use distributor::{Communicator, LocalCluster, LocalCommunicator, SingleProcess};
pub use error::{Result, SmcError};
pub use kernel::{MutationKernel, MutationStats};
pub use likelihood::{GaussianLikelihood, Likelihood};
pub use model::{ForwardModel, LinearModel};
pub use particle::{Params, Particle};
pub use role::StageSummary;
pub use sampler::{SmcOutput, SmcSampler};
pub use step::SmcStep;
