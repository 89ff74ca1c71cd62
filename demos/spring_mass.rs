//! Estimates the stiffness `K` and the gravitational acceleration `g` of a mass hanging on
//! a spring from noisy displacement measurements.
//!
//! The mass starts at rest at the origin and follows `x'' = g - K x`, integrated with a
//! fixed-step Runge-Kutta scheme. Measurements are synthesized from known parameters.

use mini_smc::{
    Distribution, ForwardModel, GaussianLikelihood, Params, Prior, RunConfig, SingleProcess,
    SmcError, SmcSampler,
};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution as _, Normal};
use std::error::Error;

#[cfg(feature = "csv")]
use mini_smc::io::csv::save_chain_csv;

const NOISE_STD_DEV: f64 = 0.5;
const SUBSTEPS: usize = 20;

struct SpringMassModel {
    /// Measurement times, starting at zero.
    times: Vec<f64>,
}

impl SpringMassModel {
    fn simulate(&self, stiffness: f64, gravity: f64) -> Vec<f64> {
        let accel = |x: f64| gravity - stiffness * x;
        let mut state = (0.0f64, 0.0f64);
        let mut now = 0.0;
        let mut displacements = Vec::with_capacity(self.times.len());
        for &t in &self.times {
            let h = (t - now) / SUBSTEPS as f64;
            for _ in 0..SUBSTEPS {
                let (x, v) = state;
                let (k1x, k1v) = (v, accel(x));
                let (k2x, k2v) = (v + 0.5 * h * k1v, accel(x + 0.5 * h * k1x));
                let (k3x, k3v) = (v + 0.5 * h * k2v, accel(x + 0.5 * h * k2x));
                let (k4x, k4v) = (v + h * k3v, accel(x + h * k3x));
                state = (
                    x + h / 6.0 * (k1x + 2.0 * k2x + 2.0 * k3x + k4x),
                    v + h / 6.0 * (k1v + 2.0 * k2v + 2.0 * k3v + k4v),
                );
            }
            now = t;
            displacements.push(state.0);
        }
        displacements
    }
}

impl ForwardModel for SpringMassModel {
    fn evaluate(&self, params: &Params) -> mini_smc::Result<Vec<f64>> {
        let get = |name: &str| {
            params
                .get(name)
                .copied()
                .ok_or_else(|| SmcError::Key {
                    field: "params".to_string(),
                    key: name.to_string(),
                })
        };
        Ok(self.simulate(get("K")?, get("g")?))
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let times: Vec<f64> = (0..25).map(|i| 0.2 * i as f64).collect();
    let model = SpringMassModel { times };

    let mut rng = SmallRng::seed_from_u64(1234);
    let noise = Normal::new(0.0, NOISE_STD_DEV)?;
    let data: Vec<f64> = model
        .simulate(1.67, 4.62)
        .into_iter()
        .map(|x| x + noise.sample(&mut rng))
        .collect();

    let likelihood = GaussianLikelihood::new(model, data, NOISE_STD_DEV)?;
    let prior = Prior::new()
        .with("K", Distribution::uniform(0.0, 10.0)?)
        .with("g", Distribution::uniform(0.0, 10.0)?);

    let config = RunConfig::new(500, 20, 1)
        .with_ess_threshold(250.0)
        .with_seed(7)
        .with_progress(true);
    let output = SmcSampler::new(likelihood, prior, SingleProcess).sample(&config)?;
    let chain = output
        .chain
        .ok_or("a single-process run always holds the chain")?;

    for summary in &output.summaries {
        println!(
            "stage {:>2}: T={:.3} ESS={:>6.1} resampled={} acceptance={:.3}",
            summary.stage,
            summary.temperature,
            summary.ess,
            summary.resampled,
            summary.acceptance_rate
        );
    }
    if let Some(mean) = chain.get_means().last() {
        for (name, value) in mean {
            println!("{name} mean = {value:.4}");
        }
    }

    #[cfg(feature = "csv")]
    {
        save_chain_csv(&chain, "spring_mass.csv")?;
        println!("Saved the chain to spring_mass.csv");
    }
    Ok(())
}
