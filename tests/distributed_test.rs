//! Runs split over several in-process ranks.
//!
//! Particle streams are keyed by global particle index and population statistics are
//! computed over the whole population in global order, so a split run reproduces the
//! single-process run bit for bit.

use mini_smc::distributor::partition;
use mini_smc::{
    Distribution, GaussianLikelihood, LinearModel, LocalCluster, Prior, RunConfig,
    SingleProcess, SmcError, SmcSampler,
};

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use mini_smc::Params;

    fn likelihood() -> GaussianLikelihood<LinearModel> {
        let x: Vec<f64> = (0..12).map(|i| i as f64).collect();
        let data = x.iter().map(|x| -1.2 * x + 3.0 + 0.4 * (x * 0.7).cos()).collect();
        GaussianLikelihood::new(LinearModel::new(x), data, 1.0).unwrap()
    }

    fn prior() -> Prior {
        Prior::new()
            .with("a", Distribution::uniform(-5.0, 5.0).unwrap())
            .with("b", Distribution::uniform(-10.0, 10.0).unwrap())
    }

    #[test]
    fn coordinator_holds_the_chain() {
        let config = RunConfig::new(10, 4, 2).with_seed(6);
        let outputs = LocalCluster::run(3, |comm| {
            SmcSampler::new(likelihood(), prior(), comm).sample(&config)
        })
        .unwrap();

        let sizes: Vec<usize> = outputs
            .iter()
            .map(|o| o.as_ref().unwrap().local.len())
            .collect();
        assert_eq!(sizes, partition(10, 3));
        assert_eq!(sizes.iter().sum::<usize>(), 10);

        let coordinator = outputs[0].as_ref().unwrap();
        let chain = coordinator.chain.as_ref().unwrap();
        assert_eq!(chain.get_num_steps(), 4);
        assert_eq!(chain.get_particles(None).len(), 10);
        assert_abs_diff_eq!(chain.get_weights(Some(0)).iter().sum::<f64>(), 1.0, epsilon = 1e-10);
        for worker in &outputs[1..] {
            assert!(worker.as_ref().unwrap().chain.is_none());
        }
        // Every rank saw the same resampling decisions.
        let decisions: Vec<Vec<bool>> = outputs
            .iter()
            .map(|o| o.as_ref().unwrap().summaries.iter().map(|s| s.resampled).collect())
            .collect();
        assert!(decisions.iter().all(|d| d == &decisions[0]));
    }

    #[test]
    fn split_run_follows_single_process_run() {
        let config = RunConfig::new(24, 5, 3).with_seed(21);
        let single = SmcSampler::new(likelihood(), prior(), SingleProcess)
            .sample(&config)
            .unwrap()
            .into_steps()
            .unwrap();
        for size in [2, 3, 5] {
            let mut outputs = LocalCluster::run(size, |comm| {
                SmcSampler::new(likelihood(), prior(), comm).sample(&config)
            })
            .unwrap();
            let split = outputs.remove(0).unwrap().into_steps().unwrap();
            assert_eq!(split, single, "{size} ranks");
        }
    }

    #[test]
    fn more_ranks_than_particles() {
        let config = RunConfig::new(3, 3, 1).with_seed(1);
        let outputs = LocalCluster::run(5, |comm| {
            SmcSampler::new(likelihood(), prior(), comm).sample(&config)
        })
        .unwrap();
        let sizes: Vec<usize> = outputs
            .iter()
            .map(|o| o.as_ref().unwrap().local.len())
            .collect();
        assert_eq!(sizes, vec![1, 1, 1, 0, 0]);
        let chain = outputs[0].as_ref().unwrap().chain.as_ref().unwrap();
        assert_eq!(chain.get_particles(None).len(), 3);
    }

    #[test]
    fn support_error_reaches_every_rank() {
        let center: Params = [("a".to_string(), 4.9), ("b".to_string(), 0.0)].into();
        let scales: Params = [("a".to_string(), 3.0), ("b".to_string(), 1.0)].into();
        let config = RunConfig::new(40, 4, 1).with_seed(2).with_proposal(center, scales);
        let outputs = LocalCluster::run(4, |comm| {
            SmcSampler::new(likelihood(), prior(), comm).sample(&config)
        })
        .unwrap();
        for output in outputs {
            assert!(matches!(output, Err(SmcError::Support { .. })));
        }
    }
}
