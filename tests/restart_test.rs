//! Checkpointing a run and resuming it from a stored stage.

use mini_smc::{
    BinaryFileStore, CheckpointStore, Communicator, Distribution, GaussianLikelihood, LinearModel,
    LocalCluster, ParticleChain, Prior, RunConfig, SingleProcess, SmcError, SmcSampler,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sampler<C: Communicator>(comm: C) -> SmcSampler<GaussianLikelihood<LinearModel>, C> {
        let x: Vec<f64> = (0..8).map(|i| i as f64 * 0.5).collect();
        let data = x.iter().map(|x| 0.8 * x - 2.0 + 0.2 * (3.0 * x).sin()).collect();
        let likelihood = GaussianLikelihood::new(LinearModel::new(x), data, 0.5).unwrap();
        let prior = Prior::new()
            .with("a", Distribution::uniform(-4.0, 4.0).unwrap())
            .with("b", Distribution::uniform(-6.0, 6.0).unwrap());
        SmcSampler::new(likelihood, prior, comm)
    }

    fn config(path: &Path) -> RunConfig {
        RunConfig::new(30, 6, 2).with_seed(77).with_checkpoint(path)
    }

    fn full_run(path: &Path) -> ParticleChain {
        sampler(SingleProcess)
            .sample(&config(path))
            .unwrap()
            .chain
            .unwrap()
    }

    #[test]
    fn every_stage_is_checkpointed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        let chain = full_run(&path);

        let saved = BinaryFileStore::new(&path).load().unwrap();
        assert_eq!(saved.chain, chain);
        assert_eq!(saved.seed, 77);
        assert_eq!(saved.schedule.len(), 6);
        assert_eq!(saved.start_index, 0);
        assert!(!dir.path().join("run.partial").exists());
    }

    #[test]
    fn resumed_run_reproduces_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        let original = full_run(&path);

        let resumed = sampler(SingleProcess)
            .sample(&config(&path).with_restart(&path, 2))
            .unwrap();
        let stages: Vec<usize> = resumed.summaries.iter().map(|s| s.stage).collect();
        assert_eq!(stages, vec![3, 4, 5]);
        assert_eq!(resumed.chain.unwrap(), original);
    }

    #[test]
    fn resuming_from_the_last_stage_does_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        let original = full_run(&path);

        let resumed = sampler(SingleProcess)
            .sample(&config(&path).with_restart(&path, 5))
            .unwrap();
        assert!(resumed.summaries.is_empty());
        assert_eq!(resumed.chain.unwrap(), original);
    }

    #[test]
    fn resumed_run_uses_the_checkpoint_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        let original = full_run(&path);

        let resumed = sampler(SingleProcess)
            .sample(&config(&path).with_seed(1).with_restart(&path, 1))
            .unwrap();
        assert_eq!(resumed.chain.unwrap(), original);
    }

    #[test]
    fn invalid_restart_stages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        full_run(&path);

        for stage in [-1, 6, 10] {
            let result = sampler(SingleProcess).sample(&config(&path).with_restart(&path, stage));
            assert!(
                matches!(result, Err(SmcError::Value { .. })),
                "stage {stage}: {result:?}"
            );
        }
    }

    #[test]
    fn population_must_match_the_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        full_run(&path);

        let mut config = config(&path).with_restart(&path, 2);
        config.num_particles = 31;
        let result = sampler(SingleProcess).sample(&config);
        assert!(matches!(result, Err(SmcError::Value { .. })));
    }

    #[test]
    fn missing_checkpoint_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.ckpt");
        let result = sampler(SingleProcess).sample(&config(&path).with_restart(&path, 0));
        assert!(matches!(result, Err(SmcError::Checkpoint(_))));
    }

    #[test]
    fn cluster_resumes_a_single_process_checkpoint_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        let original = full_run(&path);

        let restart = dir.path().join("resumed.ckpt");
        let config = RunConfig::new(30, 6, 2)
            .with_checkpoint(&restart)
            .with_restart(&path, 3);
        let outputs = LocalCluster::run(2, |comm| sampler(comm).sample(&config)).unwrap();
        let mut outputs: Vec<_> = outputs.into_iter().map(|o| o.unwrap()).collect();
        assert!(outputs[1].chain.is_none());
        assert_eq!(outputs[1].local.len(), 15);

        let chain = outputs.remove(0).chain.unwrap();
        assert_eq!(chain, original);
        assert_eq!(BinaryFileStore::new(&restart).load().unwrap().chain, chain);
    }

    #[test]
    fn failed_resume_fails_every_rank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.ckpt");
        let config = RunConfig::new(30, 6, 2).with_restart(&path, 0);
        let outputs = LocalCluster::run(3, |comm| sampler(comm).sample(&config)).unwrap();
        assert!(matches!(outputs[0], Err(SmcError::Checkpoint(_))));
        for worker in &outputs[1..] {
            assert!(matches!(worker, Err(SmcError::Communication(_))));
        }
    }
}
