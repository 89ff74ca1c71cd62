//! Checkpoint payload and the stores that persist it.
//!
//! Only the coordinator writes checkpoints. A checkpoint holds everything needed to resume:
//! the full chain so far, the temperature schedule and the master seed.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::chain::ParticleChain;
use crate::error::{Result, SmcError};

/// Serializable state of a run after its most recent stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Full temperature schedule of the run.
    pub schedule: Vec<f64>,
    /// Index into `schedule` of the chain's stage 0.
    pub start_index: usize,
    /// Master seed the run was started with.
    pub seed: u64,
    pub chain: ParticleChain,
}

impl Checkpoint {
    /// Schedule index of chain stage `stage`.
    pub fn schedule_index(&self, stage: usize) -> usize {
        self.start_index + stage
    }

    /// Temperatures still to be visited after chain stage `stage`.
    pub fn remaining_schedule(&self, stage: usize) -> &[f64] {
        let next = (self.schedule_index(stage) + 1).min(self.schedule.len());
        &self.schedule[next..]
    }
}

/// Somewhere a checkpoint can be written to and read back from.
///
/// A store must round-trip a [`Checkpoint`] exactly, floating-point bits included.
pub trait CheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
    fn load(&self) -> Result<Checkpoint>;
}

/// Stores the checkpoint as a bincode file.
///
/// The file is written next to its destination first and then renamed, so an interrupted
/// write never leaves a truncated checkpoint behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFileStore {
    path: PathBuf,
}

impl BinaryFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for BinaryFileStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let staging = self.path.with_extension("partial");
        let file = File::create(&staging).map_err(|e| {
            SmcError::Checkpoint(format!("cannot create {}: {e}", staging.display()))
        })?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, checkpoint)
            .map_err(|e| SmcError::Checkpoint(format!("failed to serialize checkpoint: {e}")))?;
        writer.flush()?;
        drop(writer);
        fs::rename(&staging, &self.path)?;
        log::debug!(
            "checkpoint with {} stages written to {}",
            checkpoint.chain.get_num_steps(),
            self.path.display()
        );
        Ok(())
    }

    fn load(&self) -> Result<Checkpoint> {
        let file = File::open(&self.path).map_err(|e| {
            SmcError::Checkpoint(format!("cannot open {}: {e}", self.path.display()))
        })?;
        let mut reader = BufReader::new(file);
        bincode::deserialize_from(&mut reader)
            .map_err(|e| SmcError::Checkpoint(format!("failed to deserialize checkpoint: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::{Params, Particle};
    use crate::step::SmcStep;

    fn checkpoint() -> Checkpoint {
        let mut chain = ParticleChain::new();
        for (stage, t) in [0.25, 0.5].iter().enumerate() {
            let particles = (0..3)
                .map(|i| {
                    let params: Params = [("a".to_string(), 0.1 * i as f64 + stage as f64)].into();
                    Particle::new(params, -(3f64.ln()), -1.0 / 3.0 - i as f64)
                })
                .collect();
            chain.append(&SmcStep::from_particles(particles, *t).unwrap());
        }
        Checkpoint {
            schedule: vec![0.0, 0.25, 0.5, 0.75, 1.0],
            start_index: 1,
            seed: 17,
            chain,
        }
    }

    #[test]
    fn file_store_round_trips_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let store = BinaryFileStore::new(dir.path().join("nested").join("run.ckpt"));
        let original = checkpoint();
        store.save(&original).unwrap();
        let restored = store.load().unwrap();
        assert_eq!(restored, original);
        assert!(!store.path().with_extension("partial").exists());
    }

    #[test]
    fn missing_file_is_a_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = BinaryFileStore::new(dir.path().join("absent.ckpt"));
        assert!(matches!(store.load(), Err(SmcError::Checkpoint(_))));
    }

    #[test]
    fn remaining_schedule_follows_stage() {
        let ckpt = checkpoint();
        assert_eq!(ckpt.remaining_schedule(0), &[0.5, 0.75, 1.0]);
        assert_eq!(ckpt.remaining_schedule(1), &[0.75, 1.0]);
        assert!(ckpt.remaining_schedule(10).is_empty());
    }
}
