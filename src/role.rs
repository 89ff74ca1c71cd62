//! Rank-dependent behaviour of a run.
//!
//! Every rank computes on its own partition; only the coordinator keeps the
//! [`ParticleChain`], writes checkpoints and shows progress. The sampler talks to a
//! `Box<dyn Role>` and never branches on the rank itself.

use indicatif::{ProgressBar, ProgressStyle};

use crate::chain::ParticleChain;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::{Result, SmcError};
use crate::step::SmcStep;

/// Diagnostics of one finished stage.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StageSummary {
    pub stage: usize,
    pub temperature: f64,
    /// Effective sample size after reweighting, before resampling.
    pub ess: f64,
    pub resampled: bool,
    /// Fraction of accepted mutation proposals, `0` for stage 0.
    pub acceptance_rate: f64,
}

pub trait Role {
    /// Receives the assembled population of a finished stage: `Some` on the coordinator,
    /// `None` everywhere else.
    fn record_stage(&mut self, assembled: Option<SmcStep>) -> Result<()>;

    /// Whether [`Role::checkpoint`] has anything to do.
    fn wants_checkpoint(&self) -> bool;

    /// Persists the chain recorded so far.
    fn checkpoint(&self) -> Result<()>;

    fn stage_finished(&self, summary: &StageSummary);

    /// Ends the run and hands out the chain, if this rank holds one.
    fn finish(self: Box<Self>) -> Option<ParticleChain>;
}

/// Run-level facts stored with every checkpoint.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RunLayout {
    pub schedule: Vec<f64>,
    pub start_index: usize,
    pub seed: u64,
}

/// Rank 0: owns the chain.
pub struct Coordinator {
    chain: ParticleChain,
    layout: RunLayout,
    store: Option<Box<dyn CheckpointStore>>,
    progress: Option<ProgressBar>,
}

impl Coordinator {
    pub fn new(layout: RunLayout, store: Option<Box<dyn CheckpointStore>>) -> Self {
        Self::resume(ParticleChain::new(), layout, store)
    }

    /// Continues an existing (already truncated) chain.
    pub fn resume(
        chain: ParticleChain,
        layout: RunLayout,
        store: Option<Box<dyn CheckpointStore>>,
    ) -> Self {
        Self {
            chain,
            layout,
            store,
            progress: None,
        }
    }

    /// Shows a progress bar with one tick per stage of the schedule.
    pub fn with_progress(mut self) -> Self {
        let total = self.layout.schedule.len().saturating_sub(self.layout.start_index);
        let pb = ProgressBar::new(total as u64);
        let style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        pb.set_style(style);
        pb.set_prefix("SMC");
        pb.set_position(self.chain.get_num_steps() as u64);
        self.progress = Some(pb);
        self
    }

    pub fn chain(&self) -> &ParticleChain {
        &self.chain
    }
}

impl Role for Coordinator {
    fn record_stage(&mut self, assembled: Option<SmcStep>) -> Result<()> {
        let step = assembled.ok_or_else(|| {
            SmcError::Communication("coordinator received no assembled population".to_string())
        })?;
        self.chain.append(&step);
        Ok(())
    }

    fn wants_checkpoint(&self) -> bool {
        self.store.is_some()
    }

    fn checkpoint(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let checkpoint = Checkpoint {
            schedule: self.layout.schedule.clone(),
            start_index: self.layout.start_index,
            seed: self.layout.seed,
            chain: self.chain.clone(),
        };
        store.save(&checkpoint)
    }

    fn stage_finished(&self, summary: &StageSummary) {
        if let Some(pb) = &self.progress {
            pb.inc(1);
            pb.set_message(format!(
                "T={:.3} ESS={:.1} AcceptRate={:.3}",
                summary.temperature, summary.ess, summary.acceptance_rate
            ));
        }
    }

    fn finish(self: Box<Self>) -> Option<ParticleChain> {
        if let Some(pb) = &self.progress {
            pb.finish_with_message("Done!");
        }
        Some(self.chain)
    }
}

/// Any other rank: computes, never stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct Worker;

impl Role for Worker {
    fn record_stage(&mut self, assembled: Option<SmcStep>) -> Result<()> {
        match assembled {
            None => Ok(()),
            Some(_) => Err(SmcError::Communication(
                "worker received an assembled population".to_string(),
            )),
        }
    }

    fn wants_checkpoint(&self) -> bool {
        false
    }

    fn checkpoint(&self) -> Result<()> {
        Ok(())
    }

    fn stage_finished(&self, _summary: &StageSummary) {}

    fn finish(self: Box<Self>) -> Option<ParticleChain> {
        None
    }
}
