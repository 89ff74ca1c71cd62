/*!
# Run configuration

[`RunConfig`] collects everything a sampling run needs besides the model: population size,
number of tempering stages, mutation effort, resampling threshold, checkpointing, an
optional proposal for the initial population and an optional restart point.

It can be built in code,

```rust
use mini_smc::config::RunConfig;

let config = RunConfig::new(500, 20, 5).with_seed(7).with_ess_threshold(100.0);
assert_eq!(config.ess_threshold_or_default(), 100.0);
assert_eq!(RunConfig::new(500, 20, 5).ess_threshold_or_default(), 250.0);
```

or read from JSON, in which case every field is checked for its type before its value:

```rust
use mini_smc::config::RunConfig;
use mini_smc::SmcError;

let config = RunConfig::from_json_str(
    r#"{"num_particles": 100, "num_stages": 10, "num_mcmc_steps": 2,
        "proposal": {"center": {"a": 2.0, "b": 5.0}}}"#,
).unwrap();
assert_eq!(config.proposal.unwrap().scales["b"], 1.0);

let err = RunConfig::from_json_str(
    r#"{"num_particles": 1.0, "num_stages": 10, "num_mcmc_steps": 2}"#,
).unwrap_err();
assert!(matches!(err, SmcError::Type { .. }));
```
*/

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::distributions::{Prior, ProposalDistribution};
use crate::error::{Result, SmcError};
use crate::particle::Params;

/// Center and per-parameter scale of the normal proposal used for the initial population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalConfig {
    pub center: Params,
    pub scales: Params,
}

/// Where to resume a previous run from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartConfig {
    pub checkpoint: PathBuf,
    /// Stage of the checkpointed chain to continue after.
    pub stage: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub num_particles: usize,
    pub num_stages: usize,
    /// Metropolis–Hastings moves per particle and stage.
    pub num_mcmc_steps: usize,
    /// Resample when the ESS falls below this value; `num_particles / 2` when unset.
    #[serde(default)]
    pub ess_threshold: Option<f64>,
    /// Checkpoint file written by the coordinator after every stage.
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
    #[serde(default)]
    pub proposal: Option<ProposalConfig>,
    #[serde(default)]
    pub restart: Option<RestartConfig>,
    /// Multiplier applied to the population covariance in mutation proposals.
    #[serde(default = "default_proposal_scale")]
    pub proposal_scale: f64,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub progress: bool,
}

fn default_proposal_scale() -> f64 {
    1.0
}

impl RunConfig {
    pub fn new(num_particles: usize, num_stages: usize, num_mcmc_steps: usize) -> Self {
        Self {
            num_particles,
            num_stages,
            num_mcmc_steps,
            ess_threshold: None,
            checkpoint: None,
            proposal: None,
            restart: None,
            proposal_scale: default_proposal_scale(),
            seed: 0,
            progress: false,
        }
    }

    pub fn with_ess_threshold(mut self, ess_threshold: f64) -> Self {
        self.ess_threshold = Some(ess_threshold);
        self
    }

    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    pub fn with_proposal(mut self, center: Params, scales: Params) -> Self {
        self.proposal = Some(ProposalConfig { center, scales });
        self
    }

    pub fn with_restart(mut self, checkpoint: impl Into<PathBuf>, stage: i64) -> Self {
        self.restart = Some(RestartConfig {
            checkpoint: checkpoint.into(),
            stage,
        });
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_proposal_scale(mut self, proposal_scale: f64) -> Self {
        self.proposal_scale = proposal_scale;
        self
    }

    pub fn ess_threshold_or_default(&self) -> f64 {
        self.ess_threshold
            .unwrap_or(self.num_particles as f64 / 2.0)
    }

    /// Checks the configuration against the prior it will be used with.
    pub fn validate(&self, prior: &Prior) -> Result<()> {
        for (field, value) in [
            ("num_particles", self.num_particles),
            ("num_stages", self.num_stages),
            ("num_mcmc_steps", self.num_mcmc_steps),
        ] {
            if value == 0 {
                return Err(SmcError::value_error(field, "must be a positive integer"));
            }
        }
        if let Some(threshold) = self.ess_threshold {
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(SmcError::value_error(
                    "ess_threshold",
                    format!("must be a finite non-negative number, got {threshold}"),
                ));
            }
        }
        if !(self.proposal_scale.is_finite() && self.proposal_scale > 0.0) {
            return Err(SmcError::value_error(
                "proposal_scale",
                format!("must be positive, got {}", self.proposal_scale),
            ));
        }
        if prior.is_empty() {
            return Err(SmcError::value_error("prior", "no parameters to sample"));
        }
        if let Some(proposal) = &self.proposal {
            ProposalDistribution::new(prior, &proposal.center, &proposal.scales)?;
        }
        if let Some(restart) = &self.restart {
            if restart.stage < 0 {
                return Err(SmcError::value_error(
                    "restart stage",
                    format!("must not be negative, got {}", restart.stage),
                ));
            }
        }
        Ok(())
    }

    /// Reads a configuration from a JSON value, reporting the first offending field.
    pub fn from_value(value: &Value) -> Result<Self> {
        let fields = value
            .as_object()
            .ok_or_else(|| SmcError::type_error("config", "a JSON object"))?;
        let required = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| SmcError::key_error("config", name))
        };
        let optional = |name: &str| fields.get(name).filter(|v| !v.is_null());

        let mut config = RunConfig::new(
            check_positive_integer("num_particles", required("num_particles")?)?,
            check_positive_integer("num_stages", required("num_stages")?)?,
            check_positive_integer("num_mcmc_steps", required("num_mcmc_steps")?)?,
        );
        if let Some(v) = optional("ess_threshold") {
            config.ess_threshold = Some(check_ess_threshold(v)?);
        }
        if let Some(v) = optional("checkpoint") {
            config.checkpoint = Some(check_checkpoint_path(v)?);
        }
        if let Some(v) = optional("proposal") {
            let proposal = v
                .as_object()
                .ok_or_else(|| SmcError::type_error("proposal", "an object with center and scales"))?;
            config.proposal = check_proposal_inputs(
                proposal.get("center").filter(|v| !v.is_null()),
                proposal.get("scales").filter(|v| !v.is_null()),
            )?;
        }
        if let Some(v) = optional("restart") {
            config.restart = Some(parse_restart(v)?);
        }
        if let Some(v) = optional("proposal_scale") {
            config.proposal_scale = v
                .as_f64()
                .ok_or_else(|| SmcError::type_error("proposal_scale", "a number"))?;
        }
        if let Some(v) = optional("seed") {
            config.seed = v
                .as_u64()
                .ok_or_else(|| SmcError::type_error("seed", "a non-negative integer"))?;
        }
        if let Some(v) = optional("progress") {
            config.progress = v
                .as_bool()
                .ok_or_else(|| SmcError::type_error("progress", "a boolean"))?;
        }
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SmcError::value_error("config", format!("invalid JSON: {e}")))?;
        Self::from_value(&value)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }
}

/// A strictly positive JSON integer. Floats, strings, objects and arrays are type errors
/// even when they hold an integral value.
pub fn check_positive_integer(field: &str, value: &Value) -> Result<usize> {
    match value {
        Value::Number(n) if n.is_u64() || n.is_i64() => {
            let n = n.as_i64().unwrap_or(i64::MAX);
            if n <= 0 {
                return Err(SmcError::value_error(
                    field,
                    format!("must be a positive integer, got {n}"),
                ));
            }
            usize::try_from(n)
                .map_err(|_| SmcError::value_error(field, format!("{n} is too large")))
        }
        _ => Err(SmcError::type_error(field, "an integer")),
    }
}

pub fn check_ess_threshold(value: &Value) -> Result<f64> {
    let threshold = value
        .as_f64()
        .ok_or_else(|| SmcError::type_error("ess_threshold", "a number"))?;
    if threshold < 0.0 {
        return Err(SmcError::value_error(
            "ess_threshold",
            format!("must not be negative, got {threshold}"),
        ));
    }
    Ok(threshold)
}

pub fn check_checkpoint_path(value: &Value) -> Result<PathBuf> {
    let path = value
        .as_str()
        .ok_or_else(|| SmcError::type_error("checkpoint", "a file path string"))?;
    if path.is_empty() {
        return Err(SmcError::value_error("checkpoint", "path is empty"));
    }
    Ok(PathBuf::from(path))
}

/// Validates the shape of a proposal: both parts must be objects of numbers, scales need a
/// center, and a center without scales gets unit scales. Key agreement with the prior is
/// checked later, in [`RunConfig::validate`].
pub fn check_proposal_inputs(
    center: Option<&Value>,
    scales: Option<&Value>,
) -> Result<Option<ProposalConfig>> {
    let center = match (center, scales) {
        (None, None) => return Ok(None),
        (None, Some(_)) => {
            return Err(SmcError::value_error(
                "proposal",
                "scales were given without a center",
            ))
        }
        (Some(center), _) => numeric_map("proposal center", center)?,
    };
    let scales = match scales {
        Some(scales) => numeric_map("proposal scales", scales)?,
        None => center.keys().map(|k| (k.clone(), 1.0)).collect(),
    };
    Ok(Some(ProposalConfig { center, scales }))
}

fn numeric_map(field: &str, value: &Value) -> Result<Params> {
    let object: &Map<String, Value> = value
        .as_object()
        .ok_or_else(|| SmcError::type_error(field, "an object of parameter values"))?;
    object
        .iter()
        .map(|(name, v)| {
            v.as_f64()
                .map(|x| (name.clone(), x))
                .ok_or_else(|| SmcError::type_error(field, "numeric parameter values"))
        })
        .collect()
}

fn parse_restart(value: &Value) -> Result<RestartConfig> {
    let fields = value
        .as_object()
        .ok_or_else(|| SmcError::type_error("restart", "an object with checkpoint and stage"))?;
    let checkpoint = fields
        .get("checkpoint")
        .ok_or_else(|| SmcError::key_error("restart", "checkpoint"))
        .and_then(check_checkpoint_path)?;
    let stage = fields
        .get("stage")
        .ok_or_else(|| SmcError::key_error("restart", "stage"))?
        .as_i64()
        .ok_or_else(|| SmcError::type_error("restart stage", "an integer"))?;
    Ok(RestartConfig { checkpoint, stage })
}
