/*!
Prior and proposal distributions over named scalar parameters.

A prior is an ordered mapping from parameter name to a [`Distribution`]. The distribution
kind and its parameters are checked once, when the distribution is built, so that sampling
and density evaluation cannot fail afterwards.

# Examples

```rust
use mini_smc::distributions::{Distribution, Prior};
use rand::SeedableRng;

let prior = Prior::new()
    .with("K", Distribution::from_spec("Uniform", &[0.0, 10.0]).unwrap())
    .with("g", Distribution::normal(9.8, 1.0).unwrap());

let mut rng = rand::rngs::SmallRng::seed_from_u64(42);
let params = prior.sample(&mut rng);
assert_eq!(params.len(), 2);
assert!(prior.log_density(&params).is_finite());
```

Priors can also be read from JSON in the list form `["Uniform", lower, upper]`:

```rust
use mini_smc::distributions::Prior;

let spec = serde_json::json!({"a": ["Uniform", -5.0, 5.0], "b": ["Normal", 0.0, 2.0]});
let prior = Prior::from_json(&spec).unwrap();
assert_eq!(prior.names(), vec!["a", "b"]);
```
*/

use indexmap::IndexMap;
use rand::Rng;
use rand_distr::{Exp1, StandardNormal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::{Result, SmcError};
use crate::particle::Params;

/// A univariate distribution with a validated parameterisation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Distribution {
    /// Continuous uniform on the closed interval `[lower, upper]`.
    Uniform { lower: f64, upper: f64 },
    Normal { mean: f64, std_dev: f64 },
    /// Normal folded at zero, supported on `[0, ∞)`.
    HalfNormal { std_dev: f64 },
    Exponential { rate: f64 },
}

impl Distribution {
    pub fn uniform(lower: f64, upper: f64) -> Result<Self> {
        if !(lower.is_finite() && upper.is_finite()) || lower >= upper {
            return Err(SmcError::value_error(
                "Uniform",
                format!("expected finite bounds with lower < upper, got [{lower}, {upper}]"),
            ));
        }
        Ok(Distribution::Uniform { lower, upper })
    }

    pub fn normal(mean: f64, std_dev: f64) -> Result<Self> {
        if !mean.is_finite() {
            return Err(SmcError::value_error("Normal", "mean must be finite"));
        }
        check_scale("Normal", std_dev)?;
        Ok(Distribution::Normal { mean, std_dev })
    }

    pub fn half_normal(std_dev: f64) -> Result<Self> {
        check_scale("HalfNormal", std_dev)?;
        Ok(Distribution::HalfNormal { std_dev })
    }

    pub fn exponential(rate: f64) -> Result<Self> {
        check_scale("Exponential", rate)?;
        Ok(Distribution::Exponential { rate })
    }

    /// Builds a distribution from its kind name and positional parameters, e.g.
    /// `("Uniform", [0.0, 10.0])`.
    pub fn from_spec(kind: &str, params: &[f64]) -> Result<Self> {
        let arity = match kind {
            "Uniform" | "Normal" => 2,
            "HalfNormal" | "Exponential" => 1,
            other => return Err(SmcError::key_error("distribution kind", other)),
        };
        if params.len() != arity {
            return Err(SmcError::value_error(
                kind,
                format!("expected {arity} parameters, got {}", params.len()),
            ));
        }
        match kind {
            "Uniform" => Self::uniform(params[0], params[1]),
            "Normal" => Self::normal(params[0], params[1]),
            "HalfNormal" => Self::half_normal(params[0]),
            _ => Self::exponential(params[0]),
        }
    }

    /// Parses the JSON list form `["Kind", p1, p2, ...]` for the parameter `name`.
    pub fn from_json(name: &str, value: &serde_json::Value) -> Result<Self> {
        let items = value
            .as_array()
            .ok_or_else(|| SmcError::type_error(name, "a list [kind, params...]"))?;
        let kind = items
            .first()
            .and_then(|k| k.as_str())
            .ok_or_else(|| SmcError::type_error(name, "a distribution kind string first"))?;
        let params = items[1..]
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| SmcError::type_error(name, "numeric parameters")))
            .collect::<Result<Vec<f64>>>()?;
        Self::from_spec(kind, &params)
    }

    /// Draws one value.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            Distribution::Uniform { lower, upper } => lower + (upper - lower) * rng.gen::<f64>(),
            Distribution::Normal { mean, std_dev } => {
                mean + std_dev * rng.sample::<f64, _>(StandardNormal)
            }
            Distribution::HalfNormal { std_dev } => {
                (std_dev * rng.sample::<f64, _>(StandardNormal)).abs()
            }
            Distribution::Exponential { rate } => rng.sample::<f64, _>(Exp1) / rate,
        }
    }

    /// Log-density at `x`; `-inf` outside the support.
    pub fn log_density(&self, x: f64) -> f64 {
        if !self.in_support(x) {
            return f64::NEG_INFINITY;
        }
        match *self {
            Distribution::Uniform { lower, upper } => -(upper - lower).ln(),
            Distribution::Normal { mean, std_dev } => normal_log_density(x, mean, std_dev),
            Distribution::HalfNormal { std_dev } => {
                normal_log_density(x, 0.0, std_dev) + 2f64.ln()
            }
            Distribution::Exponential { rate } => rate.ln() - rate * x,
        }
    }

    pub fn in_support(&self, x: f64) -> bool {
        if x.is_nan() {
            return false;
        }
        match *self {
            Distribution::Uniform { lower, upper } => lower <= x && x <= upper,
            Distribution::Normal { .. } => x.is_finite(),
            Distribution::HalfNormal { .. } | Distribution::Exponential { .. } => {
                x >= 0.0 && x.is_finite()
            }
        }
    }
}

fn check_scale(kind: &str, scale: f64) -> Result<()> {
    if scale.is_finite() && scale > 0.0 {
        Ok(())
    } else {
        Err(SmcError::value_error(
            kind,
            format!("scale parameter must be positive, got {scale}"),
        ))
    }
}

pub(crate) fn normal_log_density(x: f64, mean: f64, std_dev: f64) -> f64 {
    let z = (x - mean) / std_dev;
    -0.5 * (2.0 * PI).ln() - std_dev.ln() - 0.5 * z * z
}

/// Independent prior distributions, one per parameter, in a fixed order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prior {
    distributions: IndexMap<String, Distribution>,
}

impl Prior {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the distribution of `name`.
    pub fn with(mut self, name: impl Into<String>, distribution: Distribution) -> Self {
        self.distributions.insert(name.into(), distribution);
        self
    }

    /// Parses a JSON object mapping each parameter name to its list spec.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| SmcError::type_error("prior", "an object of distribution specs"))?;
        let mut prior = Prior::new();
        for (name, spec) in object {
            prior = prior.with(name.clone(), Distribution::from_json(name, spec)?);
        }
        if prior.is_empty() {
            return Err(SmcError::value_error("prior", "at least one parameter is required"));
        }
        Ok(prior)
    }

    pub fn names(&self) -> Vec<&str> {
        self.distributions.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Distribution> {
        self.distributions.get(name)
    }

    pub fn len(&self) -> usize {
        self.distributions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.distributions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Distribution)> {
        self.distributions.iter()
    }

    /// Draws one value per parameter, in prior order.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Params {
        self.distributions
            .iter()
            .map(|(name, dist)| (name.clone(), dist.sample(rng)))
            .collect()
    }

    /// Joint log-density; `-inf` when any parameter is missing or outside its support.
    pub fn log_density(&self, params: &Params) -> f64 {
        let mut total = 0.0;
        for (name, dist) in &self.distributions {
            match params.get(name) {
                Some(&x) => total += dist.log_density(x),
                None => return f64::NEG_INFINITY,
            }
            if total == f64::NEG_INFINITY {
                return total;
            }
        }
        total
    }

    /// First parameter whose value lies outside its prior support, if any.
    pub fn support_violation(&self, params: &Params) -> Option<(String, f64)> {
        self.distributions.iter().find_map(|(name, dist)| {
            let x = params.get(name).copied().unwrap_or(f64::NAN);
            (!dist.in_support(x)).then(|| (name.clone(), x))
        })
    }
}

/// Independent normal proposal used to seed the initial population closer to the posterior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalDistribution {
    center: Params,
    scales: Params,
}

impl ProposalDistribution {
    /// Builds the proposal with parameters ordered like `prior`.
    ///
    /// Fails with a key error when the center or scale names differ from the prior's, and
    /// with a value error for non-finite centers or non-positive scales.
    pub fn new(prior: &Prior, center: &Params, scales: &Params) -> Result<Self> {
        check_keys("proposal center", prior, center)?;
        check_keys("proposal scales", prior, scales)?;
        let mut ordered_center = Params::new();
        let mut ordered_scales = Params::new();
        for name in prior.names() {
            let c = center[name];
            let s = scales[name];
            if !c.is_finite() {
                return Err(SmcError::value_error("proposal center", format!("{name} = {c}")));
            }
            check_scale("proposal scales", s)?;
            ordered_center.insert(name.to_string(), c);
            ordered_scales.insert(name.to_string(), s);
        }
        Ok(Self {
            center: ordered_center,
            scales: ordered_scales,
        })
    }

    pub fn center(&self) -> &Params {
        &self.center
    }

    pub fn scales(&self) -> &Params {
        &self.scales
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Params {
        self.center
            .iter()
            .zip(self.scales.values())
            .map(|((name, c), s)| (name.clone(), c + s * rng.sample::<f64, _>(StandardNormal)))
            .collect()
    }

    pub fn log_density(&self, params: &Params) -> f64 {
        self.center
            .iter()
            .zip(self.scales.values())
            .map(|((name, &c), &s)| match params.get(name) {
                Some(&x) => normal_log_density(x, c, s),
                None => f64::NEG_INFINITY,
            })
            .sum()
    }
}

pub(crate) fn check_keys(field: &str, prior: &Prior, values: &Params) -> Result<()> {
    if let Some(extra) = values.keys().find(|k| prior.get(k.as_str()).is_none()) {
        return Err(SmcError::key_error(field, extra));
    }
    if let Some(missing) = prior.names().into_iter().find(|k| !values.contains_key(*k)) {
        return Err(SmcError::key_error(field, missing));
    }
    Ok(())
}

#[cfg(test)]
mod distributions_tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn prior() -> Prior {
        Prior::new()
            .with("a", Distribution::uniform(-10.0, 10.0).unwrap())
            .with("b", Distribution::normal(1.0, 2.0).unwrap())
    }

    #[test]
    fn spec_checks_kind_and_arity() {
        assert!(matches!(
            Distribution::from_spec("Beta", &[1.0, 1.0]),
            Err(SmcError::Key { .. })
        ));
        assert!(matches!(
            Distribution::from_spec("Uniform", &[1.0]),
            Err(SmcError::Value { .. })
        ));
        assert!(matches!(
            Distribution::from_spec("Uniform", &[2.0, 1.0]),
            Err(SmcError::Value { .. })
        ));
        assert!(matches!(
            Distribution::from_spec("Normal", &[0.0, -1.0]),
            Err(SmcError::Value { .. })
        ));
        assert_eq!(
            Distribution::from_spec("Exponential", &[2.0]).unwrap(),
            Distribution::Exponential { rate: 2.0 }
        );
    }

    #[test]
    fn json_spec_type_errors() {
        let bad = serde_json::json!("Uniform");
        assert!(matches!(Distribution::from_json("a", &bad), Err(SmcError::Type { .. })));
        let bad = serde_json::json!(["Uniform", "0", 1.0]);
        assert!(matches!(Distribution::from_json("a", &bad), Err(SmcError::Type { .. })));
        let good = serde_json::json!(["Uniform", 0, 1.5]);
        assert_eq!(
            Distribution::from_json("a", &good).unwrap(),
            Distribution::Uniform { lower: 0.0, upper: 1.5 }
        );
    }

    #[test]
    fn uniform_density_and_support() {
        let d = Distribution::uniform(0.0, 4.0).unwrap();
        assert_abs_diff_eq!(d.log_density(1.0), -(4f64.ln()), epsilon = 1e-12);
        assert_eq!(d.log_density(-0.1), f64::NEG_INFINITY);
        assert_eq!(d.log_density(f64::NAN), f64::NEG_INFINITY);
    }

    #[test]
    fn normal_density_matches_closed_form() {
        let d = Distribution::normal(0.0, 1.0).unwrap();
        assert_abs_diff_eq!(d.log_density(1.0).exp(), 0.24197072451914337, epsilon = 1e-12);
        let h = Distribution::half_normal(1.0).unwrap();
        assert_abs_diff_eq!(h.log_density(1.0).exp(), 2.0 * 0.24197072451914337, epsilon = 1e-12);
        assert_eq!(h.log_density(-1.0), f64::NEG_INFINITY);
    }

    #[test]
    fn samples_stay_in_support() {
        let mut rng = SmallRng::seed_from_u64(3);
        let dists = [
            Distribution::uniform(2.0, 3.0).unwrap(),
            Distribution::half_normal(0.5).unwrap(),
            Distribution::exponential(4.0).unwrap(),
        ];
        for d in dists {
            for _ in 0..1_000 {
                assert!(d.in_support(d.sample(&mut rng)));
            }
        }
    }

    #[test]
    fn prior_joint_density_and_violation() {
        let prior = prior();
        let mut params = Params::new();
        params.insert("a".into(), 0.0);
        params.insert("b".into(), 1.0);
        let expected = -(20f64.ln()) + normal_log_density(1.0, 1.0, 2.0);
        assert_abs_diff_eq!(prior.log_density(&params), expected, epsilon = 1e-12);
        assert!(prior.support_violation(&params).is_none());

        params.insert("a".into(), 11.0);
        assert_eq!(prior.log_density(&params), f64::NEG_INFINITY);
        assert_eq!(prior.support_violation(&params), Some(("a".to_string(), 11.0)));
    }

    #[test]
    fn proposal_requires_matching_keys() {
        let prior = prior();
        let center: Params = [("a".to_string(), 1.0), ("jabroni".to_string(), 2.0)].into();
        let scales: Params = [("a".to_string(), 1.0), ("b".to_string(), 2.0)].into();
        assert!(matches!(
            ProposalDistribution::new(&prior, &center, &scales),
            Err(SmcError::Key { .. })
        ));
    }

    #[test]
    fn proposal_is_ordered_like_prior() {
        let prior = prior();
        let center: Params = [("b".to_string(), 1.0), ("a".to_string(), 2.0)].into();
        let scales: Params = [("a".to_string(), 0.1), ("b".to_string(), 0.2)].into();
        let proposal = ProposalDistribution::new(&prior, &center, &scales).unwrap();
        let mut rng = SmallRng::seed_from_u64(1);
        let drawn = proposal.sample(&mut rng);
        assert_eq!(drawn.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(proposal.log_density(&drawn).is_finite());
    }
}
