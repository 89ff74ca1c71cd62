//! Error type shared by every stage of a sampling run.

use thiserror::Error;

/// Errors raised while configuring or running the sampler.
///
/// Configuration problems (`Type`, `Value`, `Key`) are always reported before any
/// particle is drawn. `Support` and `Restart` are fatal run errors.
#[derive(Error, Debug)]
pub enum SmcError {
    #[error("invalid type for `{field}`: expected {expected}")]
    Type { field: String, expected: String },
    #[error("invalid value for `{field}`: {reason}")]
    Value { field: String, reason: String },
    #[error("unknown or missing key `{key}` in `{field}`")]
    Key { field: String, key: String },
    /// A proposal-drawn initial particle lies outside the prior support (or has a
    /// non-finite log-likelihood). It is a bad input value, and [`SmcError::kind`]
    /// reports it as `"value"`; the variant keeps the offending parameter.
    #[error("initial particle outside prior support: {param} = {value}")]
    Support { param: String, value: f64 },
    #[error("cannot restart from stage {stage}: {reason}")]
    Restart { stage: i64, reason: String },
    #[error("model evaluation failed: {0}")]
    Model(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("communication error: {0}")]
    Communication(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[cfg(feature = "csv")]
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, SmcError>;

impl SmcError {
    pub(crate) fn type_error(field: &str, expected: &str) -> Self {
        SmcError::Type {
            field: field.to_string(),
            expected: expected.to_string(),
        }
    }

    pub(crate) fn value_error(field: &str, reason: impl Into<String>) -> Self {
        SmcError::Value {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn key_error(field: &str, key: &str) -> Self {
        SmcError::Key {
            field: field.to_string(),
            key: key.to_string(),
        }
    }

    /// Short name of the error category, as used in diagnostics. Support violations
    /// belong to the `"value"` category.
    pub fn kind(&self) -> &'static str {
        match self {
            SmcError::Type { .. } => "type",
            SmcError::Value { .. } | SmcError::Support { .. } => "value",
            SmcError::Key { .. } => "key",
            SmcError::Restart { .. } => "restart",
            SmcError::Model(_) => "model",
            SmcError::Checkpoint(_) => "checkpoint",
            SmcError::Communication(_) => "communication",
            SmcError::Io(_) => "io",
            #[cfg(feature = "csv")]
            SmcError::Csv(_) => "csv",
        }
    }
}
