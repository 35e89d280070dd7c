//! Error taxonomy shared by every pipeline stage.
//!
//! Components return the most specific kind they can; the pipeline wraps
//! failures in [`PipelineError::Stage`] so a report names where a run died.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Pipeline stage that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validation,
    Features,
    Regime,
    Signals,
    Performance,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validation => "validation",
            Stage::Features => "features",
            Stage::Regime => "regime",
            Stage::Signals => "signals",
            Stage::Performance => "performance",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification, stable across stage wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Data,
    Convergence,
    DegenerateSeries,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or out-of-contract input.
    #[error("data error: {0}")]
    Data(String),

    /// The HMM fit could not produce a well-formed probability model.
    #[error("convergence error: {0}")]
    Convergence(String),

    /// A metric is undefined for the given series.
    #[error("degenerate series: {0}")]
    DegenerateSeries(String),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn data(msg: impl Into<String>) -> Self {
        PipelineError::Data(msg.into())
    }

    pub fn convergence(msg: impl Into<String>) -> Self {
        PipelineError::Convergence(msg.into())
    }

    pub fn degenerate(msg: impl Into<String>) -> Self {
        PipelineError::DegenerateSeries(msg.into())
    }

    /// Tag this error with the stage it escaped from. Already-tagged errors
    /// keep their original stage.
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            PipelineError::Stage { .. } => self,
            other => PipelineError::Stage { stage, source: Box::new(other) },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Data(_) => ErrorKind::Data,
            PipelineError::Convergence(_) => ErrorKind::Convergence,
            PipelineError::DegenerateSeries(_) => ErrorKind::DegenerateSeries,
            PipelineError::Stage { source, .. } => source.kind(),
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_survives_stage_wrapping() {
        let err = PipelineError::convergence("covariance not positive definite")
            .in_stage(Stage::Regime);
        assert_eq!(err.kind(), ErrorKind::Convergence);
        assert_eq!(err.stage(), Some(Stage::Regime));
        assert!(err.to_string().starts_with("regime stage failed"));
    }

    #[test]
    fn test_in_stage_keeps_first_stage() {
        let err = PipelineError::data("bad close")
            .in_stage(Stage::Features)
            .in_stage(Stage::Performance);
        assert_eq!(err.stage(), Some(Stage::Features));
    }
}
