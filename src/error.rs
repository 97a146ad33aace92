use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    Minutes,
    Pipeline,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Start => "start-probability",
            Stage::Minutes => "conditional-minutes",
            Stage::Pipeline => "two-stage pipeline",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum XMinsError {
    #[error("insufficient training data for {stage} stage: {got} samples, need at least {need}")]
    InsufficientData { stage: Stage, got: usize, need: usize },

    #[error("{0} model has not been trained")]
    NotTrained(Stage),

    #[error("feature schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("a training run is already in progress")]
    TrainingInProgress,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type XResult<T> = std::result::Result<T, XMinsError>;
