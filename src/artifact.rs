use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::combiner::SquadPriors;
use crate::config::PipelineConfig;
use crate::error::{Stage, XMinsError, XResult};
use crate::features::FeatureSchema;
use crate::minutes_model::{ConditionalMinutesEstimator, MinutesModelState};
use crate::pipeline::ModelBundle;
use crate::start_model::{StartModelState, StartProbabilityEstimator};
use crate::training::TrainingReport;

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub model_version: String,
    pub generated_at: DateTime<Utc>,
    pub config: PipelineConfig,
    pub schema: FeatureSchema,
    pub schema_fingerprint: String,
    /// Schema was rebuilt from `config.features` rather than supplied.
    pub schema_from_config: bool,
    pub start: StartModelState,
    pub minutes: MinutesModelState,
    #[serde(default)]
    pub squad_priors: SquadPriors,
    #[serde(default)]
    pub report: Option<TrainingReport>,
}

impl ModelArtifact {
    pub fn from_bundle(bundle: &ModelBundle) -> XResult<Self> {
        let start = bundle
            .start_model()
            .state()
            .cloned()
            .ok_or(XMinsError::NotTrained(Stage::Start))?;
        let minutes = bundle
            .minutes_model()
            .state()
            .cloned()
            .ok_or(XMinsError::NotTrained(Stage::Minutes))?;
        let config = bundle.config().clone();
        Ok(Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            model_version: config.model_version.clone(),
            generated_at: Utc::now(),
            schema_from_config: config.schema() == *bundle.schema(),
            config,
            schema: bundle.schema().clone(),
            schema_fingerprint: bundle.fingerprint().to_string(),
            start,
            minutes,
            squad_priors: bundle.squad_priors().clone(),
            report: bundle.report().cloned(),
        })
    }

    pub fn into_bundle(self) -> XResult<ModelBundle> {
        if self.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(XMinsError::SchemaMismatch(format!(
                "artifact format {} is not supported (expected {})",
                self.format_version, ARTIFACT_FORMAT_VERSION
            )));
        }
        let fingerprint = self.schema.fingerprint();
        if fingerprint != self.schema_fingerprint {
            return Err(XMinsError::SchemaMismatch(format!(
                "stored fingerprint {} does not match schema {}",
                self.schema_fingerprint, fingerprint
            )));
        }
        if self.schema_from_config && self.config.schema() != self.schema {
            return Err(XMinsError::SchemaMismatch(
                "feature config no longer produces the stored schema".into(),
            ));
        }
        let bundle = ModelBundle::from_parts(
            self.config,
            self.schema,
            StartProbabilityEstimator::from_state(self.start),
            ConditionalMinutesEstimator::from_state(self.minutes),
            self.report,
        )?;
        Ok(bundle.with_squad_priors(self.squad_priors))
    }
}

pub fn save_artifact(path: &Path, bundle: &ModelBundle) -> Result<()> {
    let artifact = ModelArtifact::from_bundle(bundle)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create artifact dir {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(&artifact).context("serialize model artifact")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("swap {}", path.display()))?;
    info!(path = %path.display(), fingerprint = %artifact.schema_fingerprint, "artifact saved");
    Ok(())
}

pub fn load_artifact(path: &Path) -> Result<ModelBundle> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let artifact: ModelArtifact =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    let bundle = artifact
        .into_bundle()
        .with_context(|| format!("verify {}", path.display()))?;
    info!(
        path = %path.display(),
        version = bundle.model_version(),
        "artifact loaded"
    );
    Ok(bundle)
}
