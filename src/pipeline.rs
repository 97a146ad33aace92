use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::appearance::{Appearance, MatchContext, PeriodKey, PlayerHistory, PlayerProfile};
use crate::combiner::{Combiner, Diagnostics, PredictionResult, SquadPriors, StageOutputs, resolve_prior};
use crate::config::PipelineConfig;
use crate::error::{Stage, XMinsError, XResult};
use crate::features::{FeatureDeriver, FeatureSchema, check_names};
use crate::minutes_model::ConditionalMinutesEstimator;
use crate::start_model::StartProbabilityEstimator;
use crate::training::{self, TrainingReport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub target: PeriodKey,
    pub profile: PlayerProfile,
    #[serde(default)]
    pub history: Vec<Appearance>,
    #[serde(default)]
    pub context: MatchContext,
}

impl PredictionRequest {
    pub fn player_id(&self) -> &str {
        &self.profile.player_id
    }

    fn validate(&self) -> XResult<()> {
        if self.profile.player_id.trim().is_empty() {
            return Err(XMinsError::InvalidInput("empty player id".into()));
        }
        if self.target.period == 0 {
            return Err(XMinsError::InvalidInput(format!(
                "player {}: target period must be positive",
                self.profile.player_id
            )));
        }
        Ok(())
    }
}

/// Fitted stages plus the exact schema they were trained against. Immutable
/// once built; shared between requests behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ModelBundle {
    config: PipelineConfig,
    schema: FeatureSchema,
    fingerprint: String,
    start: StartProbabilityEstimator,
    minutes: ConditionalMinutesEstimator,
    squad_priors: SquadPriors,
    report: Option<TrainingReport>,
}

impl ModelBundle {
    /// Both stages must be trained on exactly `schema.names`.
    pub fn from_parts(
        config: PipelineConfig,
        schema: FeatureSchema,
        start: StartProbabilityEstimator,
        minutes: ConditionalMinutesEstimator,
        report: Option<TrainingReport>,
    ) -> XResult<Self> {
        let start_names = &start
            .state()
            .ok_or(XMinsError::NotTrained(Stage::Start))?
            .feature_names;
        check_names(&schema.names, start_names)?;
        let minutes_names = &minutes
            .state()
            .ok_or(XMinsError::NotTrained(Stage::Minutes))?
            .feature_names;
        check_names(&schema.names, minutes_names)?;

        Ok(Self {
            fingerprint: schema.fingerprint(),
            config,
            schema,
            start,
            minutes,
            squad_priors: SquadPriors::default(),
            report,
        })
    }

    pub fn with_squad_priors(mut self, squad_priors: SquadPriors) -> Self {
        self.squad_priors = squad_priors;
        self
    }

    pub fn with_report(mut self, report: TrainingReport) -> Self {
        self.report = Some(report);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn model_version(&self) -> &str {
        &self.config.model_version
    }

    pub fn start_model(&self) -> &StartProbabilityEstimator {
        &self.start
    }

    pub fn minutes_model(&self) -> &ConditionalMinutesEstimator {
        &self.minutes
    }

    pub fn squad_priors(&self) -> &SquadPriors {
        &self.squad_priors
    }

    pub fn report(&self) -> Option<&TrainingReport> {
        self.report.as_ref()
    }

    pub fn predict(&self, req: &PredictionRequest) -> XResult<PredictionResult> {
        req.validate()?;
        let deriver = FeatureDeriver::new(&self.config.features);
        let combiner = Combiner::new(
            &self.config.combiner,
            &self.config.model_version,
            Some(&self.fingerprint),
        );
        let prior = resolve_prior(&self.config.combiner, &self.squad_priors, &req.profile);

        let history = deriver.filter(&req.history, &req.target);
        if history.is_empty() {
            debug!(player = req.player_id(), "no prior appearances, using prior");
            return Ok(combiner.prior(req.player_id(), &req.target, prior, Diagnostics::default()));
        }

        let derived = deriver.derive(&self.schema, &history, &req.profile, &req.context, &req.target);
        let diag = Diagnostics {
            usable_history: derived.usable_history,
            role_lock: derived.role_lock,
            recent_outlier: derived.recent_outlier,
        };
        if derived.computed_count() == 0 {
            debug!(player = req.player_id(), "no schema feature computable, using prior");
            return Ok(combiner.prior(req.player_id(), &req.target, prior, diag));
        }

        self.schema.validate(&derived.vector)?;
        let start_prob = self.start.predict(&derived.vector)?;
        let xmins_start = self.minutes.predict(&derived.vector)?;
        let full_match_given_start = self.minutes.predict_full_match(&derived.vector)?;

        Ok(combiner.combine(
            req.player_id(),
            &req.target,
            StageOutputs {
                start_prob,
                xmins_start,
                full_match_given_start,
            },
            diag,
        ))
    }

    /// Results for every request that succeeded, in request order. Failures
    /// are logged and skipped.
    pub fn batch_predict(&self, requests: &[PredictionRequest]) -> Vec<PredictionResult> {
        let results: Vec<PredictionResult> = requests
            .par_iter()
            .filter_map(|req| match self.predict(req) {
                Ok(result) => Some(result),
                Err(err) => {
                    warn!(player = req.player_id(), error = %err, "prediction failed, skipping");
                    None
                }
            })
            .collect();
        if results.len() < requests.len() {
            warn!(
                requested = requests.len(),
                predicted = results.len(),
                "batch completed with failures"
            );
        }
        results
    }
}

/// Holds the published bundle. Readers take an `Arc` snapshot; a retrain
/// builds a fresh bundle and swaps it in only on success.
#[derive(Debug, Default)]
pub struct ModelHandle {
    current: RwLock<Option<Arc<ModelBundle>>>,
    training: Mutex<()>,
}

pub struct TrainingGuard<'a> {
    _slot: MutexGuard<'a, ()>,
}

impl ModelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bundle(bundle: ModelBundle) -> Self {
        let handle = Self::new();
        handle.publish(bundle);
        handle
    }

    pub fn snapshot(&self) -> Option<Arc<ModelBundle>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn publish(&self, bundle: ModelBundle) -> Arc<ModelBundle> {
        let bundle = Arc::new(bundle);
        let mut slot = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(Arc::clone(&bundle));
        info!(
            version = bundle.model_version(),
            fingerprint = bundle.fingerprint(),
            "model bundle published"
        );
        bundle
    }

    pub fn try_begin_training(&self) -> XResult<TrainingGuard<'_>> {
        match self.training.try_lock() {
            Ok(slot) => Ok(TrainingGuard { _slot: slot }),
            Err(TryLockError::WouldBlock) => Err(XMinsError::TrainingInProgress),
            Err(TryLockError::Poisoned(poisoned)) => Ok(TrainingGuard {
                _slot: poisoned.into_inner(),
            }),
        }
    }

    /// Trains a new bundle and publishes it. On any error the previously
    /// published bundle stays in service.
    pub fn retrain(&self, histories: &[PlayerHistory], cfg: &PipelineConfig) -> XResult<TrainingReport> {
        let _guard = self.try_begin_training()?;
        match training::train(histories, cfg) {
            Ok((bundle, report)) => {
                self.publish(bundle);
                Ok(report)
            }
            Err(err) => {
                warn!(error = %err, "training failed, keeping current model");
                Err(err)
            }
        }
    }

    pub fn predict(&self, req: &PredictionRequest) -> XResult<PredictionResult> {
        let bundle = self.snapshot().ok_or(XMinsError::NotTrained(Stage::Pipeline))?;
        bundle.predict(req)
    }

    pub fn batch_predict(&self, requests: &[PredictionRequest]) -> XResult<Vec<PredictionResult>> {
        let bundle = self.snapshot().ok_or(XMinsError::NotTrained(Stage::Pipeline))?;
        Ok(bundle.batch_predict(requests))
    }
}
