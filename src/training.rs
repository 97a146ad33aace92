use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::appearance::{MatchContext, PeriodKey, PlayerHistory};
use crate::calibration::{CalibrationBin, reliability_bins};
use crate::combiner::{Combiner, Diagnostics, SquadPriors, StageOutputs};
use crate::config::PipelineConfig;
use crate::error::XResult;
use crate::features::{FeatureDeriver, FeatureSchema, FeatureVector};
use crate::metrics::{
    ClassificationMetrics, CombinedMetrics, RegressionMetrics, evaluate_classifier,
    evaluate_combined, evaluate_regression,
};
use crate::minutes_model::{ConditionalMinutesEstimator, MinutesLabel, MinutesTrainingReport};
use crate::pipeline::ModelBundle;
use crate::start_model::{StartProbabilityEstimator, StartTrainingReport};

const HOLDOUT_RELIABILITY_BINS: usize = 10;

/// One labeled example: features from strictly earlier appearances, labels
/// from the target appearance itself.
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub player_id: String,
    pub target: PeriodKey,
    pub vector: FeatureVector,
    pub started: bool,
    pub minutes: u16,
    /// Target record was a red card, forced exit or implausibly short start.
    pub outlier: bool,
    pub usable_history: usize,
    pub role_lock: bool,
    pub recent_outlier: bool,
}

impl TrainingSample {
    pub fn minutes_label(&self) -> MinutesLabel {
        MinutesLabel {
            started: self.started,
            minutes: self.minutes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HoldoutReport {
    pub samples: usize,
    pub start: ClassificationMetrics,
    pub minutes: RegressionMetrics,
    /// Combined xMins against true minutes, zeros for non-starts included.
    pub combined: CombinedMetrics,
    pub reliability: Vec<CalibrationBin>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub trained_at: DateTime<Utc>,
    pub players: usize,
    pub samples: usize,
    pub train_samples: usize,
    pub holdout_samples: usize,
    pub excluded_outlier_targets: usize,
    pub schema_fingerprint: String,
    pub start: StartTrainingReport,
    pub minutes: MinutesTrainingReport,
    pub holdout: HoldoutReport,
}

pub fn build_samples(
    histories: &[PlayerHistory],
    cfg: &PipelineConfig,
    schema: &FeatureSchema,
) -> Vec<TrainingSample> {
    histories
        .par_iter()
        .map(|h| player_samples(h, cfg, schema))
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect()
}

fn player_samples(
    history: &PlayerHistory,
    cfg: &PipelineConfig,
    schema: &FeatureSchema,
) -> Vec<TrainingSample> {
    let deriver = FeatureDeriver::new(&cfg.features);
    let floor = cfg.features.short_start_floor;
    let mut out = Vec::new();
    for target in history.appearances.iter().filter(|a| !a.is_corrupt()) {
        let key = target.key();
        let filtered = deriver.filter(&history.appearances, &key);
        if filtered.raw().len() < cfg.training.min_history {
            continue;
        }
        let ctx = MatchContext {
            is_home: target.is_home,
            kickoff: target.kickoff,
            ..MatchContext::default()
        };
        let derived = deriver.derive(schema, &filtered, &history.profile, &ctx, &key);
        out.push(TrainingSample {
            player_id: history.profile.player_id.clone(),
            target: key,
            vector: derived.vector,
            started: target.started,
            minutes: target.minutes,
            outlier: target.is_outlier_event(floor),
            usable_history: derived.usable_history,
            role_lock: derived.role_lock,
            recent_outlier: derived.recent_outlier,
        });
    }
    out
}

/// Seeded split that holds out `fraction` of the starts and `fraction` of the
/// non-starts, so both sides keep the overall start rate.
pub fn split_holdout(
    samples: Vec<TrainingSample>,
    fraction: f64,
    seed: u64,
) -> (Vec<TrainingSample>, Vec<TrainingSample>) {
    let fraction = fraction.clamp(0.0, 1.0);
    let mut rng = StdRng::seed_from_u64(seed);
    let (starts, benched): (Vec<_>, Vec<_>) = samples.into_iter().partition(|s| s.started);
    let mut train = Vec::new();
    let mut holdout = Vec::new();
    for mut class in [starts, benched] {
        class.shuffle(&mut rng);
        let n_holdout = ((class.len() as f64) * fraction).floor() as usize;
        train.extend(class.split_off(n_holdout));
        holdout.extend(class);
    }
    train.shuffle(&mut rng);
    holdout.shuffle(&mut rng);
    (train, holdout)
}

pub fn train(histories: &[PlayerHistory], cfg: &PipelineConfig) -> XResult<(ModelBundle, TrainingReport)> {
    train_with_schema(histories, cfg, cfg.schema())
}

/// Builds samples, fits both stages with out-of-fold calibration, and scores
/// the holdout. Nothing is returned unless every step succeeds.
pub fn train_with_schema(
    histories: &[PlayerHistory],
    cfg: &PipelineConfig,
    schema: FeatureSchema,
) -> XResult<(ModelBundle, TrainingReport)> {
    let samples = build_samples(histories, cfg, &schema);
    let total = samples.len();
    let (train_set, holdout) =
        split_holdout(samples, cfg.training.holdout_fraction, cfg.training.seed);
    info!(
        players = histories.len(),
        samples = total,
        train = train_set.len(),
        holdout = holdout.len(),
        "training samples built"
    );

    let vectors: Vec<FeatureVector> = train_set.iter().map(|s| s.vector.clone()).collect();
    let started: Vec<bool> = train_set.iter().map(|s| s.started).collect();
    let mut start = StartProbabilityEstimator::new().with_l2(cfg.training.start_l2);
    let start_report = start.train(&vectors, &started)?;

    let (minutes_vectors, minutes_labels, excluded) =
        minutes_stage_inputs(&train_set, cfg.training.exclude_outlier_targets);
    if excluded > 0 {
        info!(excluded, "outlier targets left out of the minutes stage");
    }
    let mut minutes = ConditionalMinutesEstimator::new()
        .with_l2(cfg.training.minutes_l2)
        .with_match_length(cfg.combiner.match_length);
    let minutes_report = minutes.train(&minutes_vectors, &minutes_labels)?;

    let squad_priors = SquadPriors::from_histories(histories, cfg.combiner.team_prior_min_appearances);
    let bundle = ModelBundle::from_parts(cfg.clone(), schema, start, minutes, None)?
        .with_squad_priors(squad_priors);
    let holdout_report = evaluate_holdout(&bundle, &holdout, &cfg.training.tolerances)?;
    info!(
        start_auc = start_report.out_of_fold_calibrated.auc,
        minutes_mae = minutes_report.out_of_fold_calibrated.mae,
        holdout_mae = holdout_report.combined.mae,
        "two-stage model trained"
    );
    for t in &holdout_report.combined.within {
        info!(tolerance = t.tolerance, rate = t.rate, "holdout accuracy");
    }

    let report = TrainingReport {
        trained_at: Utc::now(),
        players: histories.len(),
        samples: total,
        train_samples: train_set.len(),
        holdout_samples: holdout.len(),
        excluded_outlier_targets: excluded,
        schema_fingerprint: bundle.fingerprint().to_string(),
        start: start_report,
        minutes: minutes_report,
        holdout: holdout_report,
    };
    Ok((bundle.with_report(report.clone()), report))
}

fn minutes_stage_inputs(
    train_set: &[TrainingSample],
    exclude_outliers: bool,
) -> (Vec<FeatureVector>, Vec<MinutesLabel>, usize) {
    let mut vectors = Vec::new();
    let mut labels = Vec::new();
    let mut excluded = 0usize;
    for s in train_set.iter().filter(|s| s.started) {
        if exclude_outliers && s.outlier {
            excluded += 1;
            continue;
        }
        vectors.push(s.vector.clone());
        labels.push(s.minutes_label());
    }
    (vectors, labels, excluded)
}

pub fn evaluate_holdout(
    bundle: &ModelBundle,
    holdout: &[TrainingSample],
    tolerances: &[u16],
) -> XResult<HoldoutReport> {
    if holdout.is_empty() {
        warn!("empty holdout, skipping evaluation");
        return Ok(HoldoutReport::default());
    }
    let cfg = bundle.config();
    let combiner = Combiner::new(&cfg.combiner, &cfg.model_version, Some(bundle.fingerprint()));

    let mut start_probs = Vec::with_capacity(holdout.len());
    let mut started = Vec::with_capacity(holdout.len());
    let mut combined = Vec::with_capacity(holdout.len());
    let mut actual = Vec::with_capacity(holdout.len());
    let mut cond_pred = Vec::new();
    let mut cond_actual = Vec::new();

    for s in holdout {
        let p = bundle.start_model().predict(&s.vector)?;
        let m = bundle.minutes_model().predict(&s.vector)?;
        let result = combiner.combine(
            &s.player_id,
            &s.target,
            StageOutputs {
                start_prob: p,
                xmins_start: m,
                full_match_given_start: None,
            },
            Diagnostics {
                usable_history: s.usable_history,
                role_lock: s.role_lock,
                recent_outlier: s.recent_outlier,
            },
        );
        start_probs.push(p);
        started.push(s.started);
        combined.push(result.xmins);
        actual.push(s.minutes as f64);
        if s.started {
            cond_pred.push(m);
            cond_actual.push(s.minutes as f64);
        }
    }

    Ok(HoldoutReport {
        samples: holdout.len(),
        start: evaluate_classifier(&start_probs, &started),
        minutes: evaluate_regression(&cond_pred, &cond_actual),
        combined: evaluate_combined(&combined, &actual, tolerances),
        reliability: reliability_bins(&start_probs, &started, HOLDOUT_RELIABILITY_BINS),
    })
}
