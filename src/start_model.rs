use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::{PlattCalibration, expected_calibration_error, reliability_bins};
use crate::error::{Stage, XMinsError, XResult};
use crate::features::{FeatureVector, check_names, mean, sample_std, stack_vectors};
use crate::linear::{LinearFit, fit_logistic};
use crate::metrics::{ClassificationMetrics, evaluate_classifier, roc_auc};

pub const MIN_TRAINING_SAMPLES: usize = 50;
pub const CV_FOLDS: usize = 3;
const DEFAULT_L2: f64 = 1e-3;
const RELIABILITY_BINS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub name: String,
    pub weight: f64,
}

pub fn rank_importance(names: &[String], fit: &LinearFit) -> Vec<FeatureImportance> {
    let mut out: Vec<FeatureImportance> = names
        .iter()
        .zip(&fit.coeffs)
        .map(|(name, w)| FeatureImportance {
            name: name.clone(),
            weight: *w,
        })
        .collect();
    out.sort_by(|a, b| b.weight.abs().total_cmp(&a.weight.abs()));
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartModelState {
    pub feature_names: Vec<String>,
    pub fit: LinearFit,
    pub calibration: Option<PlattCalibration>,
    /// Weight applied to each started sample, `n_not_started / n_started`.
    pub positive_weight: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartTrainingReport {
    pub samples: usize,
    pub features: usize,
    pub positives: usize,
    pub positive_weight: f64,
    pub calibrated: bool,
    pub out_of_fold: ClassificationMetrics,
    pub out_of_fold_calibrated: ClassificationMetrics,
    pub cv_auc_mean: f64,
    pub cv_auc_std: f64,
    pub expected_calibration_error: f64,
    pub train: ClassificationMetrics,
}

#[derive(Debug, Clone)]
pub struct StartProbabilityEstimator {
    state: Option<StartModelState>,
    l2: f64,
}

impl Default for StartProbabilityEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl StartProbabilityEstimator {
    pub fn new() -> Self {
        Self {
            state: None,
            l2: DEFAULT_L2,
        }
    }

    pub fn with_l2(mut self, l2: f64) -> Self {
        self.l2 = l2.max(0.0);
        self
    }

    pub fn from_state(state: StartModelState) -> Self {
        Self {
            state: Some(state),
            l2: DEFAULT_L2,
        }
    }

    pub fn state(&self) -> Option<&StartModelState> {
        self.state.as_ref()
    }

    pub fn is_trained(&self) -> bool {
        self.state.is_some()
    }

    /// Fits the classifier and its Platt calibration. Any error leaves a
    /// previously fitted state untouched.
    pub fn train(&mut self, vectors: &[FeatureVector], labels: &[bool]) -> XResult<StartTrainingReport> {
        if vectors.len() != labels.len() {
            return Err(XMinsError::InvalidInput(format!(
                "{} feature vectors but {} labels",
                vectors.len(),
                labels.len()
            )));
        }
        if vectors.len() < MIN_TRAINING_SAMPLES {
            return Err(XMinsError::InsufficientData {
                stage: Stage::Start,
                got: vectors.len(),
                need: MIN_TRAINING_SAMPLES,
            });
        }
        let (names, rows) = stack_vectors(vectors)?;
        let positives = labels.iter().filter(|y| **y).count();
        if positives == 0 || positives == labels.len() {
            return Err(XMinsError::InvalidInput(
                "start labels contain a single class".into(),
            ));
        }

        let positive_weight = (labels.len() - positives) as f64 / positives as f64;
        let weights: Vec<f64> = labels
            .iter()
            .map(|y| if *y { positive_weight } else { 1.0 })
            .collect();
        let targets: Vec<f64> = labels.iter().map(|y| if *y { 1.0 } else { 0.0 }).collect();

        let oof = out_of_fold_probs(&rows, &targets, &weights, self.l2);
        let calibration = PlattCalibration::fit(&oof, labels);
        let calibrated_oof: Vec<f64> = match calibration {
            Some(c) => oof.iter().map(|p| c.apply(*p)).collect(),
            None => oof.clone(),
        };

        let fold_aucs: Vec<f64> = (0..CV_FOLDS)
            .map(|fold| {
                let (p, y): (Vec<f64>, Vec<bool>) = (0..oof.len())
                    .filter(|i| i % CV_FOLDS == fold)
                    .map(|i| (oof[i], labels[i]))
                    .unzip();
                roc_auc(&p, &y)
            })
            .collect();

        let fit = fit_logistic(&rows, &targets, &weights, self.l2);
        let in_sample: Vec<f64> = rows
            .iter()
            .map(|r| {
                let raw = fit.prob(r);
                calibration.map(|c| c.apply(raw)).unwrap_or(raw)
            })
            .collect();
        let report = StartTrainingReport {
            samples: labels.len(),
            features: names.len(),
            positives,
            positive_weight,
            calibrated: calibration.is_some(),
            out_of_fold: evaluate_classifier(&oof, labels),
            out_of_fold_calibrated: evaluate_classifier(&calibrated_oof, labels),
            cv_auc_mean: mean(&fold_aucs),
            cv_auc_std: sample_std(&fold_aucs),
            expected_calibration_error: expected_calibration_error(&reliability_bins(
                &calibrated_oof,
                labels,
                RELIABILITY_BINS,
            )),
            train: evaluate_classifier(&in_sample, labels),
        };
        debug!(
            samples = report.samples,
            positives,
            auc = report.out_of_fold_calibrated.auc,
            "start stage fitted"
        );

        self.state = Some(StartModelState {
            feature_names: names,
            fit,
            calibration,
            positive_weight,
        });
        Ok(report)
    }

    pub fn predict(&self, vector: &FeatureVector) -> XResult<f64> {
        let state = self.state.as_ref().ok_or(XMinsError::NotTrained(Stage::Start))?;
        check_names(&state.feature_names, vector.names())?;
        vector.check_finite()?;
        let raw = state.fit.prob(vector.values());
        let p = match state.calibration {
            Some(c) => c.apply(raw),
            None => raw,
        };
        Ok(p.clamp(0.0, 1.0))
    }

    pub fn evaluate(&self, vectors: &[FeatureVector], labels: &[bool]) -> XResult<ClassificationMetrics> {
        let probs = vectors
            .iter()
            .map(|v| self.predict(v))
            .collect::<XResult<Vec<f64>>>()?;
        Ok(evaluate_classifier(&probs, labels))
    }

    pub fn feature_importance(&self) -> XResult<Vec<FeatureImportance>> {
        let state = self.state.as_ref().ok_or(XMinsError::NotTrained(Stage::Start))?;
        Ok(rank_importance(&state.feature_names, &state.fit))
    }
}

fn out_of_fold_probs(rows: &[Vec<f64>], targets: &[f64], weights: &[f64], l2: f64) -> Vec<f64> {
    let mut out = vec![0.5; rows.len()];
    for fold in 0..CV_FOLDS {
        let (mut tr_rows, mut tr_y, mut tr_w) = (Vec::new(), Vec::new(), Vec::new());
        for i in (0..rows.len()).filter(|i| i % CV_FOLDS != fold) {
            tr_rows.push(rows[i].clone());
            tr_y.push(targets[i]);
            tr_w.push(weights[i]);
        }
        if tr_rows.is_empty() {
            continue;
        }
        let fit = fit_logistic(&tr_rows, &tr_y, &tr_w, l2);
        for i in (0..rows.len()).filter(|i| i % CV_FOLDS == fold) {
            out[i] = fit.prob(&rows[i]);
        }
    }
    out
}
