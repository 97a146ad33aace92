use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::IsotonicCalibration;
use crate::error::{Stage, XMinsError, XResult};
use crate::features::{FeatureVector, check_names, stack_vectors};
use crate::linear::{LinearFit, fit_logistic, fit_ridge};
use crate::metrics::{RegressionMetrics, evaluate_classifier, evaluate_regression};
use crate::start_model::{CV_FOLDS, FeatureImportance, MIN_TRAINING_SAMPLES, rank_importance};

pub const MATCH_LENGTH: f64 = 90.0;
pub const FULL_MATCH_MINUTES: u16 = 90;
const DEFAULT_L2: f64 = 1e-3;
const CLASSIFIER_L2: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinutesLabel {
    pub started: bool,
    pub minutes: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinutesModelState {
    pub feature_names: Vec<String>,
    pub regression: LinearFit,
    /// P(plays the full match | starts). Absent when every start, or none,
    /// went the distance.
    pub full_match: Option<LinearFit>,
    pub calibration: Option<IsotonicCalibration>,
    pub match_length: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinutesTrainingReport {
    pub samples: usize,
    pub features: usize,
    pub ignored_non_starts: usize,
    pub full_match_rate: f64,
    pub calibrated: bool,
    pub out_of_fold: RegressionMetrics,
    pub out_of_fold_calibrated: RegressionMetrics,
    pub train: RegressionMetrics,
    /// In-sample log loss of the full-match head; 0 when it was not fitted.
    pub full_match_log_loss: f64,
}

#[derive(Debug, Clone)]
pub struct ConditionalMinutesEstimator {
    state: Option<MinutesModelState>,
    l2: f64,
    match_length: f64,
}

impl Default for ConditionalMinutesEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionalMinutesEstimator {
    pub fn new() -> Self {
        Self {
            state: None,
            l2: DEFAULT_L2,
            match_length: MATCH_LENGTH,
        }
    }

    pub fn with_l2(mut self, l2: f64) -> Self {
        self.l2 = l2.max(0.0);
        self
    }

    /// Upper clip for predictions and calibration; non-positive values are
    /// ignored.
    pub fn with_match_length(mut self, match_length: f64) -> Self {
        if match_length.is_finite() && match_length > 0.0 {
            self.match_length = match_length;
        }
        self
    }

    pub fn from_state(state: MinutesModelState) -> Self {
        Self {
            match_length: state.match_length,
            state: Some(state),
            l2: DEFAULT_L2,
        }
    }

    pub fn state(&self) -> Option<&MinutesModelState> {
        self.state.as_ref()
    }

    pub fn is_trained(&self) -> bool {
        self.state.is_some()
    }

    /// Fits on started samples only; non-starts are ignored and counted. Any
    /// error leaves a previously fitted state untouched.
    pub fn train(
        &mut self,
        vectors: &[FeatureVector],
        labels: &[MinutesLabel],
    ) -> XResult<MinutesTrainingReport> {
        if vectors.len() != labels.len() {
            return Err(XMinsError::InvalidInput(format!(
                "{} feature vectors but {} labels",
                vectors.len(),
                labels.len()
            )));
        }
        let (started_vectors, minutes): (Vec<FeatureVector>, Vec<f64>) = vectors
            .iter()
            .zip(labels)
            .filter(|(_, l)| l.started)
            .map(|(v, l)| (v.clone(), l.minutes as f64))
            .unzip();
        if started_vectors.len() < MIN_TRAINING_SAMPLES {
            return Err(XMinsError::InsufficientData {
                stage: Stage::Minutes,
                got: started_vectors.len(),
                need: MIN_TRAINING_SAMPLES,
            });
        }
        let (names, rows) = stack_vectors(&started_vectors)?;
        let weights = vec![1.0; rows.len()];
        let upper = self.match_length;

        let oof = out_of_fold_minutes(&rows, &minutes, self.l2, upper);
        let calibration = IsotonicCalibration::fit(&oof, &minutes, 0.0, upper);
        let calibrated_oof: Vec<f64> = match &calibration {
            Some(c) => oof.iter().map(|m| c.apply(*m)).collect(),
            None => oof.clone(),
        };

        let regression = fit_ridge(&rows, &minutes, &weights, self.l2);
        let full: Vec<f64> = labels
            .iter()
            .filter(|l| l.started)
            .map(|l| if l.minutes >= FULL_MATCH_MINUTES { 1.0 } else { 0.0 })
            .collect();
        let full_count = full.iter().filter(|f| **f > 0.5).count();
        let full_match = (full_count > 0 && full_count < full.len())
            .then(|| fit_logistic(&rows, &full, &weights, CLASSIFIER_L2));

        let in_sample: Vec<f64> = rows
            .iter()
            .map(|r| {
                let raw = regression.score(r).clamp(0.0, upper);
                calibration.as_ref().map(|c| c.apply(raw)).unwrap_or(raw)
            })
            .collect();
        let full_match_log_loss = full_match
            .as_ref()
            .map(|fit| {
                let probs: Vec<f64> = rows.iter().map(|r| fit.prob(r)).collect();
                let labels: Vec<bool> = full.iter().map(|f| *f > 0.5).collect();
                evaluate_classifier(&probs, &labels).log_loss
            })
            .unwrap_or(0.0);

        let report = MinutesTrainingReport {
            samples: rows.len(),
            features: names.len(),
            ignored_non_starts: labels.len() - rows.len(),
            full_match_rate: full_count as f64 / full.len() as f64,
            calibrated: calibration.is_some(),
            out_of_fold: evaluate_regression(&oof, &minutes),
            out_of_fold_calibrated: evaluate_regression(&calibrated_oof, &minutes),
            train: evaluate_regression(&in_sample, &minutes),
            full_match_log_loss,
        };
        debug!(
            samples = report.samples,
            mae = report.out_of_fold_calibrated.mae,
            "minutes stage fitted"
        );

        self.state = Some(MinutesModelState {
            feature_names: names,
            regression,
            full_match,
            calibration,
            match_length: upper,
        });
        Ok(report)
    }

    pub fn predict(&self, vector: &FeatureVector) -> XResult<f64> {
        let state = self.checked_state(vector)?;
        vector.check_finite()?;
        let raw = state.regression.score(vector.values()).clamp(0.0, state.match_length);
        let out = match &state.calibration {
            Some(c) => c.apply(raw),
            None => raw,
        };
        Ok(out.clamp(0.0, state.match_length))
    }

    pub fn predict_full_match(&self, vector: &FeatureVector) -> XResult<Option<f64>> {
        let state = self.checked_state(vector)?;
        vector.check_finite()?;
        Ok(state
            .full_match
            .as_ref()
            .map(|fit| fit.prob(vector.values()).clamp(0.0, 1.0)))
    }

    pub fn evaluate(
        &self,
        vectors: &[FeatureVector],
        labels: &[MinutesLabel],
    ) -> XResult<RegressionMetrics> {
        let mut preds = Vec::new();
        let mut actual = Vec::new();
        for (v, l) in vectors.iter().zip(labels).filter(|(_, l)| l.started) {
            preds.push(self.predict(v)?);
            actual.push(l.minutes as f64);
        }
        Ok(evaluate_regression(&preds, &actual))
    }

    pub fn feature_importance(&self) -> XResult<Vec<FeatureImportance>> {
        let state = self.state.as_ref().ok_or(XMinsError::NotTrained(Stage::Minutes))?;
        Ok(rank_importance(&state.feature_names, &state.regression))
    }

    fn checked_state(&self, vector: &FeatureVector) -> XResult<&MinutesModelState> {
        let state = self.state.as_ref().ok_or(XMinsError::NotTrained(Stage::Minutes))?;
        check_names(&state.feature_names, vector.names())?;
        Ok(state)
    }
}

fn out_of_fold_minutes(rows: &[Vec<f64>], minutes: &[f64], l2: f64, upper: f64) -> Vec<f64> {
    let mut out = vec![0.0; rows.len()];
    for fold in 0..CV_FOLDS {
        let (mut tr_rows, mut tr_y) = (Vec::new(), Vec::new());
        for i in (0..rows.len()).filter(|i| i % CV_FOLDS != fold) {
            tr_rows.push(rows[i].clone());
            tr_y.push(minutes[i]);
        }
        if tr_rows.is_empty() {
            continue;
        }
        let fit = fit_ridge(&tr_rows, &tr_y, &vec![1.0; tr_rows.len()], l2);
        for i in (0..rows.len()).filter(|i| i % CV_FOLDS == fold) {
            out[i] = fit.score(&rows[i]).clamp(0.0, upper);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(n: usize) -> (Vec<FeatureVector>, Vec<MinutesLabel>) {
        let names = vec!["avg_minutes_last_5".to_string(), "is_home".to_string()];
        let mut vectors = Vec::new();
        let mut labels = Vec::new();
        for i in 0..n {
            let avg = 45.0 + (i % 10) as f64 * 5.0;
            vectors.push(FeatureVector::new(names.clone(), vec![avg, (i % 2) as f64]).unwrap());
            labels.push(MinutesLabel {
                started: i % 4 != 0,
                minutes: (avg as u16).min(90),
            });
        }
        (vectors, labels)
    }

    #[test]
    fn counts_only_started_samples() {
        let (v, l) = data(60);
        let mut est = ConditionalMinutesEstimator::new();
        let err = est.train(&v, &l).unwrap_err();
        assert_eq!(
            err,
            XMinsError::InsufficientData {
                stage: Stage::Minutes,
                got: 45,
                need: 50
            }
        );
        assert!(!est.is_trained());
    }

    #[test]
    fn predictions_stay_inside_match_length() {
        let (v, l) = data(200);
        let mut est = ConditionalMinutesEstimator::new();
        let report = est.train(&v, &l).unwrap();
        assert_eq!(report.ignored_non_starts, 50);
        assert!(report.out_of_fold_calibrated.mae < 10.0);

        let names = v[0].names().to_vec();
        for avg in [-500.0, 0.0, 60.0, 90.0, 5000.0] {
            let x = FeatureVector::new(names.clone(), vec![avg, 1.0]).unwrap();
            let m = est.predict(&x).unwrap();
            assert!((0.0..=MATCH_LENGTH).contains(&m), "{avg} -> {m}");
        }
        let hi = est.predict(&FeatureVector::new(names.clone(), vec![88.0, 0.0]).unwrap()).unwrap();
        let lo = est.predict(&FeatureVector::new(names, vec![50.0, 0.0]).unwrap()).unwrap();
        assert!(hi > lo);
    }

    #[test]
    fn full_match_head_tracks_ninety_minute_starts() {
        let (v, l) = data(200);
        let mut est = ConditionalMinutesEstimator::new();
        let report = est.train(&v, &l).unwrap();
        assert!(report.full_match_rate > 0.0 && report.full_match_rate < 1.0);
        let names = v[0].names().to_vec();
        let nailed = est
            .predict_full_match(&FeatureVector::new(names.clone(), vec![90.0, 0.0]).unwrap())
            .unwrap()
            .unwrap();
        let cameo = est
            .predict_full_match(&FeatureVector::new(names, vec![45.0, 0.0]).unwrap())
            .unwrap()
            .unwrap();
        assert!(nailed > cameo);
    }

    #[test]
    fn extra_time_length_lifts_the_clip() {
        let names = vec!["avg_minutes_last_5".to_string(), "is_home".to_string()];
        let mut vectors = Vec::new();
        let mut labels = Vec::new();
        for i in 0..150 {
            let avg = 60.0 + (i % 7) as f64 * 10.0;
            vectors.push(FeatureVector::new(names.clone(), vec![avg, (i % 2) as f64]).unwrap());
            labels.push(MinutesLabel {
                started: true,
                minutes: avg as u16,
            });
        }
        let mut est = ConditionalMinutesEstimator::new().with_match_length(120.0);
        est.train(&vectors, &labels).unwrap();
        assert_eq!(est.state().unwrap().match_length, 120.0);

        let long = est.predict(&FeatureVector::new(names.clone(), vec![120.0, 0.0]).unwrap()).unwrap();
        assert!(long > 100.0 && long <= 120.0, "{long}");
        let capped = est.predict(&FeatureVector::new(names, vec![900.0, 0.0]).unwrap()).unwrap();
        assert!(capped <= 120.0);

        let default = ConditionalMinutesEstimator::new().with_match_length(-1.0);
        assert_eq!(default.match_length, MATCH_LENGTH);
    }

    #[test]
    fn not_trained_before_fit() {
        let (v, _) = data(1);
        let est = ConditionalMinutesEstimator::new();
        assert_eq!(est.predict(&v[0]), Err(XMinsError::NotTrained(Stage::Minutes)));
    }
}
