use serde::{Deserialize, Serialize};

pub const DEFAULT_TOLERANCES: [u16; 4] = [15, 20, 25, 30];

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub samples: usize,
    pub auc: f64,
    pub accuracy: f64,
    pub balanced_accuracy: f64,
    pub log_loss: f64,
    pub brier: f64,
    pub positive_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub samples: usize,
    pub mae: f64,
    pub rmse: f64,
    pub r2: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToleranceAccuracy {
    pub tolerance: u16,
    pub rate: f64,
}

/// Accuracy of the combined expected-minutes output against what players
/// actually played, zeros included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinedMetrics {
    pub samples: usize,
    pub mae: f64,
    pub rmse: f64,
    pub within: Vec<ToleranceAccuracy>,
}

impl CombinedMetrics {
    pub fn rate_within(&self, tolerance: u16) -> Option<f64> {
        self.within
            .iter()
            .find(|t| t.tolerance == tolerance)
            .map(|t| t.rate)
    }
}

pub fn evaluate_classifier(probs: &[f64], labels: &[bool]) -> ClassificationMetrics {
    if probs.is_empty() || probs.len() != labels.len() {
        return ClassificationMetrics::default();
    }

    let n = probs.len() as f64;
    let mut brier_sum = 0.0_f64;
    let mut log_loss_sum = 0.0_f64;
    let mut correct = 0usize;
    let (mut tp, mut tn, mut pos, mut neg) = (0usize, 0usize, 0usize, 0usize);

    for (p, y) in probs.iter().zip(labels) {
        let p = p.clamp(0.0, 1.0);
        let target = if *y { 1.0 } else { 0.0 };
        brier_sum += (p - target).powi(2);
        let actual_prob = if *y { p } else { 1.0 - p }.clamp(1e-12, 1.0);
        log_loss_sum += -actual_prob.ln();

        let predicted = p >= 0.5;
        if predicted == *y {
            correct += 1;
        }
        if *y {
            pos += 1;
            if predicted {
                tp += 1;
            }
        } else {
            neg += 1;
            if !predicted {
                tn += 1;
            }
        }
    }

    let tpr = if pos > 0 { tp as f64 / pos as f64 } else { 0.0 };
    let tnr = if neg > 0 { tn as f64 / neg as f64 } else { 0.0 };
    let balanced = match (pos > 0, neg > 0) {
        (true, true) => (tpr + tnr) / 2.0,
        (true, false) => tpr,
        (false, true) => tnr,
        (false, false) => 0.0,
    };

    ClassificationMetrics {
        samples: probs.len(),
        auc: roc_auc(probs, labels),
        accuracy: correct as f64 / n,
        balanced_accuracy: balanced,
        log_loss: log_loss_sum / n,
        brier: brier_sum / n,
        positive_rate: pos as f64 / n,
    }
}

pub fn roc_auc(probs: &[f64], labels: &[bool]) -> f64 {
    let pos = labels.iter().filter(|y| **y).count();
    let neg = labels.len() - pos;
    if pos == 0 || neg == 0 || probs.len() != labels.len() {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[a].total_cmp(&probs[b]));

    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && probs[order[j + 1]] == probs[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if labels[idx] {
                rank_sum_pos += avg_rank;
            }
        }
        i = j + 1;
    }

    let pos_f = pos as f64;
    (rank_sum_pos - pos_f * (pos_f + 1.0) / 2.0) / (pos_f * neg as f64)
}

pub fn evaluate_regression(preds: &[f64], actual: &[f64]) -> RegressionMetrics {
    if preds.is_empty() || preds.len() != actual.len() {
        return RegressionMetrics::default();
    }
    let n = preds.len() as f64;
    let mut abs_sum = 0.0;
    let mut sq_sum = 0.0;
    for (p, y) in preds.iter().zip(actual) {
        abs_sum += (p - y).abs();
        sq_sum += (p - y).powi(2);
    }
    let y_mean = actual.iter().sum::<f64>() / n;
    let ss_tot: f64 = actual.iter().map(|y| (y - y_mean).powi(2)).sum();
    let r2 = if ss_tot > 0.0 { 1.0 - sq_sum / ss_tot } else { 0.0 };

    RegressionMetrics {
        samples: preds.len(),
        mae: abs_sum / n,
        rmse: (sq_sum / n).sqrt(),
        r2,
    }
}

pub fn within_tolerance(preds: &[f64], actual: &[f64], tolerance: u16) -> f64 {
    if preds.is_empty() || preds.len() != actual.len() {
        return 0.0;
    }
    let hits = preds
        .iter()
        .zip(actual)
        .filter(|(p, y)| (*p - *y).abs() <= tolerance as f64)
        .count();
    hits as f64 / preds.len() as f64
}

pub fn evaluate_combined(preds: &[f64], actual: &[f64], tolerances: &[u16]) -> CombinedMetrics {
    let reg = evaluate_regression(preds, actual);
    CombinedMetrics {
        samples: reg.samples,
        mae: reg.mae,
        rmse: reg.rmse,
        within: tolerances
            .iter()
            .map(|t| ToleranceAccuracy {
                tolerance: *t,
                rate: within_tolerance(preds, actual, *t),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn auc_perfect_and_inverted() {
        let labels = [false, false, true, true];
        assert_relative_eq!(roc_auc(&[0.1, 0.2, 0.8, 0.9], &labels), 1.0);
        assert_relative_eq!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &labels), 0.0);
        assert_relative_eq!(roc_auc(&[0.5, 0.5, 0.5, 0.5], &labels), 0.5);
    }

    #[test]
    fn auc_single_class_is_neutral() {
        assert_eq!(roc_auc(&[0.2, 0.9], &[true, true]), 0.5);
    }

    #[test]
    fn classifier_metrics_basic() {
        let m = evaluate_classifier(&[0.9, 0.2, 0.6, 0.4], &[true, false, false, true]);
        assert_eq!(m.samples, 4);
        assert_relative_eq!(m.accuracy, 0.5);
        assert_relative_eq!(m.balanced_accuracy, 0.5);
        assert_relative_eq!(m.positive_rate, 0.5);
        assert!(m.log_loss > 0.0);
    }

    #[test]
    fn regression_metrics_basic() {
        let m = evaluate_regression(&[80.0, 60.0], &[90.0, 60.0]);
        assert_relative_eq!(m.mae, 5.0);
        assert_relative_eq!(m.rmse, 50.0_f64.sqrt());
    }

    #[test]
    fn tolerance_band_is_inclusive() {
        let preds = [70.0, 70.0, 70.0];
        let actual = [85.0, 86.0, 0.0];
        assert_relative_eq!(within_tolerance(&preds, &actual, 15), 1.0 / 3.0);
        let combined = evaluate_combined(&preds, &actual, &DEFAULT_TOLERANCES);
        assert_eq!(combined.within.len(), 4);
        assert_relative_eq!(combined.rate_within(20).unwrap(), 2.0 / 3.0);
        assert_eq!(combined.rate_within(45), None);
    }
}
