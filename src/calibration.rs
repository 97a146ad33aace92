use serde::{Deserialize, Serialize};

use crate::linear::{logit, sigmoid};

const PLATT_MIN_SAMPLES: usize = 8;
const PLATT_ITERS: usize = 2000;
const PLATT_LR: f64 = 0.5;
const PLATT_L2: f64 = 1e-4;

/// `p_calibrated = sigmoid(a * logit(p_raw) + b)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlattCalibration {
    pub a: f64,
    pub b: f64,
}

impl PlattCalibration {
    pub fn identity() -> Self {
        Self { a: 1.0, b: 0.0 }
    }

    pub fn apply(&self, raw_prob: f64) -> f64 {
        sigmoid(self.a * logit(raw_prob) + self.b).clamp(0.0, 1.0)
    }

    /// Fits on out-of-sample `(raw_prob, label)` pairs. `None` when there are
    /// too few pairs, a single class, or the descent diverges.
    pub fn fit(raw_probs: &[f64], labels: &[bool]) -> Option<Self> {
        if raw_probs.len() < PLATT_MIN_SAMPLES || raw_probs.len() != labels.len() {
            return None;
        }
        let positives = labels.iter().filter(|y| **y).count();
        if positives == 0 || positives == labels.len() {
            return None;
        }

        let n = raw_probs.len() as f64;
        let xs: Vec<f64> = raw_probs.iter().map(|p| logit(*p)).collect();
        let mut a = 1.0_f64;
        let mut b = 0.0_f64;

        for i in 0..PLATT_ITERS {
            let lr = PLATT_LR / (1.0 + 0.01 * i as f64);
            let mut grad_a = 0.0;
            let mut grad_b = 0.0;
            for (x, y) in xs.iter().zip(labels) {
                let err = sigmoid(a * x + b) - if *y { 1.0 } else { 0.0 };
                grad_a += err * x;
                grad_b += err;
            }
            grad_a = grad_a / n + PLATT_L2 * a;
            grad_b /= n;
            a -= lr * grad_a;
            b -= lr * grad_b;
            if !a.is_finite() || !b.is_finite() {
                return None;
            }
        }

        Some(Self { a, b })
    }
}

/// Monotone non-decreasing step-and-interpolate map fitted with the
/// pool-adjacent-violators algorithm. Inputs outside the fitted range clip to
/// the end values; outputs stay inside `[lower, upper]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsotonicCalibration {
    pub thresholds: Vec<f64>,
    pub values: Vec<f64>,
    pub lower: f64,
    pub upper: f64,
}

impl IsotonicCalibration {
    pub fn fit(raw: &[f64], targets: &[f64], lower: f64, upper: f64) -> Option<Self> {
        if raw.is_empty() || raw.len() != targets.len() || lower > upper {
            return None;
        }

        let mut pairs: Vec<(f64, f64)> = raw
            .iter()
            .copied()
            .zip(targets.iter().copied())
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .collect();
        if pairs.is_empty() {
            return None;
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        // Equal raw values form one weighted point before pooling.
        let mut groups: Vec<(f64, f64, f64)> = Vec::with_capacity(pairs.len());
        for (x, y) in pairs {
            match groups.last_mut() {
                Some(last) if last.0 == x => {
                    last.1 += y;
                    last.2 += 1.0;
                }
                _ => groups.push((x, y, 1.0)),
            }
        }

        let mut blocks: Vec<PooledBlock> = Vec::with_capacity(groups.len());
        for (x, sum_y, weight) in groups {
            let mut cur = PooledBlock {
                x_lo: x,
                x_hi: x,
                sum_y,
                weight,
            };
            while let Some(prev) = blocks.last()
                && prev.mean() > cur.mean()
            {
                cur = PooledBlock {
                    x_lo: prev.x_lo,
                    x_hi: cur.x_hi,
                    sum_y: prev.sum_y + cur.sum_y,
                    weight: prev.weight + cur.weight,
                };
                blocks.pop();
            }
            blocks.push(cur);
        }

        let mut thresholds = Vec::with_capacity(blocks.len() * 2);
        let mut values = Vec::with_capacity(blocks.len() * 2);
        for block in &blocks {
            let value = block.mean().clamp(lower, upper);
            thresholds.push(block.x_lo);
            values.push(value);
            if block.x_hi > block.x_lo {
                thresholds.push(block.x_hi);
                values.push(value);
            }
        }
        Some(Self {
            thresholds,
            values,
            lower,
            upper,
        })
    }

    pub fn apply(&self, raw: f64) -> f64 {
        let (Some(first), Some(last)) = (self.values.first(), self.values.last()) else {
            return raw.clamp(self.lower, self.upper);
        };
        if !raw.is_finite() {
            return *first;
        }
        let idx = self.thresholds.partition_point(|t| *t <= raw);
        let out = if idx == 0 {
            *first
        } else if idx >= self.thresholds.len() {
            *last
        } else {
            let (x0, x1) = (self.thresholds[idx - 1], self.thresholds[idx]);
            let (y0, y1) = (self.values[idx - 1], self.values[idx]);
            let t = if x1 > x0 { (raw - x0) / (x1 - x0) } else { 0.0 };
            y0 + t * (y1 - y0)
        };
        out.clamp(self.lower, self.upper)
    }
}

#[derive(Debug, Clone, Copy)]
struct PooledBlock {
    x_lo: f64,
    x_hi: f64,
    sum_y: f64,
    weight: f64,
}

impl PooledBlock {
    fn mean(&self) -> f64 {
        self.sum_y / self.weight
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub bucket_start: f64,
    pub bucket_end: f64,
    pub count: usize,
    pub avg_pred: f64,
    pub actual_rate: f64,
}

pub fn reliability_bins(probs: &[f64], labels: &[bool], bins: usize) -> Vec<CalibrationBin> {
    let bins = bins.max(1);
    let mut counts = vec![0usize; bins];
    let mut pred_sum = vec![0.0; bins];
    let mut hit_sum = vec![0.0; bins];
    for (p, y) in probs.iter().zip(labels) {
        let p = p.clamp(0.0, 1.0);
        let idx = ((p * bins as f64) as usize).min(bins - 1);
        counts[idx] += 1;
        pred_sum[idx] += p;
        if *y {
            hit_sum[idx] += 1.0;
        }
    }
    (0..bins)
        .filter(|i| counts[*i] > 0)
        .map(|i| {
            let n = counts[i] as f64;
            CalibrationBin {
                bucket_start: i as f64 / bins as f64,
                bucket_end: (i + 1) as f64 / bins as f64,
                count: counts[i],
                avg_pred: pred_sum[i] / n,
                actual_rate: hit_sum[i] / n,
            }
        })
        .collect()
}

pub fn expected_calibration_error(bins: &[CalibrationBin]) -> f64 {
    let total: usize = bins.iter().map(|b| b.count).sum();
    if total == 0 {
        return 0.0;
    }
    bins.iter()
        .map(|b| b.count as f64 * (b.avg_pred - b.actual_rate).abs())
        .sum::<f64>()
        / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn platt_pulls_overconfident_scores_in() {
        let mut raw = Vec::new();
        let mut labels = Vec::new();
        for i in 0..200 {
            // Truth 0.6 either way, reported as 0.95 / 0.05.
            let high = i % 2 == 0;
            raw.push(if high { 0.95 } else { 0.05 });
            labels.push(if high { i % 10 < 6 } else { i % 10 >= 6 });
        }
        let fit = PlattCalibration::fit(&raw, &labels).unwrap();
        let p = fit.apply(0.95);
        assert!(p < 0.8, "calibrated {p}");
        assert!(p > 0.5);
    }

    #[test]
    fn platt_declines_single_class() {
        assert!(PlattCalibration::fit(&[0.2; 20], &[true; 20]).is_none());
        assert!(PlattCalibration::fit(&[0.2, 0.8], &[true, false]).is_none());
    }

    #[test]
    fn isotonic_pools_violators() {
        let iso = IsotonicCalibration::fit(&[1.0, 2.0, 3.0, 4.0], &[10.0, 30.0, 20.0, 40.0], 0.0, 90.0)
            .unwrap();
        assert_eq!(iso.thresholds, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(iso.values, vec![10.0, 25.0, 25.0, 40.0]);
        assert_relative_eq!(iso.apply(2.5), 25.0);
        assert_relative_eq!(iso.apply(-5.0), 10.0);
        assert_relative_eq!(iso.apply(100.0), 40.0);
    }

    #[test]
    fn isotonic_tied_inputs_pool_the_same_in_any_order() {
        let a = IsotonicCalibration::fit(&[1.0, 2.0, 2.0], &[50.0, 10.0, 60.0], 0.0, 90.0).unwrap();
        let b = IsotonicCalibration::fit(&[2.0, 1.0, 2.0], &[60.0, 50.0, 10.0], 0.0, 90.0).unwrap();
        let c = IsotonicCalibration::fit(&[1.0, 2.0, 2.0], &[50.0, 60.0, 10.0], 0.0, 90.0).unwrap();
        for iso in [&a, &b, &c] {
            assert_relative_eq!(iso.apply(2.0), 40.0);
            assert_relative_eq!(iso.apply(1.0), 40.0);
        }
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn isotonic_ties_at_the_clip_point_pool_with_lower_inputs() {
        // Minutes predictions clipped at 90 pile up on one raw value.
        let mut raw = vec![80.0; 10];
        let mut targets = vec![80.0; 10];
        for i in 0..20 {
            raw.push(90.0);
            targets.push(if i % 2 == 0 { 60.0 } else { 90.0 });
        }
        let iso = IsotonicCalibration::fit(&raw, &targets, 0.0, 90.0).unwrap();
        assert_relative_eq!(iso.apply(90.0), 230.0 / 3.0, epsilon = 1e-9);
        assert_relative_eq!(iso.apply(85.0), 230.0 / 3.0, epsilon = 1e-9);

        raw.reverse();
        targets.reverse();
        let reversed = IsotonicCalibration::fit(&raw, &targets, 0.0, 90.0).unwrap();
        assert_relative_eq!(reversed.apply(90.0), 230.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn isotonic_output_is_monotone_and_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        let raw: Vec<f64> = (0..300).map(|_| rng.gen_range(0.0..100.0)).collect();
        let targets: Vec<f64> = raw.iter().map(|x| x + rng.gen_range(-40.0..40.0)).collect();
        let iso = IsotonicCalibration::fit(&raw, &targets, 0.0, 90.0).unwrap();

        let mut prev = f64::NEG_INFINITY;
        for i in 0..500 {
            let out = iso.apply(-20.0 + i as f64 * 0.3);
            assert!(out >= prev - 1e-12);
            assert!((0.0..=90.0).contains(&out));
            prev = out;
        }
    }

    #[test]
    fn reliability_bins_skip_empty_buckets() {
        let bins = reliability_bins(&[0.05, 0.15, 0.95, 1.0], &[false, true, true, true], 10);
        assert_eq!(bins.len(), 3);
        assert_eq!(bins[2].count, 2);
        assert_relative_eq!(bins[2].actual_rate, 1.0);
        assert!(expected_calibration_error(&bins) > 0.0);
    }
}
