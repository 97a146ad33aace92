use serde::{Deserialize, Serialize};

pub const MAX_ITERS: usize = 800;
const LR_START: f64 = 0.5;
const GRAD_TOL: f64 = 1e-7;
const MIN_SCALE: f64 = 1e-9;

pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

pub fn logit(p: f64) -> f64 {
    let p = p.clamp(1e-9, 1.0 - 1e-9);
    (p / (1.0 - p)).ln()
}

/// Weighted per-column mean and standard deviation. Constant columns keep a
/// unit scale so they standardize to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl Standardizer {
    pub fn fit(rows: &[Vec<f64>], weights: &[f64]) -> Self {
        let dim = rows.first().map(Vec::len).unwrap_or(0);
        let mut mean = vec![0.0; dim];
        let mut var = vec![0.0; dim];
        let mut wsum = 0.0;

        for (row, w) in rows.iter().zip(weights) {
            let w = w.max(1e-6);
            wsum += w;
            for (m, x) in mean.iter_mut().zip(row) {
                *m += w * x;
            }
        }
        if wsum > 0.0 {
            for m in &mut mean {
                *m /= wsum;
            }
        }

        for (row, w) in rows.iter().zip(weights) {
            let w = w.max(1e-6);
            for ((v, x), m) in var.iter_mut().zip(row).zip(&mean) {
                let d = x - m;
                *v += w * d * d;
            }
        }
        let scale = var
            .into_iter()
            .map(|v| {
                let sd = if wsum > 0.0 { (v / wsum).sqrt() } else { 0.0 };
                if sd > MIN_SCALE { sd } else { 1.0 }
            })
            .collect();

        Self { mean, scale }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (m, s))| (x - m) / s)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub standardizer: Standardizer,
    pub coeffs: Vec<f64>,
    pub intercept: f64,
}

impl LinearFit {
    pub fn score(&self, x: &[f64]) -> f64 {
        let z = self.standardizer.transform(x);
        self.intercept + dot(&self.coeffs, &z)
    }

    pub fn prob(&self, x: &[f64]) -> f64 {
        sigmoid(self.score(x))
    }
}

/// Weighted L2-regularized logistic regression by full-batch gradient
/// descent. The intercept is not penalized.
pub fn fit_logistic(rows: &[Vec<f64>], targets: &[f64], weights: &[f64], l2: f64) -> LinearFit {
    let standardizer = Standardizer::fit(rows, weights);
    let z: Vec<Vec<f64>> = rows.iter().map(|r| standardizer.transform(r)).collect();
    let dim = standardizer.dim();

    let wsum: f64 = weights.iter().map(|w| w.max(1e-6)).sum::<f64>().max(1e-6);
    let pos: f64 = targets
        .iter()
        .zip(weights)
        .map(|(y, w)| y * w.max(1e-6))
        .sum();
    let mut intercept = logit((pos / wsum).clamp(1e-3, 1.0 - 1e-3));
    let mut coeffs = vec![0.0; dim];

    for iter in 0..MAX_ITERS {
        let mut grad = vec![0.0; dim];
        let mut grad_b = 0.0;
        for ((row, y), w) in z.iter().zip(targets).zip(weights) {
            let w = w.max(1e-6);
            let p = sigmoid(intercept + dot(&coeffs, row));
            let dz = w * (p - y);
            grad_b += dz;
            for (g, x) in grad.iter_mut().zip(row) {
                *g += dz * x;
            }
        }

        let lr = LR_START / (1.0 + (iter as f64 * 0.003));
        let mut norm = (grad_b / wsum).powi(2);
        for (c, g) in coeffs.iter_mut().zip(&grad) {
            let g = g / wsum + l2 * *c;
            norm += g * g;
            *c -= lr * g;
        }
        intercept -= lr * grad_b / wsum;

        if norm.sqrt() < GRAD_TOL {
            break;
        }
    }

    LinearFit {
        standardizer,
        coeffs,
        intercept,
    }
}

/// Weighted ridge regression solved in closed form on standardized inputs.
pub fn fit_ridge(rows: &[Vec<f64>], targets: &[f64], weights: &[f64], l2: f64) -> LinearFit {
    let standardizer = Standardizer::fit(rows, weights);
    let z: Vec<Vec<f64>> = rows.iter().map(|r| standardizer.transform(r)).collect();
    let dim = standardizer.dim();

    let wsum: f64 = weights.iter().map(|w| w.max(1e-6)).sum::<f64>().max(1e-6);
    let y_mean = targets
        .iter()
        .zip(weights)
        .map(|(y, w)| y * w.max(1e-6))
        .sum::<f64>()
        / wsum;

    let mut gram = vec![vec![0.0; dim]; dim];
    let mut rhs = vec![0.0; dim];
    for ((row, y), w) in z.iter().zip(targets).zip(weights) {
        let w = w.max(1e-6) / wsum;
        let r = y - y_mean;
        for i in 0..dim {
            rhs[i] += w * row[i] * r;
            for j in i..dim {
                gram[i][j] += w * row[i] * row[j];
            }
        }
    }
    for i in 0..dim {
        for j in 0..i {
            gram[i][j] = gram[j][i];
        }
        gram[i][i] += l2.max(1e-9);
    }

    LinearFit {
        standardizer,
        coeffs: solve(gram, rhs),
        intercept: y_mean,
    }
}

/// Gaussian elimination with partial pivoting. Singular directions get a
/// zero coefficient.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Vec<f64> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        a.swap(col, pivot);
        b.swap(col, pivot);
        let p = a[col][col];
        if p.abs() < 1e-12 {
            continue;
        }
        for row in (col + 1)..n {
            let f = a[row][col] / p;
            if f == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= f * a[col][k];
            }
            b[row] -= f * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let p = a[row][row];
        if p.abs() < 1e-12 {
            continue;
        }
        let tail: f64 = ((row + 1)..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / p;
    }
    x
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
