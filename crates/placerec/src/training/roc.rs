//! ROC curve and AUC for binary labels with real-valued scores.
//!
//! Larger score means "more likely positive". For embedding distances the
//! score is the negated distance.

/// Operating points of a classifier sweeping its decision threshold downwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    /// Score threshold at each point; the first is `+∞` (nothing predicted positive).
    pub thresholds: Vec<f64>,
}

impl RocCurve {
    /// Trapezoidal area under the curve.
    pub fn auc(&self) -> f64 {
        auc(&self.fpr, &self.tpr).unwrap_or(f64::NAN)
    }

    pub fn len(&self) -> usize {
        self.fpr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fpr.is_empty()
    }
}

/// Compute the ROC curve.
///
/// One point per distinct score (ties move together), points that lie on a
/// straight line between their neighbours are dropped, and a leading `(0, 0)`
/// point is added at threshold `+∞`.
///
/// Returns `None` when either class is absent, where the curve is undefined.
///
/// # Panics
/// Panics if `labels` and `scores` differ in length.
pub fn roc_curve(labels: &[bool], scores: &[f64]) -> Option<RocCurve> {
    assert_eq!(
        labels.len(),
        scores.len(),
        "labels and scores must have the same length"
    );

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut tps = Vec::new();
    let mut fps = Vec::new();
    let mut thresholds = Vec::new();
    let (mut tp, mut fp) = (0.0_f64, 0.0_f64);
    for (pos, &i) in order.iter().enumerate() {
        if labels[i] {
            tp += 1.0;
        } else {
            fp += 1.0;
        }
        let last_of_tie = order
            .get(pos + 1)
            .map_or(true, |&next| scores[next] != scores[i]);
        if last_of_tie {
            tps.push(tp);
            fps.push(fp);
            thresholds.push(scores[i]);
        }
    }
    if tp == 0.0 || fp == 0.0 {
        return None;
    }

    if tps.len() > 2 {
        let n = tps.len();
        let keep: Vec<bool> = (0..n)
            .map(|k| {
                k == 0
                    || k == n - 1
                    || second_difference(&fps, k) != 0.0
                    || second_difference(&tps, k) != 0.0
            })
            .collect();
        let retain = |v: Vec<f64>| -> Vec<f64> {
            v.into_iter()
                .zip(&keep)
                .filter_map(|(x, &k)| k.then_some(x))
                .collect()
        };
        tps = retain(tps);
        fps = retain(fps);
        thresholds = retain(thresholds);
    }

    let fpr = std::iter::once(0.0).chain(fps.iter().map(|f| f / fp)).collect();
    let tpr = std::iter::once(0.0).chain(tps.iter().map(|t| t / tp)).collect();
    let thresholds = std::iter::once(f64::INFINITY).chain(thresholds).collect();
    Some(RocCurve {
        fpr,
        tpr,
        thresholds,
    })
}

fn second_difference(v: &[f64], k: usize) -> f64 {
    v[k + 1] - 2.0 * v[k] + v[k - 1]
}

/// Area under a piecewise-linear curve by the trapezoidal rule.
///
/// `x` must be monotonic. Returns `None` for mismatched lengths or fewer than
/// two points.
pub fn auc(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let area = x
        .windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| (xs[1] - xs[0]) * (ys[1] + ys[0]) / 2.0)
        .sum::<f64>();
    Some(area.abs())
}

/// Labels and scores gathered over a validation epoch.
///
/// AUC does not decompose over batches, so pairs are kept until the epoch
/// ends and the curve is computed once.
#[derive(Debug, Clone, Default)]
pub struct RocAccumulator {
    labels: Vec<bool>,
    scores: Vec<f64>,
}

impl RocAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: bool, score: f64) {
        self.labels.push(label);
        self.scores.push(score);
    }

    /// Record one batch of anchor distances: positives are label 1, negatives
    /// label 0, both scored by negated distance.
    pub fn extend_distances(&mut self, dist_pos: &[f64], dist_neg: &[f64]) {
        for &d in dist_pos {
            self.push(true, -d);
        }
        for &d in dist_neg {
            self.push(false, -d);
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn curve(&self) -> Option<RocCurve> {
        roc_curve(&self.labels, &self.scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(v: &[u8]) -> Vec<bool> {
        v.iter().map(|&l| l == 1).collect()
    }

    #[test]
    fn test_perfect_separation_auc_is_one() {
        let curve = roc_curve(&labels(&[1, 1, 0, 0]), &[0.9, 0.8, 0.3, 0.1]).unwrap();
        assert_eq!(curve.fpr, vec![0.0, 0.0, 0.0, 1.0]);
        assert_eq!(curve.tpr, vec![0.0, 0.5, 1.0, 1.0]);
        assert_eq!(curve.thresholds[0], f64::INFINITY);
        assert!((curve.auc() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_all_ties_auc_is_half() {
        let curve = roc_curve(&labels(&[1, 0, 1, 0]), &[0.5, 0.5, 0.5, 0.5]).unwrap();
        assert_eq!(curve.fpr, vec![0.0, 1.0]);
        assert_eq!(curve.tpr, vec![0.0, 1.0]);
        assert!((curve.auc() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_inverted_scores_auc_is_zero() {
        let curve = roc_curve(&labels(&[0, 0, 1, 1]), &[0.9, 0.8, 0.3, 0.1]).unwrap();
        assert!(curve.auc().abs() < 1e-12);
    }

    #[test]
    fn test_partial_overlap() {
        // the classic four-sample example: auc = 0.75
        let curve = roc_curve(&labels(&[0, 0, 1, 1]), &[0.1, 0.4, 0.35, 0.8]).unwrap();
        assert_eq!(curve.thresholds.len(), curve.fpr.len());
        assert!((curve.auc() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_collinear_points_are_dropped() {
        // three positives in a row produce collinear points on the tpr axis
        let curve = roc_curve(&labels(&[1, 1, 1, 0, 0]), &[5.0, 4.0, 3.0, 2.0, 1.0]).unwrap();
        assert_eq!(curve.tpr, vec![0.0, 1.0 / 3.0, 1.0, 1.0]);
        assert_eq!(curve.fpr, vec![0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_single_class_is_undefined() {
        assert!(roc_curve(&labels(&[1, 1]), &[0.3, 0.2]).is_none());
        assert!(roc_curve(&[], &[]).is_none());
    }

    #[test]
    fn test_auc_trapezoid() {
        assert_eq!(auc(&[0.0, 1.0], &[0.0, 1.0]), Some(0.5));
        assert_eq!(auc(&[0.0, 0.5, 1.0], &[0.5, 0.5, 0.5]), Some(0.5));
        assert_eq!(auc(&[0.0], &[1.0]), None);
        assert_eq!(auc(&[0.0, 1.0], &[1.0]), None);
    }

    #[test]
    fn test_accumulator_negates_distances() {
        let mut acc = RocAccumulator::new();
        acc.extend_distances(&[0.05, 0.1], &[7.07, 3.0]);
        assert_eq!(acc.len(), 4);
        let curve = acc.curve().unwrap();
        assert!((curve.auc() - 1.0).abs() < 1e-12);
    }
}
