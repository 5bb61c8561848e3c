//! ROC and precision-recall curves for uncertainty-based OOD detection.
//!
//! Out-of-distribution ("risky") examples are the positive class and the
//! uncertainty score is the detector output: higher means more likely OOD.

/// Curves and summary numbers for one safe-vs-risky comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct RocResult {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    /// Decision thresholds aligned with `fpr`/`tpr`; the first is `+inf`.
    /// The curve point at a threshold counts scores at or above it.
    /// [`detection_accuracy`] counts only scores strictly above it, so at
    /// the same threshold it can be lower than the TPR.
    pub thresholds: Vec<f64>,
    /// Maximum Youden's J point as `(fpr, tpr, threshold)`.
    pub optimal: (f64, f64, f64),
    pub auroc: f64,
    /// Precision per threshold; 1 at `+inf` where nothing is flagged.
    pub precision: Vec<f64>,
    /// Recall per threshold, equal to `tpr`.
    pub recall: Vec<f64>,
    /// Average precision, `sum_n (R_n - R_{n-1}) P_n`.
    pub aupr: f64,
}

/// Compute ROC and PR curves with `risky` as the positive class.
///
/// With `inverse` the scores are negated first, so lower uncertainty means
/// risky; returned thresholds live in the negated space.
pub fn roc_pr_curves(safe: &[f64], risky: &[f64], inverse: bool) -> anyhow::Result<RocResult> {
    anyhow::ensure!(
        !safe.is_empty() && !risky.is_empty(),
        "ROC needs both in- and out-of-distribution scores (got {} and {})",
        safe.len(),
        risky.len()
    );
    let sign = if inverse { -1.0 } else { 1.0 };
    let mut scored: Vec<(f64, bool)> = safe
        .iter()
        .map(|&s| (sign * s, false))
        .chain(risky.iter().map(|&s| (sign * s, true)))
        .collect();
    anyhow::ensure!(
        scored.iter().all(|(s, _)| !s.is_nan()),
        "ROC scores must not be NaN"
    );
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    let positives = risky.len() as f64;
    let negatives = safe.len() as f64;

    let mut fpr = vec![0.0];
    let mut tpr = vec![0.0];
    let mut thresholds = vec![f64::INFINITY];
    let mut precision = vec![1.0];

    let (mut tp, mut fp) = (0usize, 0usize);
    let mut i = 0;
    while i < scored.len() {
        let threshold = scored[i].0;
        while i < scored.len() && scored[i].0 == threshold {
            if scored[i].1 {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }
        fpr.push(fp as f64 / negatives);
        tpr.push(tp as f64 / positives);
        thresholds.push(threshold);
        precision.push(tp as f64 / (tp + fp) as f64);
    }

    let auroc = fpr
        .windows(2)
        .zip(tpr.windows(2))
        .map(|(x, y)| (x[1] - x[0]) * (y[1] + y[0]) / 2.0)
        .sum();

    let recall = tpr.clone();
    let aupr = recall
        .windows(2)
        .zip(&precision[1..])
        .map(|(r, &p)| (r[1] - r[0]) * p)
        .sum();

    let mut best = 0;
    for k in 1..fpr.len() {
        if tpr[k] - fpr[k] > tpr[best] - fpr[best] {
            best = k;
        }
    }
    let optimal = (fpr[best], tpr[best], thresholds[best]);

    Ok(RocResult {
        fpr,
        tpr,
        thresholds,
        optimal,
        auroc,
        precision,
        recall,
        aupr,
    })
}

/// Fraction of `risky` scores strictly above `threshold`.
///
/// Unlike the curve points, a score equal to the threshold is not counted.
pub fn detection_accuracy(risky: &[f64], threshold: f64) -> f64 {
    if risky.is_empty() {
        return 0.0;
    }
    risky.iter().filter(|&&s| s > threshold).count() as f64 / risky.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfectly_separable() {
        let roc = roc_pr_curves(&[0.1, 0.2, 0.3], &[0.7, 0.8], false).unwrap();
        assert!((roc.auroc - 1.0).abs() < 1e-12);
        assert!((roc.aupr - 1.0).abs() < 1e-12);
        assert_eq!(roc.optimal, (0.0, 1.0, 0.7));
        assert_eq!(roc.thresholds[0], f64::INFINITY);
        assert_eq!(*roc.fpr.last().unwrap(), 1.0);
        assert_eq!(*roc.tpr.last().unwrap(), 1.0);
        // strictly-above rule excludes the score at the threshold
        assert!((detection_accuracy(&[0.7, 0.8], roc.optimal.2) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_detection_accuracy_is_strict_while_tpr_is_inclusive() {
        let risky = [0.4, 0.7, 0.7, 0.9];
        let roc = roc_pr_curves(&[0.1, 0.2], &risky, false).unwrap();
        let (fpr, tpr, threshold) = roc.optimal;
        assert_eq!((fpr, tpr, threshold), (0.0, 1.0, 0.4));
        assert!((detection_accuracy(&risky, threshold) - 0.75).abs() < 1e-12);

        // at 0.7 the curve counts both ties, the accuracy neither
        let at_07 = roc.thresholds.iter().position(|&t| t == 0.7).unwrap();
        assert!((roc.tpr[at_07] - 0.75).abs() < 1e-12);
        assert!((detection_accuracy(&risky, 0.7) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_identical_scores_are_chance() {
        let roc = roc_pr_curves(&[0.5, 0.5], &[0.5, 0.5], false).unwrap();
        assert_eq!(roc.fpr, vec![0.0, 1.0]);
        assert_eq!(roc.tpr, vec![0.0, 1.0]);
        assert!((roc.auroc - 0.5).abs() < 1e-12);
        assert!((roc.aupr - 0.5).abs() < 1e-12);
        // J ties at 0; the first (highest threshold) point wins
        assert_eq!(roc.optimal, (0.0, 0.0, f64::INFINITY));
        assert_eq!(detection_accuracy(&[0.5, 0.5], roc.optimal.2), 0.0);
    }

    #[test]
    fn test_inverse_flips_direction() {
        let safe = [0.9, 0.8];
        let risky = [0.1, 0.2];
        let plain = roc_pr_curves(&safe, &risky, false).unwrap();
        let inverse = roc_pr_curves(&safe, &risky, true).unwrap();
        assert!(plain.auroc.abs() < 1e-12);
        assert!((inverse.auroc - 1.0).abs() < 1e-12);
        assert_eq!(inverse.optimal.2, -0.2);
    }

    #[test]
    fn test_partial_overlap() {
        // ranking: r(0.9) s(0.6) r(0.4) s(0.1)
        let roc = roc_pr_curves(&[0.6, 0.1], &[0.9, 0.4], false).unwrap();
        assert_eq!(roc.tpr, vec![0.0, 0.5, 0.5, 1.0, 1.0]);
        assert_eq!(roc.fpr, vec![0.0, 0.0, 0.5, 0.5, 1.0]);
        assert!((roc.auroc - 0.75).abs() < 1e-12);
        // AP = 0.5 * 1 + 0.5 * 2/3
        assert!((roc.aupr - (0.5 + 1.0 / 3.0)).abs() < 1e-12);
        // J = 0.5 first reached at threshold 0.9
        assert_eq!(roc.optimal, (0.0, 0.5, 0.9));
    }

    #[test]
    fn test_empty_input_is_error() {
        assert!(roc_pr_curves(&[], &[0.1], false).is_err());
        assert!(roc_pr_curves(&[0.1], &[], false).is_err());
    }
}
