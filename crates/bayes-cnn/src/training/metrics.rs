//! Running metric accumulators, reset every epoch.

/// Running mean of scalar values.
#[derive(Debug, Clone, Default)]
pub struct Mean {
    total: f64,
    count: usize,
}

impl Mean {
    pub fn update(&mut self, value: f64) {
        self.total += value;
        self.count += 1;
    }

    /// Mean of all values since the last reset, 0 when empty.
    pub fn result(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Fraction of predictions matching the label.
#[derive(Debug, Clone, Default)]
pub struct CategoricalAccuracy {
    correct: usize,
    total: usize,
}

impl CategoricalAccuracy {
    pub fn update(&mut self, predictions: &[usize], labels: &[usize]) {
        self.correct += predictions
            .iter()
            .zip(labels)
            .filter(|(p, l)| p == l)
            .count();
        self.total += labels.len();
    }

    pub fn result(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Per-class correct and total counts gathered over an evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassCounts {
    pub correct: Vec<usize>,
    pub total: Vec<usize>,
}

impl ClassCounts {
    pub fn new(num_classes: usize) -> Self {
        Self {
            correct: vec![0; num_classes],
            total: vec![0; num_classes],
        }
    }

    /// Count one batch of predictions. Labels outside the class range are ignored.
    pub fn update(&mut self, predictions: &[usize], labels: &[usize]) {
        for (&pred, &label) in predictions.iter().zip(labels) {
            if label >= self.total.len() {
                continue;
            }
            self.total[label] += 1;
            if pred == label {
                self.correct[label] += 1;
            }
        }
    }

    /// Add another pass's counts element-wise.
    pub fn merge(&mut self, other: &ClassCounts) {
        for (a, b) in self.correct.iter_mut().zip(&other.correct) {
            *a += b;
        }
        for (a, b) in self.total.iter_mut().zip(&other.total) {
            *a += b;
        }
    }

    /// Accuracy of one class, `None` if the class never appeared.
    pub fn accuracy(&self, class: usize) -> Option<f64> {
        match self.total.get(class) {
            Some(&t) if t > 0 => Some(self.correct[class] as f64 / t as f64),
            _ => None,
        }
    }
}

/// Format a fraction as a percentage with three decimals, e.g. `93.750%`.
pub fn percent(value: f64) -> String {
    format!("{:.3}%", value * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_accumulates_and_resets() {
        let mut m = Mean::default();
        assert_eq!(m.result(), 0.0);
        m.update(1.0);
        m.update(2.0);
        assert!((m.result() - 1.5).abs() < 1e-12);
        m.reset();
        assert_eq!(m.result(), 0.0);
    }

    #[test]
    fn test_categorical_accuracy() {
        let mut acc = CategoricalAccuracy::default();
        acc.update(&[0, 1, 2, 2], &[0, 1, 1, 2]);
        assert!((acc.result() - 0.75).abs() < 1e-12);
        acc.update(&[0], &[1]);
        assert!((acc.result() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_class_counts() {
        let mut counts = ClassCounts::new(3);
        counts.update(&[0, 1, 0, 2], &[0, 1, 1, 1]);
        assert_eq!(counts.total, vec![1, 3, 0]);
        assert_eq!(counts.correct, vec![1, 1, 0]);
        assert_eq!(counts.accuracy(0), Some(1.0));
        assert_eq!(counts.accuracy(2), None);

        let mut more = ClassCounts::new(3);
        more.update(&[2], &[2]);
        counts.merge(&more);
        assert_eq!(counts.accuracy(2), Some(1.0));
    }

    #[test]
    fn test_percent_format() {
        assert_eq!(percent(0.9375), "93.750%");
        assert_eq!(percent(0.0), "0.000%");
    }
}
