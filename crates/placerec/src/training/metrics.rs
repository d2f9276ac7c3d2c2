/// Weighted running mean of a scalar over an epoch.
///
/// Each update is weighted (by batch size), so a short final batch counts
/// for exactly as many samples as it holds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    sum: f64,
    count: f64,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Add `value` with the given weight.
    pub fn update(&mut self, value: f64, weight: usize) {
        self.sum += value * weight as f64;
        self.count += weight as f64;
    }

    /// `sum / count`, or `None` before any weighted update.
    pub fn average(&self) -> Option<f64> {
        (self.count > 0.0).then(|| self.sum / self.count)
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> f64 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_average() {
        let mut m = RunningMean::new();
        m.update(1.0, 4);
        m.update(3.0, 1);
        m.update(0.5, 2);
        // (4 + 3 + 1) / 7
        let avg = m.average().unwrap();
        assert!((avg - 8.0 / 7.0).abs() < 1e-12);
        assert_eq!(m.count(), 7.0);
    }

    #[test]
    fn test_undefined_without_updates() {
        let mut m = RunningMean::new();
        assert_eq!(m.average(), None);
        m.update(2.0, 3);
        assert!(m.average().is_some());
        m.reset();
        assert_eq!(m.average(), None);
        assert_eq!(m.sum(), 0.0);
    }

    #[test]
    fn test_zero_weight_update_keeps_mean_undefined() {
        let mut m = RunningMean::new();
        m.update(5.0, 0);
        assert_eq!(m.average(), None);
    }
}
