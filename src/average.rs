/// Computes and stores the average and current value of a scalar metric.
///
/// One meter is kept per tracked quantity (losses, IoU, batch time) and
/// lives for a single epoch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AverageMeter {
    pub val: f64,
    pub avg: f64,
    pub sum: f64,
    pub count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Records `val` with weight 1.
    pub fn update(&mut self, val: f64) {
        self.update_weighted(val, 1);
    }

    /// Records `val` as if it had been observed `n` times, e.g. a batch
    /// mean over `n` samples.
    pub fn update_weighted(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_meter_is_zeroed() {
        let meter = AverageMeter::new();
        assert_eq!(meter.count, 0);
        assert_eq!(meter.avg, 0.0);
        assert_eq!(meter.sum, 0.0);
        assert_eq!(meter.val, 0.0);
    }

    #[test]
    fn weighted_updates_track_weighted_mean() {
        let mut meter = AverageMeter::new();
        let updates = [(0.5, 8), (1.5, 8), (3.0, 2), (-1.0, 1)];
        for (val, n) in updates {
            meter.update_weighted(val, n);
        }

        let expected_sum: f64 = updates.iter().map(|(v, n)| v * *n as f64).sum();
        let expected_count: usize = updates.iter().map(|(_, n)| n).sum();
        assert_eq!(meter.count, expected_count);
        assert!((meter.sum - expected_sum).abs() < 1e-12);
        assert!((meter.avg - expected_sum / expected_count as f64).abs() < 1e-12);
        assert_eq!(meter.val, -1.0);
    }

    #[test]
    fn unit_update_counts_once() {
        let mut meter = AverageMeter::new();
        meter.update(2.0);
        meter.update(4.0);
        assert_eq!(meter.count, 2);
        assert_eq!(meter.avg, 3.0);
        assert_eq!(meter.val, 4.0);
    }

    #[test]
    fn zero_weight_before_any_sample_keeps_average_at_zero() {
        let mut meter = AverageMeter::new();
        meter.update_weighted(7.0, 0);
        assert_eq!(meter.count, 0);
        assert_eq!(meter.avg, 0.0);
        assert_eq!(meter.val, 7.0);
    }

    #[test]
    fn reset_matches_fresh_meter() {
        let mut reused = AverageMeter::new();
        reused.update_weighted(10.0, 3);
        reused.update(1.0);
        reused.reset();
        reused.update_weighted(0.25, 8);

        let mut fresh = AverageMeter::new();
        fresh.update_weighted(0.25, 8);

        assert_eq!(reused, fresh);
    }
}
