//! Hour-of-day concurrency prediction.
//!
//! The controller stores the concurrency it was comfortably running at into
//! the current hour's bucket, and nudges toward the historical mean of the
//! *next* hour's bucket. The nudge is bounded to ±5 so a stale pattern can
//! never dominate the live signals.

const MAX_SAMPLES_PER_BUCKET: usize = 30;
const MAX_ADJUSTMENT: i64 = 5;

/// Historical concurrency samples, bucketed by hour of day.
pub struct HourlyPattern {
    buckets: [Vec<usize>; 24],
}

impl HourlyPattern {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| Vec::new()),
        }
    }

    /// Records a concurrency sample for `hour` (0..24).
    pub fn record(&mut self, hour: usize, concurrency: usize) {
        let bucket = &mut self.buckets[hour % 24];
        bucket.push(concurrency);
        if bucket.len() > MAX_SAMPLES_PER_BUCKET {
            bucket.remove(0);
        }
    }

    /// Suggested delta toward the mean of the hour *after* `hour`, clamped
    /// to ±5. Zero when the next bucket has no history.
    pub fn suggest(&self, hour: usize, current: usize) -> i64 {
        let bucket = &self.buckets[(hour + 1) % 24];
        if bucket.is_empty() {
            return 0;
        }
        let mean = bucket.iter().sum::<usize>() as f64 / bucket.len() as f64;
        let delta = (mean - current as f64).round() as i64;
        delta.clamp(-MAX_ADJUSTMENT, MAX_ADJUSTMENT)
    }

    pub fn samples_for(&self, hour: usize) -> usize {
        self.buckets[hour % 24].len()
    }
}

impl Default for HourlyPattern {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggest_is_zero_without_history() {
        let pattern = HourlyPattern::new();
        assert_eq!(pattern.suggest(9, 25), 0);
    }

    #[test]
    fn suggest_targets_next_hour_mean() {
        let mut pattern = HourlyPattern::new();
        for c in [30, 32, 34] {
            pattern.record(10, c);
        }
        // Suggestion at hour 9 looks into the hour-10 bucket (mean 32).
        assert_eq!(pattern.suggest(9, 25), 5, "clamped to +5");
        assert_eq!(pattern.suggest(9, 30), 2);
        assert_eq!(pattern.suggest(9, 40), -5, "clamped to -5");
    }

    #[test]
    fn buckets_wrap_at_midnight() {
        let mut pattern = HourlyPattern::new();
        pattern.record(0, 40);
        assert_eq!(pattern.suggest(23, 35), 5);
    }

    #[test]
    fn bucket_history_is_bounded() {
        let mut pattern = HourlyPattern::new();
        for i in 0..50 {
            pattern.record(3, i);
        }
        assert_eq!(pattern.samples_for(3), MAX_SAMPLES_PER_BUCKET);
    }
}
