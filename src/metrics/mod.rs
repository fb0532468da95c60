//! Rolling-window counters for throughput and latency telemetry.
//!
//! A [`RollingCounter`] spreads a time window `W` over `B` buckets of equal
//! width. Increments hit the current bucket through a lock-free atomic; only
//! a bucket-boundary crossing takes the rotation mutex. Memory stays bounded
//! at `B` buckets no matter how long the counter lives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Rolling-window event counter with a lock-free fast path.
pub struct RollingCounter {
    window: Duration,
    buckets: usize,
    interval_ns: u64,
    origin: Instant,
    /// Value of the bucket currently accumulating.
    current: AtomicU64,
    /// Deadline of the current bucket, nanoseconds since `origin`.
    deadline_ns: AtomicU64,
    /// Past bucket values, oldest first. Length stays exactly `buckets`.
    past: Mutex<VecDeque<u64>>,
}

impl RollingCounter {
    /// Create a counter covering `window` with `buckets` equal slices.
    pub fn new(window: Duration, buckets: usize) -> Self {
        let buckets = buckets.max(1);
        let interval_ns = (window.as_nanos() as u64 / buckets as u64).max(1);
        Self {
            window,
            buckets,
            interval_ns,
            origin: Instant::now(),
            current: AtomicU64::new(0),
            deadline_ns: AtomicU64::new(interval_ns),
            past: Mutex::new(VecDeque::from(vec![0; buckets])),
        }
    }

    fn elapsed_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    /// Add `n` events to the current bucket, rotating stale buckets out
    /// first when the bucket deadline has passed.
    pub fn increment(&self, n: u64) {
        let now = self.elapsed_ns();
        if now >= self.deadline_ns.load(Ordering::Acquire) {
            self.rotate(now);
        }
        self.current.fetch_add(n, Ordering::Relaxed);
    }

    /// Advance time without recording events.
    pub fn sync(&self) {
        self.increment(0);
    }

    fn rotate(&self, now: u64) {
        let mut past = self.past.lock();
        let deadline = self.deadline_ns.load(Ordering::Acquire);
        if now < deadline {
            // Another writer rotated while we waited for the lock.
            return;
        }
        let crossed = (now - deadline) / self.interval_ns + 1;
        past.push_back(self.current.swap(0, Ordering::AcqRel));
        past.pop_front();
        // Idle gaps become zero buckets, capped at B-1: anything older has
        // left the window anyway.
        let pad = (crossed as usize - 1).min(self.buckets - 1);
        for _ in 0..pad {
            past.push_back(0);
            past.pop_front();
        }
        self.deadline_ns
            .store(deadline + crossed * self.interval_ns, Ordering::Release);
    }

    /// Return a synced deep copy safe for readers while writers continue.
    pub fn freeze(&self) -> CounterSnapshot {
        self.sync();
        let past = self.past.lock();
        let mut values: Vec<u64> = past.iter().copied().collect();
        values.push(self.current.load(Ordering::Acquire));
        CounterSnapshot {
            window: self.window,
            buckets: self.buckets,
            values,
        }
    }

    /// Total events currently inside the window.
    pub fn sum(&self) -> u64 {
        self.freeze().sum()
    }

    /// Events per second over the whole window.
    pub fn rate(&self) -> f64 {
        self.freeze().rate()
    }

    /// Rate of the quietest bucket, in events per second.
    pub fn rate_min(&self) -> f64 {
        self.freeze().rate_min()
    }

    /// Rate of the busiest bucket, in events per second.
    pub fn rate_max(&self) -> f64 {
        self.freeze().rate_max()
    }

    /// Population standard deviation of the bucket values.
    pub fn stdev(&self) -> f64 {
        self.freeze().stdev()
    }

    /// Quantile `q` of the bucket values; `0.5` is the median.
    pub fn median(&self, q: f64) -> f64 {
        self.freeze().median(q)
    }
}

impl std::fmt::Debug for RollingCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollingCounter")
            .field("window", &self.window)
            .field("buckets", &self.buckets)
            .field("sum", &self.sum())
            .finish()
    }
}

/// Immutable copy of a counter's buckets, oldest first with the live bucket
/// last. All statistics are computed over this frozen view.
#[derive(Debug, Clone)]
pub struct CounterSnapshot {
    window: Duration,
    buckets: usize,
    values: Vec<u64>,
}

impl CounterSnapshot {
    /// Bucket values, oldest first.
    pub fn values(&self) -> &[u64] {
        &self.values
    }

    /// Total events inside the window.
    pub fn sum(&self) -> u64 {
        self.values.iter().sum()
    }

    /// Events per second over the whole window.
    pub fn rate(&self) -> f64 {
        self.sum() as f64 / self.window.as_secs_f64()
    }

    /// Per-bucket count to events-per-second conversion factor.
    fn bucket_scale(&self) -> f64 {
        self.buckets as f64 / self.window.as_secs_f64()
    }

    /// Rate of the quietest bucket, in events per second.
    pub fn rate_min(&self) -> f64 {
        self.values.iter().min().copied().unwrap_or(0) as f64 * self.bucket_scale()
    }

    /// Rate of the busiest bucket, in events per second.
    pub fn rate_max(&self) -> f64 {
        self.values.iter().max().copied().unwrap_or(0) as f64 * self.bucket_scale()
    }

    /// Population standard deviation of the bucket values.
    pub fn stdev(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.sum() as f64 / self.values.len() as f64;
        let variance = self
            .values
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / self.values.len() as f64;
        variance.sqrt()
    }

    /// Quantile `q` in `[0, 1]` of the bucket values, with linear
    /// interpolation between adjacent buckets.
    pub fn median(&self, q: f64) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mut sorted = self.values.clone();
        sorted.sort_unstable();
        let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        let base = sorted[lo] as f64;
        base + (sorted[hi] as f64 - base) * (pos - lo as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(window_secs: u64, values: &[u64]) -> CounterSnapshot {
        CounterSnapshot {
            window: Duration::from_secs(window_secs),
            buckets: values.len().saturating_sub(1).max(1),
            values: values.to_vec(),
        }
    }

    #[test]
    fn sum_and_rate() {
        let snap = snapshot(10, &[1, 2, 3, 4, 0]);
        assert_eq!(snap.sum(), 10);
        assert!((snap.rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn min_max_scaled_per_bucket() {
        // 4 buckets over 2 seconds: a bucket holding 6 events ran at 12/s.
        let snap = snapshot(2, &[6, 0, 2, 4, 0]);
        assert!((snap.rate_max() - 12.0).abs() < 1e-9);
        assert!((snap.rate_min() - 0.0).abs() < 1e-9);
    }

    #[test]
    fn median_interpolates() {
        let snap = snapshot(10, &[1, 2, 3, 4]);
        assert!((snap.median(0.5) - 2.5).abs() < 1e-9);
        assert!((snap.median(0.0) - 1.0).abs() < 1e-9);
        assert!((snap.median(1.0) - 4.0).abs() < 1e-9);
        assert!((snap.median(0.25) - 1.75).abs() < 1e-9);
    }

    #[test]
    fn stdev_of_constant_values_is_zero() {
        let snap = snapshot(10, &[3, 3, 3, 3]);
        assert!(snap.stdev().abs() < 1e-9);
    }

    #[test]
    fn increments_accumulate_within_window() {
        let counter = RollingCounter::new(Duration::from_secs(3600), 6);
        counter.increment(3);
        counter.increment(4);
        counter.sync();
        assert_eq!(counter.sum(), 7);
    }

    #[test]
    fn freeze_isolates_readers_from_writers() {
        let counter = RollingCounter::new(Duration::from_secs(3600), 6);
        counter.increment(5);
        let frozen = counter.freeze();
        counter.increment(100);
        assert_eq!(frozen.sum(), 5);
        assert_eq!(counter.sum(), 105);
    }

    #[test]
    fn rotation_expires_old_buckets() {
        let counter = RollingCounter::new(Duration::from_millis(80), 4);
        counter.increment(9);
        // Zero-padding is capped at B-1 per rotation, so a gap spanning the
        // whole window needs two rotations to flush every bucket.
        std::thread::sleep(Duration::from_millis(200));
        counter.sync();
        assert!(counter.sum() <= 9);
        std::thread::sleep(Duration::from_millis(200));
        counter.sync();
        assert_eq!(counter.sum(), 0);
    }
}
