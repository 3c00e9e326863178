/// Returns timestamp in ns
#[cfg(unix)]
#[inline(never)]
pub fn mono_time_ns() -> u64 {
    use libc::{CLOCK_MONOTONIC, clock_gettime, timespec};
    unsafe {
        let mut ts = timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        clock_gettime(CLOCK_MONOTONIC, &mut ts);
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }
}

/// Latency sample log for the bench/stress driver.
///
/// Collects nanosecond samples from one thread, merges per-thread logs, and
/// reports percentiles as CSV. Recording is a plain `Vec::push` into
/// pre-reserved capacity, so the measuring hot loop does not allocate.
#[derive(Default)]
pub struct Samples {
    values: Vec<u64>,
}

impl Samples {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn record(&mut self, value: u64) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Folds another log into this one, e.g. per-reader logs after join.
    pub fn merge(&mut self, other: Samples) {
        self.values.extend(other.values);
    }

    /// The `p`-quantile by nearest rank. Sorts in place.
    ///
    /// # Panics
    ///
    /// Panics if the log is empty or `p` is outside `[0, 1]`.
    pub fn percentile(&mut self, p: f64) -> u64 {
        let n = self.values.len();
        assert!(n > 0);
        assert!((0.0..=1.0).contains(&p));
        self.values.sort_unstable();
        self.values[((n - 1) as f64 * p).round() as usize]
    }

    pub fn mean(&self) -> u64 {
        assert!(!self.values.is_empty());
        (self.values.iter().map(|&v| v as u128).sum::<u128>() / self.values.len() as u128) as u64
    }

    /// Prints a CSV header and one row of summary statistics.
    pub fn report_csv(&mut self, label: &str) {
        println!("name,n,mean,min,0.5,0.9,0.99,0.999,0.9999,max");
        println!(
            "{},{},{},{},{},{},{},{},{},{}",
            label,
            self.len(),
            self.mean(),
            self.percentile(0.0),
            self.percentile(0.5),
            self.percentile(0.9),
            self.percentile(0.99),
            self.percentile(0.999),
            self.percentile(0.9999),
            self.percentile(1.0),
        );
    }
}
