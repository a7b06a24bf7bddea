/// Running mean and variance over an unbounded stream (Welford).
///
/// Used by the corner filter to keep an adaptive threshold on the Harris
/// response without storing the history.
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one sample in. Non-finite samples are ignored.
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance; zero until two samples have been seen.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// `mean + factor * stddev`.
    pub fn threshold(&self, factor: f64) -> f64 {
        self.mean + factor * self.std_dev()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
