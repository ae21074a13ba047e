//! Small sketches backing per-fingerprint aggregates: an EWMA for smoothed
//! latency, an HDR histogram for tail quantiles, and a compact HyperLogLog
//! for distinct-parameter estimation.
use std::hash::{
    DefaultHasher,
    Hash,
    Hasher,
};

use hdrhistogram::Histogram;

#[derive(Clone, Debug)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn observe(&mut self, sample: f64) {
        self.value = Some(match self.value {
            None => sample,
            Some(value) => self.alpha * sample + (1.0 - self.alpha) * value,
        });
    }

    pub fn value(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

/// Latency quantiles in milliseconds, bounded at one hour.
pub struct LatencySketch {
    histogram: Histogram<u64>,
}

impl LatencySketch {
    pub fn new() -> Self {
        Self {
            histogram: Histogram::new_with_bounds(1, 3_600_000, 2)
                .expect("static histogram bounds"),
        }
    }

    pub fn observe_ms(&mut self, millis: f64) {
        let value = (millis.max(0.0) as u64).clamp(1, 3_600_000);
        self.histogram.saturating_record(value);
    }

    pub fn p95_ms(&self) -> f64 {
        self.histogram.value_at_quantile(0.95) as f64
    }

    pub fn p99_ms(&self) -> f64 {
        self.histogram.value_at_quantile(0.99) as f64
    }
}

const HLL_REGISTERS: usize = 64;

/// A 64-register HyperLogLog: 64 bytes per fingerprint buys a distinct-count
/// estimate within ~13%.
#[derive(Clone)]
pub struct DistinctSketch {
    registers: [u8; HLL_REGISTERS],
}

impl DistinctSketch {
    pub fn new() -> Self {
        Self {
            registers: [0; HLL_REGISTERS],
        }
    }

    pub fn observe<T: Hash>(&mut self, value: &T) {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        let hash = hasher.finish();
        let register = (hash & (HLL_REGISTERS as u64 - 1)) as usize;
        let rank = ((hash >> 6) | (1 << 57)).trailing_zeros() as u8 + 1;
        if rank > self.registers[register] {
            self.registers[register] = rank;
        }
    }

    pub fn estimate(&self) -> u64 {
        let m = HLL_REGISTERS as f64;
        let sum: f64 = self.registers.iter().map(|&r| 2f64.powi(-(r as i32))).sum();
        let raw = 0.709 * m * m / sum;
        let zeros = self.registers.iter().filter(|&&r| r == 0).count();
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            // Linear counting for the small range.
            m * (m / zeros as f64).ln()
        } else {
            raw
        };
        estimate.round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DistinctSketch,
        Ewma,
        LatencySketch,
    };

    #[test]
    fn test_ewma_converges() {
        let mut ewma = Ewma::new(0.1);
        ewma.observe(100.0);
        assert_eq!(ewma.value(), 100.0);
        for _ in 0..200 {
            ewma.observe(10.0);
        }
        assert!((ewma.value() - 10.0).abs() < 1.0);
    }

    #[test]
    fn test_latency_quantiles() {
        let mut sketch = LatencySketch::new();
        for i in 1..=100 {
            sketch.observe_ms(i as f64);
        }
        let p95 = sketch.p95_ms();
        assert!((90.0..=100.0).contains(&p95), "p95 was {p95}");
        assert!(sketch.p99_ms() >= p95);
    }

    #[test]
    fn test_distinct_estimate_small_and_large() {
        let mut sketch = DistinctSketch::new();
        for i in 0..10 {
            sketch.observe(&i);
        }
        let small = sketch.estimate();
        assert!((5..=20).contains(&small), "small estimate was {small}");

        for i in 0..10_000 {
            sketch.observe(&i);
        }
        let large = sketch.estimate();
        assert!(
            (5_000..=20_000).contains(&large),
            "large estimate was {large}"
        );
    }

    #[test]
    fn test_distinct_estimate_is_insensitive_to_repeats() {
        let mut sketch = DistinctSketch::new();
        for _ in 0..1_000 {
            sketch.observe(&"same");
        }
        assert!(sketch.estimate() <= 2);
    }
}
