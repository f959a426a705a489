//! Data-record duration search.
//!
//! Durations are searched as integer microseconds and sample rates are
//! handled in milli-Hertz, so "integer sample count" is decided with exact
//! integer arithmetic instead of floating point comparisons.

const MICROS_PER_SECOND: u128 = 1_000_000;
const MILLIHERTZ_PER_HERTZ: f64 = 1000.0;
/// `rate[mHz] * duration[us] / COUNT_SCALE` is the sample count per record.
const COUNT_SCALE: u128 = 1_000_000_000;
/// Upper bound on scanned candidates when no exact duration fits.
const SEARCH_LIMIT: u128 = 50_000_000;

/// Outcome of a record duration search.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSize {
    /// Record duration in seconds.
    pub duration: f64,
    /// Samples per record for each input rate (rounded down).
    pub samples: Vec<usize>,
    /// Worst relative rounding error over all signals, 0 for an exact duration.
    pub max_error: f64,
    /// Bytes one record occupies (2 bytes per sample).
    pub record_bytes: usize,
    /// Integer multiples of an exact duration that still fit the byte limit.
    pub alternatives: Vec<f64>,
}

/// Chooses a data-record duration for a set of sample rates.
///
/// ```rust
/// use edfplus_engine::BlockSizeCalculator;
///
/// let block = BlockSizeCalculator::new(&[100.0, 1.0], 61_440).calculate().unwrap();
/// assert_eq!(block.duration, 1.0);
/// assert_eq!(block.samples, vec![100, 1]);
/// assert_eq!(block.max_error, 0.0);
/// ```
#[derive(Debug, Clone)]
pub struct BlockSizeCalculator {
    rates: Vec<f64>,
    max_record_bytes: usize,
}

impl BlockSizeCalculator {
    pub fn new(rates: &[f64], max_record_bytes: usize) -> Self {
        BlockSizeCalculator {
            rates: rates.to_vec(),
            max_record_bytes,
        }
    }

    /// Runs the search; `None` when no duration keeps every signal within the byte limit.
    pub fn calculate(&self) -> Option<BlockSize> {
        if self.rates.is_empty() {
            return None;
        }
        let mut millihertz = Vec::with_capacity(self.rates.len());
        for &rate in &self.rates {
            let scaled = (rate * MILLIHERTZ_PER_HERTZ).round();
            if !scaled.is_finite() || scaled < 1.0 {
                return None;
            }
            millihertz.push(scaled as u128);
        }
        let max_bytes = self.max_record_bytes as u128;

        // 每个信号至少一个样本
        let shortest = millihertz
            .iter()
            .map(|&m| COUNT_SCALE.div_ceil(m))
            .max()?;

        let exact = millihertz
            .iter()
            .map(|&m| COUNT_SCALE / gcd(m, COUNT_SCALE))
            .fold(1, lcm);
        let exact_bytes = record_bytes(&millihertz, exact);
        let bound = exact.saturating_mul(max_bytes) / exact_bytes.max(1);
        let last = bound.min(shortest.saturating_add(SEARCH_LIMIT));

        log::debug!(
            "Record duration search: {}..={} us, exact duration {} us ({} bytes)",
            shortest, last, exact, exact_bytes
        );

        let mut best: Option<(u128, f64)> = None;
        let mut candidate = shortest;
        while candidate <= last {
            if record_bytes(&millihertz, candidate) > max_bytes {
                break;
            }
            if let Some(error) = worst_error(&millihertz, candidate) {
                if best.map_or(true, |(_, best_error)| error < best_error) {
                    best = Some((candidate, error));
                }
                if error == 0.0 {
                    break;
                }
            }
            candidate += 1;
        }

        let (micros, max_error) = best?;
        let samples = millihertz
            .iter()
            .map(|&m| (m * micros / COUNT_SCALE) as usize)
            .collect();

        let mut alternatives = Vec::new();
        if max_error == 0.0 {
            let mut multiple = 2;
            while record_bytes(&millihertz, micros * multiple) <= max_bytes {
                alternatives.push(to_seconds(micros * multiple));
                multiple += 1;
            }
        }

        Some(BlockSize {
            duration: to_seconds(micros),
            samples,
            max_error,
            record_bytes: record_bytes(&millihertz, micros) as usize,
            alternatives,
        })
    }
}

fn to_seconds(micros: u128) -> f64 {
    micros as f64 / MICROS_PER_SECOND as f64
}

fn record_bytes(millihertz: &[u128], micros: u128) -> u128 {
    millihertz.iter().map(|&m| 2 * (m * micros / COUNT_SCALE)).sum()
}

/// Largest `(count - floor(count)) / floor(count)` over all signals, `None`
/// when a signal would get no sample at all.
fn worst_error(millihertz: &[u128], micros: u128) -> Option<f64> {
    let mut worst = 0.0f64;
    for &m in millihertz {
        let product = m * micros;
        let whole = product / COUNT_SCALE;
        if whole == 0 {
            return None;
        }
        let fraction = (product % COUNT_SCALE) as f64 / COUNT_SCALE as f64;
        worst = worst.max(fraction / whole as f64);
    }
    Some(worst)
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

fn lcm(a: u128, b: u128) -> u128 {
    a / gcd(a, b) * b
}
