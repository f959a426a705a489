use std::f64::consts::PI;

use super::{Filter, FilterSettings, RecursiveFilter, Setting, GAIN_SLOT, SAMPLE_FREQUENCY_SLOT};

pub const CUTOFF_SLOT: usize = 3;
pub const CENTER_SLOT: usize = 4;
pub const BANDWIDTH_SLOT: usize = 5;

/// Second-order low-pass with a notch.
///
/// Poles: prewarped bilinear low-pass at the cutoff with damping
/// `bandwidth / cutoff`. Zeros: a pair on the unit circle at the center
/// frequency. The numerator is scaled to a DC gain equal to the gain setting.
#[derive(Debug, Clone)]
pub struct SeFilter {
    settings: FilterSettings,
    core: RecursiveFilter,
}

impl Default for SeFilter {
    fn default() -> Self {
        Self::new(256.0, 30.0, 50.0, 5.0)
    }
}

impl SeFilter {
    pub fn new(sample_frequency: f64, cutoff: f64, center: f64, bandwidth: f64) -> Self {
        SeFilter {
            settings: FilterSettings::new(
                "SE",
                sample_frequency,
                1.0,
                vec![
                    Setting::custom("Cutoff", "Hz", cutoff),
                    Setting::custom("Center frequency", "Hz", center),
                    Setting::custom("Bandwidth", "Hz", bandwidth),
                ],
            ),
            core: RecursiveFilter::new(),
        }
    }
}

/// DC gain of the notch numerator `1 - 2cos(w)z^-1 + z^-2`.
fn notch_denominator(settings: &FilterSettings) -> f64 {
    let ts = 1.0 / settings.sample_frequency().unwrap_or(1.0);
    let center = settings.number(CENTER_SLOT).unwrap_or(1.0);
    2.0 - 2.0 * (2.0 * PI * center * ts).cos()
}

impl Filter for SeFilter {
    fn name(&self) -> &'static str {
        "SE"
    }

    fn settings(&self) -> &FilterSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut FilterSettings {
        &mut self.settings
    }

    fn check_settings(&self) -> Option<usize> {
        if !self.settings.sample_frequency().map_or(false, |fs| fs > 0.0 && fs.is_finite()) {
            return Some(SAMPLE_FREQUENCY_SLOT);
        }
        if !self.settings.number(GAIN_SLOT).map_or(false, f64::is_finite) {
            return Some(GAIN_SLOT);
        }
        if let Some(slot) = [CUTOFF_SLOT, CENTER_SLOT, BANDWIDTH_SLOT]
            .into_iter()
            .find(|&slot| !self.settings.frequency_in_range(slot))
        {
            return Some(slot);
        }
        // 陷波频率过低时 DC 增益归一化的分母为零
        if notch_denominator(&self.settings) <= f64::EPSILON {
            return Some(CENTER_SLOT);
        }
        None
    }

    fn design(&self) -> (Vec<f64>, Vec<f64>) {
        let ts = 1.0 / self.settings.sample_frequency().unwrap_or(1.0);
        let cutoff = self.settings.number(CUTOFF_SLOT).unwrap_or(1.0);
        let center = self.settings.number(CENTER_SLOT).unwrap_or(1.0);
        let bandwidth = self.settings.number(BANDWIDTH_SLOT).unwrap_or(1.0);
        let gain = self.settings.gain();

        let k = (PI * cutoff * ts).tan();
        let damping = bandwidth / cutoff;
        let a0 = k * k + k * damping + 1.0;
        let a1 = 2.0 * (k * k - 1.0);
        let a2 = k * k - k * damping + 1.0;
        let p1 = -a1 / a0;
        let p2 = -a2 / a0;

        let cos_center = (2.0 * PI * center * ts).cos();
        let scale = gain * (1.0 - p1 - p2) / notch_denominator(&self.settings);
        (
            vec![scale, -2.0 * cos_center * scale, scale],
            vec![1.0, p1, p2],
        )
    }

    fn core(&self) -> &RecursiveFilter {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RecursiveFilter {
        &mut self.core
    }
}
