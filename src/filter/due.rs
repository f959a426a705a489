use std::f64::consts::PI;

use super::{Filter, FilterSettings, RecursiveFilter, Setting, GAIN_SLOT, SAMPLE_FREQUENCY_SLOT};

pub const CUTOFF_SLOT: usize = 3;

/// Inverse first-order low-pass with integrator.
///
/// Undoes a first-order high-pass with cutoff `fc`: the integrator restores
/// the attenuated low frequencies and the zero pair, designed with a
/// prewarped bilinear transform, keeps the pass band flat.
#[derive(Debug, Clone)]
pub struct DueFilter {
    settings: FilterSettings,
    core: RecursiveFilter,
}

impl Default for DueFilter {
    fn default() -> Self {
        Self::new(100.0, 0.1)
    }
}

impl DueFilter {
    pub fn new(sample_frequency: f64, cutoff: f64) -> Self {
        DueFilter {
            settings: FilterSettings::new(
                "DUE",
                sample_frequency,
                1.0,
                vec![Setting::custom("Cutoff", "Hz", cutoff)],
            ),
            core: RecursiveFilter::new(),
        }
    }
}

impl Filter for DueFilter {
    fn name(&self) -> &'static str {
        "DUE"
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
        if !self.settings.frequency_in_range(CUTOFF_SLOT) {
            return Some(CUTOFF_SLOT);
        }
        None
    }

    fn design(&self) -> (Vec<f64>, Vec<f64>) {
        let ts = 1.0 / self.settings.sample_frequency().unwrap_or(1.0);
        let cutoff = self.settings.number(CUTOFF_SLOT).unwrap_or(0.0);
        let gain = self.settings.gain();

        let prewarped = (PI * cutoff * ts).tan() / (PI * ts);
        let r = 1.0 / (2.0 * PI * prewarped);
        (
            vec![gain * (ts / 2.0 + r), gain * (ts / 2.0 - r)],
            vec![1.0, 1.0],
        )
    }

    fn core(&self) -> &RecursiveFilter {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RecursiveFilter {
        &mut self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EdfError;

    #[test]
    fn test_check_settings_boundaries() {
        let mut due = DueFilter::new(100.0, -1.0);
        assert_eq!(due.check_settings(), Some(CUTOFF_SLOT));

        due.settings_mut().set_number(CUTOFF_SLOT, 60.0);
        assert_eq!(due.check_settings(), Some(3));

        due.settings_mut().set_number(CUTOFF_SLOT, 50.0);
        assert_eq!(due.check_settings(), None);

        due.settings_mut().set_number(CUTOFF_SLOT, 10.0);
        assert_eq!(due.check_settings(), None);

        due.settings_mut().set_number(SAMPLE_FREQUENCY_SLOT, 0.0);
        assert_eq!(due.check_settings(), Some(SAMPLE_FREQUENCY_SLOT));
    }

    #[test]
    fn test_invalid_setting_blocks_filtering() {
        let mut due = DueFilter::new(100.0, 60.0);
        let mut data = [1.0; 4];
        let result = due.filter_in_place(&mut data, 0, 3);
        assert!(matches!(result, Err(EdfError::FilterSetting { slot: 3, .. })));
        assert!(due.reset().is_err());
    }

    #[test]
    fn test_coefficients() {
        let mut due = DueFilter::new(100.0, 10.0);
        due.calculate_coefficients().unwrap();
        let zeros = due.core().zeros().to_vec();
        let ts = 0.01;
        let r = 1.0 / (2.0 * (PI * 10.0 * ts).tan() / ts);
        assert!((zeros[0] - (ts / 2.0 + r)).abs() < 1e-12);
        assert!((zeros[1] - (ts / 2.0 - r)).abs() < 1e-12);
        assert_eq!(due.core().poles(), &[1.0, 1.0]);
        assert!(!due.settings().is_stale());
    }

    #[test]
    fn test_step_response_integrates() {
        let mut due = DueFilter::new(100.0, 10.0);
        due.reset().unwrap();
        let mut data = [1.0; 5];
        due.filter_in_place(&mut data, 0, 4).unwrap();

        let zeros = due.core().zeros().to_vec();
        assert!((data[0] - zeros[0]).abs() < 1e-12);
        for n in 1..5 {
            // gain * ts per sample once both taps see the step
            assert!((data[n] - data[n - 1] - 0.01).abs() < 1e-12);
        }
    }

    #[test]
    fn test_reset_to_sets_integrator_output() {
        let mut due = DueFilter::new(100.0, 10.0);
        due.reset_to(4.0).unwrap();
        let mut data = [0.0; 1];
        due.filter_in_place(&mut data, 0, 0).unwrap();
        // integrator holds 4, the zero pair sees 0 now and 4 one sample back
        let zeros = due.core().zeros().to_vec();
        assert!((data[0] - (4.0 + zeros[1] * 4.0)).abs() < 1e-12);
    }
}
