//! Recursive digital filters with indexed settings.
//!
//! Every filter exposes its parameters as numbered slots: slot 0 is a
//! read-only description, slot 1 the sample frequency, slot 2 the gain and
//! higher slots are filter specific. Writing a setting marks the coefficients
//! stale; they are recomputed before the next filtering or reset call.
//!
//! ```rust
//! use edfplus_engine::filter::{self, Filter};
//!
//! let mut se = filter::parse_filter("SE(1/30/50/5)")?;
//! se.settings_mut().set_number(1, 256.0);
//!
//! let input: Vec<f64> = (0..256).map(|i| (i as f64 * 0.3).sin()).collect();
//! let mut output = vec![0.0; input.len()];
//! se.filter_samples(&input, &mut output, 0, input.len() - 1, 0)?;
//!
//! assert_eq!(filter::describe(se.as_ref()), "SE(1/30/50/5)");
//! # Ok::<(), edfplus_engine::EdfError>(())
//! ```

mod due;
mod recursive;
mod se;

pub use due::DueFilter;
pub use recursive::RecursiveFilter;
pub use se::SeFilter;

use std::fmt;

use crate::error::{EdfError, Result};

pub const DESCRIPTION_SLOT: usize = 0;
pub const SAMPLE_FREQUENCY_SLOT: usize = 1;
pub const GAIN_SLOT: usize = 2;

/// Processing order of [`Filter::filter_samples`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    /// Decreasing sample index, for backward passes.
    Reverse,
}

/// Snapshot of a filter's delay lines.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterState {
    pub(crate) zeros: Vec<f64>,
    pub(crate) poles: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Number(value) => write!(f, "{}", value),
            SettingValue::Text(text) => f.write_str(text),
        }
    }
}

/// One settings slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Setting {
    Description(String),
    SampleFrequency(f64),
    Gain(f64),
    Custom {
        name: String,
        dimension: String,
        value: SettingValue,
        read_only: bool,
    },
}

impl Setting {
    /// Writable numeric filter-specific setting.
    pub fn custom(name: &str, dimension: &str, value: f64) -> Self {
        Setting::Custom {
            name: name.to_string(),
            dimension: dimension.to_string(),
            value: SettingValue::Number(value),
            read_only: false,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Setting::Description(_) => "Description",
            Setting::SampleFrequency(_) => "Sample frequency",
            Setting::Gain(_) => "Gain",
            Setting::Custom { name, .. } => name,
        }
    }

    pub fn dimension(&self) -> &str {
        match self {
            Setting::SampleFrequency(_) => "Hz",
            Setting::Custom { dimension, .. } => dimension,
            _ => "",
        }
    }

    pub fn is_read_only(&self) -> bool {
        match self {
            Setting::Description(_) => true,
            Setting::Custom { read_only, .. } => *read_only,
            _ => false,
        }
    }

    pub fn number(&self) -> Option<f64> {
        match self {
            Setting::SampleFrequency(value) | Setting::Gain(value) => Some(*value),
            Setting::Custom { value: SettingValue::Number(value), .. } => Some(*value),
            _ => None,
        }
    }

    pub fn value(&self) -> SettingValue {
        match self {
            Setting::Description(text) => SettingValue::Text(text.clone()),
            Setting::SampleFrequency(value) | Setting::Gain(value) => SettingValue::Number(*value),
            Setting::Custom { value, .. } => value.clone(),
        }
    }
}

/// Ordered settings slots plus the "coefficients stale" flag.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSettings {
    slots: Vec<Setting>,
    stale: bool,
}

impl FilterSettings {
    /// Description, sample frequency and gain slots followed by `custom`.
    pub fn new(description: &str, sample_frequency: f64, gain: f64, custom: Vec<Setting>) -> Self {
        let mut slots = vec![
            Setting::Description(description.to_string()),
            Setting::SampleFrequency(sample_frequency),
            Setting::Gain(gain),
        ];
        slots.extend(custom);
        FilterSettings { slots, stale: true }
    }

    /// Settings from explicit slots; at least description and sample frequency are required.
    pub fn from_slots(slots: Vec<Setting>) -> Result<Self> {
        if slots.len() < 2 {
            return Err(EdfError::InvalidArgument(format!(
                "a filter needs at least 2 settings, got {}",
                slots.len()
            )));
        }
        Ok(FilterSettings { slots, stale: true })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&Setting> {
        self.slots.get(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Setting> {
        self.slots.iter()
    }

    pub fn number(&self, slot: usize) -> Option<f64> {
        self.get(slot).and_then(Setting::number)
    }

    pub fn description(&self) -> &str {
        match self.slots.first() {
            Some(Setting::Description(text)) => text,
            _ => "",
        }
    }

    pub fn sample_frequency(&self) -> Option<f64> {
        self.number(SAMPLE_FREQUENCY_SLOT)
    }

    pub fn gain(&self) -> f64 {
        self.number(GAIN_SLOT).unwrap_or(1.0)
    }

    /// Writes a number; returns `false` (and changes nothing) for read-only or missing slots.
    pub fn set_number(&mut self, slot: usize, number: f64) -> bool {
        let Some(setting) = self.slots.get_mut(slot) else {
            return false;
        };
        match setting {
            Setting::SampleFrequency(value) | Setting::Gain(value) => *value = number,
            Setting::Custom { value, read_only: false, .. } => *value = SettingValue::Number(number),
            _ => return false,
        }
        self.stale = true;
        true
    }

    /// Writes text into a writable filter-specific slot.
    pub fn set_text(&mut self, slot: usize, text: &str) -> bool {
        match self.slots.get_mut(slot) {
            Some(Setting::Custom { value, read_only: false, .. }) => {
                *value = SettingValue::Text(text.to_string());
                self.stale = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub(crate) fn mark_fresh(&mut self) {
        self.stale = false;
    }

    /// Whether slot `slot` holds a number in `(0, sample_frequency / 2]`.
    pub fn frequency_in_range(&self, slot: usize) -> bool {
        match (self.number(slot), self.sample_frequency()) {
            (Some(frequency), Some(sample_frequency)) => {
                frequency > 0.0 && frequency <= sample_frequency / 2.0
            }
            _ => false,
        }
    }
}

/// A recursive filter driven by indexed settings.
///
/// Implementors provide their settings, validation and coefficient design; the
/// filtering itself runs on the shared [`RecursiveFilter`] core.
pub trait Filter: Send {
    fn name(&self) -> &'static str;

    fn settings(&self) -> &FilterSettings;

    fn settings_mut(&mut self) -> &mut FilterSettings;

    /// Slot index of the first invalid setting, `None` when all are valid.
    fn check_settings(&self) -> Option<usize>;

    /// `(zeros, poles)` for valid settings, with `poles[0] == 1`.
    fn design(&self) -> (Vec<f64>, Vec<f64>);

    fn core(&self) -> &RecursiveFilter;

    fn core_mut(&mut self) -> &mut RecursiveFilter;

    fn calculate_coefficients(&mut self) -> Result<()> {
        if let Some(slot) = self.check_settings() {
            return Err(EdfError::FilterSetting {
                filter: self.name().to_string(),
                slot,
            });
        }
        let (zeros, poles) = self.design();
        log::trace!("{} coefficients: zeros {:?}, poles {:?}", self.name(), zeros, poles);
        self.core_mut().set_coefficients(zeros, poles);
        self.settings_mut().mark_fresh();
        Ok(())
    }

    /// Recomputes coefficients when settings changed since the last computation.
    fn ensure_coefficients(&mut self) -> Result<()> {
        if self.settings().is_stale() || !self.core().has_coefficients() {
            self.calculate_coefficients()?;
        }
        Ok(())
    }

    /// Filters `input[start..=end]` into `output` from `out_start` on.
    fn filter_samples(
        &mut self,
        input: &[f64],
        output: &mut [f64],
        start: usize,
        end: usize,
        out_start: usize,
    ) -> Result<()> {
        self.ensure_coefficients()?;
        self.core_mut().filter_samples(input, output, start, end, out_start)
    }

    fn filter_in_place(&mut self, data: &mut [f64], start: usize, end: usize) -> Result<()> {
        self.ensure_coefficients()?;
        self.core_mut().filter_in_place(data, start, end)
    }

    /// Clears both delay lines.
    fn reset(&mut self) -> Result<()> {
        self.ensure_coefficients()?;
        self.core_mut().reset();
        Ok(())
    }

    /// Reinitializes the filter from the next input sample.
    fn reset_on_next_sample(&mut self) {
        self.core_mut().reset_on_next_sample();
    }

    /// Steady state for a constant input `value`.
    fn reset_to(&mut self, value: f64) -> Result<()> {
        self.ensure_coefficients()?;
        self.core_mut().reset_to(value);
        Ok(())
    }

    fn save_state(&self) -> FilterState {
        self.core().save_state()
    }

    fn restore_state(&mut self, state: &FilterState) -> Result<()> {
        self.core_mut().restore_state(state)
    }

    fn direction(&self) -> Direction {
        self.core().direction()
    }

    fn set_direction(&mut self, direction: Direction) {
        self.core_mut().set_direction(direction);
    }
}

type Constructor = fn() -> Box<dyn Filter>;

fn new_due() -> Box<dyn Filter> {
    Box::new(DueFilter::default())
}

fn new_se() -> Box<dyn Filter> {
    Box::new(SeFilter::default())
}

const REGISTRY: &[(&str, Constructor)] = &[("DUE", new_due), ("SE", new_se)];

/// Known filter names with their constructors.
pub fn registry() -> &'static [(&'static str, Constructor)] {
    REGISTRY
}

/// New filter with default settings, looked up case-insensitively.
pub fn create_filter(name: &str) -> Result<Box<dyn Filter>> {
    REGISTRY
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(name.trim()))
        .map(|(_, constructor)| constructor())
        .ok_or_else(|| EdfError::UnknownFilter(name.to_string()))
}

/// Builds a filter from its string form `NAME(p2/p3/...)`.
///
/// Parameters fill writable slots from the gain slot on; tokens that are not
/// numbers are stored as text settings.
pub fn parse_filter(text: &str) -> Result<Box<dyn Filter>> {
    let text = text.trim();
    let (name, parameters) = match text.find('(') {
        Some(open) => {
            let close = text
                .rfind(')')
                .filter(|&close| close > open)
                .ok_or_else(|| EdfError::InvalidArgument(format!("unbalanced parentheses in {}", text)))?;
            (&text[..open], &text[open + 1..close])
        }
        None => (text, ""),
    };

    let mut filter = create_filter(name)?;
    let mut slot = GAIN_SLOT;
    for token in parameters.split('/').map(str::trim).filter(|t| !t.is_empty()) {
        let settings = filter.settings_mut();
        while settings.get(slot).map_or(false, Setting::is_read_only) {
            slot += 1;
        }
        if slot >= settings.len() {
            return Err(EdfError::InvalidArgument(format!(
                "too many parameters for {}: {}",
                name, text
            )));
        }
        let written = match token.parse::<f64>() {
            Ok(number) => settings.set_number(slot, number),
            Err(_) => settings.set_text(slot, token),
        };
        if !written {
            return Err(EdfError::FilterSetting {
                filter: name.trim().to_string(),
                slot,
            });
        }
        slot += 1;
    }
    Ok(filter)
}

/// String form of `filter`, the inverse of [`parse_filter`].
pub fn describe(filter: &dyn Filter) -> String {
    let parameters: Vec<String> = filter
        .settings()
        .iter()
        .skip(GAIN_SLOT)
        .filter(|setting| !setting.is_read_only())
        .map(|setting| setting.value().to_string())
        .collect();
    format!("{}({})", filter.name(), parameters.join("/"))
}
