use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::utils::parse_prefilter_tag;
use crate::ANNOTATION_LABEL;

/// Per-signal descriptor from the signal table of the header.
///
/// Digital and physical ranges form a linear calibration pair: a raw
/// 16-bit sample `d` maps to `bit_value() * (offset() + d)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDescriptor {
    pub label: String,
    pub transducer: String,
    pub physical_dimension: String,
    pub physical_min: f64,
    pub physical_max: f64,
    pub digital_min: i32,
    pub digital_max: i32,
    pub prefilter: String,
    pub samples_per_record: usize,
    pub reserved: String,
}

impl SignalDescriptor {
    /// An ordinary signal with full-range calibration and one sample per record.
    pub fn new(label: &str) -> Self {
        SignalDescriptor {
            label: label.to_string(),
            transducer: String::new(),
            physical_dimension: String::new(),
            physical_min: -1.0,
            physical_max: 1.0,
            digital_min: -32768,
            digital_max: 32767,
            prefilter: String::new(),
            samples_per_record: 1,
            reserved: String::new(),
        }
    }

    /// The synthesized annotation channel: digital `[-32768, 32767]` maps to physical `[0, 1]`.
    pub fn annotation(samples_per_record: usize) -> Self {
        SignalDescriptor {
            label: ANNOTATION_LABEL.to_string(),
            physical_min: 0.0,
            physical_max: 1.0,
            samples_per_record,
            ..SignalDescriptor::new(ANNOTATION_LABEL)
        }
    }

    pub fn is_annotation(&self) -> bool {
        self.label.trim_end() == ANNOTATION_LABEL
    }

    /// Bytes this signal occupies in one data record.
    pub fn record_bytes(&self) -> usize {
        self.samples_per_record * 2
    }

    /// 计算物理值转换参数
    pub fn bit_value(&self) -> f64 {
        (self.physical_max - self.physical_min) /
        (self.digital_max - self.digital_min) as f64
    }

    /// 计算偏移量
    pub fn offset(&self) -> f64 {
        self.physical_max / self.bit_value() - self.digital_max as f64
    }

    /// 将数字值转换为物理值
    pub fn to_physical(&self, digital_value: i32) -> f64 {
        self.bit_value() * (self.offset() + digital_value as f64)
    }

    /// 将物理值转换为数字值
    pub fn to_digital(&self, physical_value: f64) -> i32 {
        let digital = (physical_value / self.bit_value()) - self.offset();
        (digital.round() as i32).clamp(self.digital_min, self.digital_max)
    }

    /// Low-pass corner embedded in the prefilter text as `LP:<f>Hz`.
    ///
    /// ```rust
    /// use edfplus_engine::SignalDescriptor;
    ///
    /// let mut signal = SignalDescriptor::new("EEG Fp1");
    /// signal.prefilter = "HP:0.1Hz LP:70Hz".to_string();
    /// assert_eq!(signal.lowpass(), Some(70.0));
    /// assert_eq!(signal.highpass(), Some(0.1));
    /// ```
    pub fn lowpass(&self) -> Option<f64> {
        parse_prefilter_tag(&self.prefilter, "LP:")
    }

    /// High-pass corner embedded in the prefilter text as `HP:<f>Hz`.
    pub fn highpass(&self) -> Option<f64> {
        parse_prefilter_tag(&self.prefilter, "HP:")
    }

    /// Best-effort short form of the label, e.g. `"EEG Fp1-Ref"` becomes `"Fp1"`.
    ///
    /// Not guaranteed to be unique across the signals of a file.
    pub fn simplified_label(&self) -> String {
        const TYPE_PREFIXES: [&str; 6] = ["EEG", "ECG", "EMG", "EOG", "RESP", "SAO2"];

        let mut label = self.label.trim();
        for prefix in TYPE_PREFIXES {
            if let Some(rest) = label.strip_prefix(prefix) {
                if rest.starts_with(' ') {
                    label = rest.trim_start();
                    break;
                }
            }
        }
        for suffix in ["-Ref", "-REF", "-ref"] {
            if let Some(rest) = label.strip_suffix(suffix) {
                label = rest;
                break;
            }
        }
        if label.is_empty() {
            self.label.trim().to_string()
        } else {
            label.to_string()
        }
    }
}

/// One entry of a Time-stamped Annotations List.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    /// Seconds since the file start.
    pub onset: f64,
    pub duration: Option<f64>,
    pub texts: Vec<String>,
    /// Annotation channel (0-based among annotation signals) the entry is stored in.
    pub channel: usize,
}

impl Annotation {
    pub fn new(onset: f64, duration: Option<f64>, text: &str) -> Self {
        Annotation {
            onset,
            duration,
            texts: vec![text.to_string()],
            channel: 0,
        }
    }

    /// Whether onset and duration are finite numbers.
    pub fn is_finite(&self) -> bool {
        self.onset.is_finite() && self.duration.map_or(true, f64::is_finite)
    }
}

/// Annotations stored in one data record.
#[derive(Debug, Clone)]
pub struct AnnotationBlock {
    pub record: usize,
    /// Onset of the data record in seconds, `NaN` while not decoded.
    pub onset: f64,
    pub annotations: Vec<Annotation>,
    pub modified: bool,
}

impl AnnotationBlock {
    pub fn new(record: usize, onset: f64) -> Self {
        AnnotationBlock {
            record,
            onset,
            annotations: Vec::new(),
            modified: false,
        }
    }

    /// Unloaded placeholder for `record`.
    pub fn placeholder(record: usize) -> Self {
        Self::new(record, f64::NAN)
    }

    pub fn is_decoded(&self) -> bool {
        !self.onset.is_nan()
    }
}

macro_rules! bit_flags {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $value:expr,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: $name = $name($value);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let names: Vec<&str> = [$(($name::$flag, stringify!($flag)),)*]
                    .iter()
                    .filter(|(flag, _)| self.contains(*flag))
                    .map(|(_, name)| *name)
                    .collect();
                if names.is_empty() {
                    write!(f, "NONE")
                } else {
                    write!(f, "{}", names.join("|"))
                }
            }
        }
    };
}

bit_flags! {
    /// Non-fatal format problems found while opening or reading a file.
    HeaderErrors {
        /// No signal labelled `EDF Annotations`.
        MISSING_ANNOTATION_SIGNAL = 1 << 0,
        /// Record duration is 0 but the signal table does not describe an event file.
        ZERO_DURATION_LAYOUT = 1 << 1,
        /// One or more header fields could not be parsed.
        INVALID_FIELDS = 1 << 2,
        /// Record byte size is above `RECOMMENDED_MAX_RECORD_BYTES`.
        RECORD_SIZE_EXCEEDED = 1 << 3,
        /// `HeaderBytes + NrDataRecords * RecordByteSize` differs from the file size.
        FILE_SIZE_MISMATCH = 1 << 4,
        /// Annotation block onsets are not non-decreasing.
        BLOCK_ORDER = 1 << 5,
        /// An annotation channel could not be decoded.
        ANNOTATION_DECODE = 1 << 6,
        /// Onset of the first data record is outside `[0, 1)`.
        FIRST_RECORD_OFFSET = 1 << 7,
    }
}

impl HeaderErrors {
    /// Problems that make the format invalid regardless of the checking policy.
    pub const FATAL: HeaderErrors = HeaderErrors(
        Self::MISSING_ANNOTATION_SIGNAL.0 | Self::ZERO_DURATION_LAYOUT.0 | Self::INVALID_FIELDS.0,
    );

    /// Problems that only count while strict checking is on.
    pub const STRICT: HeaderErrors = HeaderErrors(
        Self::RECORD_SIZE_EXCEEDED.0
            | Self::FILE_SIZE_MISMATCH.0
            | Self::BLOCK_ORDER.0
            | Self::ANNOTATION_DECODE.0
            | Self::FIRST_RECORD_OFFSET.0,
    );

    /// Whether a file carrying these errors has a valid format under the given policy.
    pub fn valid_format(self, strict: bool) -> bool {
        !self.intersects(Self::FATAL) && !(strict && self.intersects(Self::STRICT))
    }
}

bit_flags! {
    /// Header fields that failed to parse.
    HeaderFields {
        VERSION = 1 << 0,
        PATIENT = 1 << 1,
        RECORDING = 1 << 2,
        START_DATE = 1 << 3,
        START_TIME = 1 << 4,
        HEADER_BYTES = 1 << 5,
        RESERVED = 1 << 6,
        NR_RECORDS = 1 << 7,
        RECORD_DURATION = 1 << 8,
        NR_SIGNALS = 1 << 9,
        SIGNAL_TABLE = 1 << 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibration_roundtrip_clamps() {
        let mut signal = SignalDescriptor::new("EEG");
        signal.physical_min = -100.0;
        signal.physical_max = 100.0;

        assert!((signal.to_physical(32767) - 100.0).abs() < 1e-9);
        assert!((signal.to_physical(-32768) + 100.0).abs() < 1e-9);
        assert_eq!(signal.to_digital(1000.0), 32767);
        assert!((signal.to_digital(50.0) - 16383).abs() <= 1);
    }

    #[test]
    fn test_annotation_descriptor() {
        let signal = SignalDescriptor::annotation(10);
        assert!(signal.is_annotation());
        assert_eq!(signal.record_bytes(), 20);
        assert_eq!(signal.physical_min, 0.0);
        assert_eq!(signal.physical_max, 1.0);
        assert_eq!(signal.digital_min, -32768);
        assert_eq!(signal.digital_max, 32767);
    }

    #[test]
    fn test_simplified_label() {
        assert_eq!(SignalDescriptor::new("EEG Fp1-Ref").simplified_label(), "Fp1");
        assert_eq!(SignalDescriptor::new("ECG Lead II").simplified_label(), "Lead II");
        assert_eq!(SignalDescriptor::new("Pleth").simplified_label(), "Pleth");
        assert_eq!(SignalDescriptor::new("EEG").simplified_label(), "EEG");
    }

    #[test]
    fn test_header_errors_policy() {
        let errors = HeaderErrors::FILE_SIZE_MISMATCH;
        assert!(!errors.valid_format(true));
        assert!(errors.valid_format(false));

        let fatal = HeaderErrors::MISSING_ANNOTATION_SIGNAL | HeaderErrors::BLOCK_ORDER;
        assert!(!fatal.valid_format(false));
        assert_eq!(fatal.to_string(), "MISSING_ANNOTATION_SIGNAL|BLOCK_ORDER");
        assert!(HeaderErrors::empty().valid_format(true));
    }
}
