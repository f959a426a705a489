use std::io::Read;
use std::ops::Range;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::error::{EdfError, Result};
use crate::types::{HeaderFields, SignalDescriptor};
use crate::utils::{field_str, format_number_field, pad_field, parse_float_field, parse_int_field};
use crate::EDFLIB_MAXSIGNALS;

/// Size of the fixed part of the header and of each signal's share of the signal table.
pub const HEADER_BLOCK_SIZE: usize = 256;

/// The fixed ASCII file header plus the per-signal descriptor table.
///
/// Fields are only changed through validated setters; every successful
/// setter marks the header as modified. Changing the number of signals or a
/// signal's sample count advances [`FileHeader::layout_generation`], which
/// tells the owner that the data-record layout has to be recomputed.
#[derive(Debug, Clone)]
pub struct FileHeader {
    patient: String,
    recording: String,
    start: NaiveDateTime,
    reserved: String,
    nr_data_records: i64,
    record_duration: f64,
    signals: Vec<SignalDescriptor>,
    edf_plus: bool,
    continuous: bool,
    invalid_fields: HeaderFields,
    modified: bool,
    layout_generation: u64,
}

impl FileHeader {
    /// Header of a new EDF+ file: `nr_ordinary_signals` default signals followed
    /// by one annotation signal with `annotation_samples` samples per record.
    pub fn new_edf_plus(nr_ordinary_signals: usize, annotation_samples: usize) -> Self {
        let mut signals: Vec<SignalDescriptor> = (0..nr_ordinary_signals)
            .map(|_| SignalDescriptor::new(""))
            .collect();
        signals.push(SignalDescriptor::annotation(annotation_samples));

        let start = default_start();
        FileHeader {
            patient: "X X X X".to_string(),
            recording: recording_for(start.date()),
            start,
            reserved: "EDF+C".to_string(),
            nr_data_records: 0,
            record_duration: 1.0,
            signals,
            edf_plus: true,
            continuous: true,
            invalid_fields: HeaderFields::empty(),
            modified: true,
            layout_generation: 0,
        }
    }

    /// Parses the fixed header and the signal table.
    ///
    /// Unparsable values are recorded in [`FileHeader::invalid_fields`] and replaced by
    /// defaults; only a header that cannot be located at all is an error.
    pub fn parse<R: Read>(reader: &mut R) -> Result<Self> {
        // 读取主头部（256字节）
        let mut main_header = [0u8; HEADER_BLOCK_SIZE];
        reader.read_exact(&mut main_header)?;
        let mut invalid = HeaderFields::empty();

        // 验证EDF标识
        let version = field_str(&main_header[0..8]);
        if version != "0" {
            if version.starts_with('0') {
                invalid.insert(HeaderFields::VERSION);
            } else {
                return Err(EdfError::UnsupportedFileType(format!("Not an EDF file: {}", version)));
            }
        }

        // 解析信号数量
        let nr_signals = match parse_int_field(&field_str(&main_header[252..256])) {
            Some(n) if n >= 1 && n <= EDFLIB_MAXSIGNALS as i64 => n as usize,
            Some(n) => return Err(EdfError::InvalidSignalCount(n)),
            None => return Err(EdfError::InvalidSignalCount(-1)),
        };

        // 验证头部大小
        let expected_header_bytes = (nr_signals + 1) * HEADER_BLOCK_SIZE;
        match parse_int_field(&field_str(&main_header[184..192])) {
            Some(bytes) if bytes == expected_header_bytes as i64 => {}
            Some(_) => return Err(EdfError::InvalidHeader),
            None => invalid.insert(HeaderFields::HEADER_BYTES),
        }

        let patient = field_str(&main_header[8..88]);
        let recording = field_str(&main_header[88..168]);

        // 解析日期和时间
        let date = parse_date(&field_str(&main_header[168..176])).unwrap_or_else(|| {
            invalid.insert(HeaderFields::START_DATE);
            default_start().date()
        });
        let time = parse_time(&field_str(&main_header[176..184])).unwrap_or_else(|| {
            invalid.insert(HeaderFields::START_TIME);
            NaiveTime::MIN
        });

        // 检查EDF+标识
        let reserved = field_str(&main_header[192..236]);
        let (edf_plus, continuous) = if reserved.starts_with("EDF+C") {
            (true, true)
        } else if reserved.starts_with("EDF+D") {
            (true, false)
        } else {
            if reserved.starts_with("EDF+") {
                invalid.insert(HeaderFields::RESERVED);
            }
            (false, true)
        };

        // 解析数据记录信息
        let nr_data_records = match parse_int_field(&field_str(&main_header[236..244])) {
            Some(n) if n >= -1 => n,
            _ => {
                invalid.insert(HeaderFields::NR_RECORDS);
                -1
            }
        };
        let record_duration = match parse_float_field(&field_str(&main_header[244..252])) {
            Some(d) if d >= 0.0 => d,
            _ => {
                invalid.insert(HeaderFields::RECORD_DURATION);
                1.0
            }
        };

        // 读取信号头部信息
        let mut signal_header = vec![0u8; nr_signals * HEADER_BLOCK_SIZE];
        reader.read_exact(&mut signal_header)?;
        let (signals, signals_valid) = parse_signals(&signal_header, nr_signals);
        if !signals_valid {
            invalid.insert(HeaderFields::SIGNAL_TABLE);
        }

        if !invalid.is_empty() {
            log::warn!("Header fields could not be parsed: {}", invalid);
        }

        Ok(FileHeader {
            patient,
            recording,
            start: NaiveDateTime::new(date, time),
            reserved,
            nr_data_records,
            record_duration,
            signals,
            edf_plus,
            continuous,
            invalid_fields: invalid,
            modified: false,
            layout_generation: 0,
        })
    }

    /// Serializes header and signal table into `header_bytes()` bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.header_bytes());

        // 写入主头部 (256字节)
        bytes.extend_from_slice(&pad_field("0", 8));
        bytes.extend_from_slice(&pad_field(&self.patient, 80));
        bytes.extend_from_slice(&pad_field(&self.recording, 80));

        // 开始日期 "dd.mm.yy" 和时间 "hh.mm.ss"
        let date_str = format!("{:02}.{:02}.{:02}",
            self.start.day(), self.start.month(), self.start.year() % 100);
        bytes.extend_from_slice(&pad_field(&date_str, 8));
        let time_str = format!("{:02}.{:02}.{:02}",
            self.start.hour(), self.start.minute(), self.start.second());
        bytes.extend_from_slice(&pad_field(&time_str, 8));

        bytes.extend_from_slice(&pad_field(&self.header_bytes().to_string(), 8));

        let reserved = match (self.edf_plus, self.continuous) {
            (true, true) => "EDF+C",
            (true, false) => "EDF+D",
            (false, _) => self.reserved.as_str(),
        };
        bytes.extend_from_slice(&pad_field(reserved, 44));

        bytes.extend_from_slice(&pad_field(&self.nr_data_records.to_string(), 8));
        bytes.extend_from_slice(format_number_field(self.record_duration, 8)?.as_bytes());
        bytes.extend_from_slice(&pad_field(&self.signals.len().to_string(), 4));

        // 按照字段顺序写入，每个字段所有信号一起写
        for signal in &self.signals {
            bytes.extend_from_slice(&pad_field(&signal.label, 16));
        }
        for signal in &self.signals {
            bytes.extend_from_slice(&pad_field(&signal.transducer, 80));
        }
        for signal in &self.signals {
            bytes.extend_from_slice(&pad_field(&signal.physical_dimension, 8));
        }
        for signal in &self.signals {
            bytes.extend_from_slice(format_number_field(signal.physical_min, 8)?.as_bytes());
        }
        for signal in &self.signals {
            bytes.extend_from_slice(format_number_field(signal.physical_max, 8)?.as_bytes());
        }
        for signal in &self.signals {
            bytes.extend_from_slice(&pad_field(&signal.digital_min.to_string(), 8));
        }
        for signal in &self.signals {
            bytes.extend_from_slice(&pad_field(&signal.digital_max.to_string(), 8));
        }
        for signal in &self.signals {
            bytes.extend_from_slice(&pad_field(&signal.prefilter, 80));
        }
        for signal in &self.signals {
            bytes.extend_from_slice(&pad_field(&signal.samples_per_record.to_string(), 8));
        }
        for signal in &self.signals {
            bytes.extend_from_slice(&pad_field(&signal.reserved, 32));
        }

        debug_assert_eq!(bytes.len(), self.header_bytes());
        Ok(bytes)
    }

    pub fn header_bytes(&self) -> usize {
        (self.signals.len() + 1) * HEADER_BLOCK_SIZE
    }

    pub fn patient(&self) -> &str {
        &self.patient
    }

    pub fn recording(&self) -> &str {
        &self.recording
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    /// `-1` while the number of records has not been patched in.
    pub fn nr_data_records(&self) -> i64 {
        self.nr_data_records
    }

    /// Seconds per data record, 0 for pure event files.
    pub fn record_duration(&self) -> f64 {
        self.record_duration
    }

    pub fn nr_signals(&self) -> usize {
        self.signals.len()
    }

    pub fn signals(&self) -> &[SignalDescriptor] {
        &self.signals
    }

    pub fn signal(&self, index: usize) -> Result<&SignalDescriptor> {
        self.signals.get(index).ok_or(EdfError::InvalidSignalIndex(index))
    }

    /// Indices of all `EDF Annotations` signals.
    pub fn annotation_signals(&self) -> Vec<usize> {
        self.signals
            .iter()
            .enumerate()
            .filter(|(_, signal)| signal.is_annotation())
            .map(|(index, _)| index)
            .collect()
    }

    pub fn is_edf_plus(&self) -> bool {
        self.edf_plus
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    pub fn invalid_fields(&self) -> HeaderFields {
        self.invalid_fields
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn clear_modified(&mut self) {
        self.modified = false;
    }

    pub fn layout_generation(&self) -> u64 {
        self.layout_generation
    }

    pub fn set_patient(&mut self, patient: &str) -> Result<()> {
        check_text_len(patient, 80, "patient")?;
        self.patient = patient.to_string();
        self.invalid_fields.remove(HeaderFields::PATIENT);
        self.modified = true;
        Ok(())
    }

    pub fn set_recording(&mut self, recording: &str) -> Result<()> {
        check_text_len(recording, 80, "recording")?;
        self.recording = recording.to_string();
        self.invalid_fields.remove(HeaderFields::RECORDING);
        self.modified = true;
        Ok(())
    }

    /// Start date-time; the two-digit header year covers 1985 to 2084.
    pub fn set_start(&mut self, start: NaiveDateTime) -> Result<()> {
        if !(1985..=2084).contains(&start.year()) {
            return Err(EdfError::InvalidFormat(format!(
                "Start year {} outside 1985-2084", start.year()
            )));
        }
        self.start = start;
        self.invalid_fields.remove(HeaderFields::START_DATE | HeaderFields::START_TIME);
        self.modified = true;
        Ok(())
    }

    pub fn set_record_duration(&mut self, seconds: f64) -> Result<()> {
        if !(seconds >= 0.0) {
            return Err(EdfError::InvalidFormat(format!(
                "Data record duration must not be negative, got {}", seconds
            )));
        }
        format_number_field(seconds, 8)?;
        self.record_duration = seconds;
        self.invalid_fields.remove(HeaderFields::RECORD_DURATION);
        self.modified = true;
        Ok(())
    }

    pub fn set_continuous(&mut self, continuous: bool) {
        self.continuous = continuous;
        self.modified = true;
    }

    pub(crate) fn set_nr_data_records(&mut self, records: i64) {
        if self.nr_data_records != records {
            self.nr_data_records = records;
            self.invalid_fields.remove(HeaderFields::NR_RECORDS);
            self.modified = true;
        }
    }

    pub fn set_signal_label(&mut self, index: usize, label: &str) -> Result<()> {
        check_text_len(label, 16, "label")?;
        let was_annotation = self.signal(index)?.is_annotation();
        self.signals[index].label = label.to_string();
        if was_annotation != self.signals[index].is_annotation() {
            self.layout_generation += 1;
        }
        self.modified = true;
        Ok(())
    }

    pub fn set_transducer(&mut self, index: usize, transducer: &str) -> Result<()> {
        check_text_len(transducer, 80, "transducer")?;
        self.signal(index)?;
        self.signals[index].transducer = transducer.to_string();
        self.modified = true;
        Ok(())
    }

    pub fn set_physical_dimension(&mut self, index: usize, dimension: &str) -> Result<()> {
        check_text_len(dimension, 8, "physical dimension")?;
        self.signal(index)?;
        self.signals[index].physical_dimension = dimension.to_string();
        self.modified = true;
        Ok(())
    }

    pub fn set_prefilter(&mut self, index: usize, prefilter: &str) -> Result<()> {
        check_text_len(prefilter, 80, "prefilter")?;
        self.signal(index)?;
        self.signals[index].prefilter = prefilter.to_string();
        self.modified = true;
        Ok(())
    }

    pub fn set_calibration(
        &mut self,
        index: usize,
        physical_min: f64,
        physical_max: f64,
        digital_min: i32,
        digital_max: i32,
    ) -> Result<()> {
        self.signal(index)?;
        if physical_min == physical_max {
            return Err(EdfError::PhysicalMinEqualsMax);
        }
        if digital_min == digital_max {
            return Err(EdfError::DigitalMinEqualsMax);
        }
        let digital_range = i16::MIN as i32..=i16::MAX as i32;
        if !digital_range.contains(&digital_min) || !digital_range.contains(&digital_max) {
            return Err(EdfError::InvalidFormat(format!(
                "Digital range {}..{} exceeds 16 bits", digital_min, digital_max
            )));
        }
        format_number_field(physical_min, 8)?;
        format_number_field(physical_max, 8)?;

        let signal = &mut self.signals[index];
        signal.physical_min = physical_min;
        signal.physical_max = physical_max;
        signal.digital_min = digital_min;
        signal.digital_max = digital_max;
        self.modified = true;
        Ok(())
    }

    pub fn set_samples_per_record(&mut self, index: usize, samples: usize) -> Result<()> {
        self.signal(index)?;
        if samples == 0 || samples > 99_999_999 {
            return Err(EdfError::InvalidFormat(format!(
                "Samples per record must be 1-99999999, got {}", samples
            )));
        }
        if self.signals[index].samples_per_record != samples {
            self.signals[index].samples_per_record = samples;
            self.layout_generation += 1;
            self.modified = true;
        }
        Ok(())
    }

    /// Adds an ordinary signal in front of the trailing annotation signals.
    pub fn add_signal(&mut self, signal: SignalDescriptor) -> Result<usize> {
        if self.signals.len() >= EDFLIB_MAXSIGNALS {
            return Err(EdfError::InvalidSignalCount(self.signals.len() as i64 + 1));
        }
        if !signal.is_annotation() {
            if signal.physical_min == signal.physical_max {
                return Err(EdfError::PhysicalMinEqualsMax);
            }
            if signal.digital_min == signal.digital_max {
                return Err(EdfError::DigitalMinEqualsMax);
            }
        }
        if signal.samples_per_record == 0 {
            return Err(EdfError::InvalidFormat("Samples per record must be positive".to_string()));
        }

        let position = self
            .signals
            .iter()
            .rposition(|s| !s.is_annotation())
            .map_or(0, |last| last + 1);
        self.signals.insert(position, signal);
        self.layout_generation += 1;
        self.modified = true;
        Ok(position)
    }

    pub fn remove_signal(&mut self, index: usize) -> Result<SignalDescriptor> {
        self.signal(index)?;
        if self.signals.len() == 1 {
            return Err(EdfError::InvalidSignalCount(0));
        }
        self.layout_generation += 1;
        self.modified = true;
        Ok(self.signals.remove(index))
    }
}

/// Byte placement of every signal inside one data record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordLayout {
    offsets: Vec<usize>,
    sizes: Vec<usize>,
    annotation_signals: Vec<usize>,
    record_bytes: usize,
}

impl RecordLayout {
    pub fn new(signals: &[SignalDescriptor]) -> Self {
        let mut layout = RecordLayout::default();
        for (index, signal) in signals.iter().enumerate() {
            // 更新缓冲区偏移（每个样本2字节）
            layout.offsets.push(layout.record_bytes);
            layout.sizes.push(signal.record_bytes());
            if signal.is_annotation() {
                layout.annotation_signals.push(index);
            }
            layout.record_bytes += signal.record_bytes();
        }
        layout
    }

    pub fn record_bytes(&self) -> usize {
        self.record_bytes
    }

    pub fn nr_signals(&self) -> usize {
        self.offsets.len()
    }

    /// Byte range of `signal` within a record.
    pub fn signal_range(&self, signal: usize) -> Option<Range<usize>> {
        let offset = *self.offsets.get(signal)?;
        Some(offset..offset + self.sizes[signal])
    }

    pub fn annotation_signals(&self) -> &[usize] {
        &self.annotation_signals
    }

    /// Byte ranges of the annotation channels, in channel order.
    pub fn annotation_ranges(&self) -> Vec<Range<usize>> {
        self.annotation_signals
            .iter()
            .filter_map(|&signal| self.signal_range(signal))
            .collect()
    }
}

fn parse_signals(signal_header: &[u8], nr_signals: usize) -> (Vec<SignalDescriptor>, bool) {
    let field = |column_offset: usize, width: usize, index: usize| {
        let start = nr_signals * column_offset + index * width;
        field_str(&signal_header[start..start + width])
    };

    let mut valid = true;
    let mut signals = Vec::with_capacity(nr_signals);
    for i in 0..nr_signals {
        let label = field(0, 16, i);
        let mut number = |text: String| {
            parse_float_field(&text).unwrap_or_else(|| {
                valid = false;
                0.0
            })
        };
        let physical_min = number(field(104, 8, i));
        let physical_max = number(field(112, 8, i));

        let mut integer = |text: String, default: i64| {
            parse_int_field(&text).unwrap_or_else(|| {
                valid = false;
                default
            })
        };
        let digital_min = integer(field(120, 8, i), -32768);
        let digital_max = integer(field(128, 8, i), 32767);
        let samples = integer(field(216, 8, i), 0);

        let signal = SignalDescriptor {
            label,
            transducer: field(16, 80, i),
            physical_dimension: field(96, 8, i),
            physical_min,
            physical_max,
            digital_min: digital_min.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            digital_max: digital_max.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            prefilter: field(136, 80, i),
            samples_per_record: samples.max(0) as usize,
            reserved: field(224, 32, i),
        };

        if samples < 0 {
            valid = false;
        }
        if !signal.is_annotation()
            && (signal.physical_min == signal.physical_max || signal.digital_min == signal.digital_max)
        {
            log::warn!("Signal {} ({}) has an empty calibration range", i, signal.label);
            valid = false;
        }
        signals.push(signal);
    }

    (signals, valid)
}

/// 解析日期 "dd.mm.yy"
fn parse_date(text: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = text.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let day = parse_int_field(parts[0])?;
    let month = parse_int_field(parts[1])?;
    let year = {
        let yy = parse_int_field(parts[2])?;
        if yy > 84 { 1900 + yy } else { 2000 + yy }
    };
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
}

/// 解析时间 "hh.mm.ss"
fn parse_time(text: &str) -> Option<NaiveTime> {
    let parts: Vec<&str> = text.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let hour = parse_int_field(parts[0])?;
    let minute = parse_int_field(parts[1])?;
    let second = parse_int_field(parts[2])?;
    NaiveTime::from_hms_opt(hour as u32, minute as u32, second as u32)
}

fn check_text_len(text: &str, max: usize, what: &str) -> Result<()> {
    if text.len() > max {
        return Err(EdfError::InvalidFormat(format!(
            "{} longer than {} characters: {:?}", what, max, text
        )));
    }
    Ok(())
}

fn default_start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1985, 1, 1)
        .unwrap_or_default()
        .and_time(NaiveTime::MIN)
}

fn recording_for(date: NaiveDate) -> String {
    format!("Startdate {} X X X", date.format("%d-%b-%Y").to_string().to_uppercase())
}
