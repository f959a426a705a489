use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::annotations::{AnnotationList, BlockLoader};
use crate::block_size::{BlockSize, BlockSizeCalculator};
use crate::error::{EdfError, Result};
use crate::error_collector::ErrorCollector;
use crate::header::{FileHeader, RecordLayout};
use crate::preread::{PrereadEvent, PrereadMode, PrereadScheduler};
use crate::types::{Annotation, AnnotationBlock, HeaderErrors};
use crate::{DEFAULT_ANNOTATION_SAMPLES, RECOMMENDED_MAX_RECORD_BYTES};

/// Lifecycle of a [`DataFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Closed,
    /// Header parsed, validation and eager loading in progress.
    Opening,
    Open { read_only: bool },
    /// New file being set up.
    Allocating,
}

/// Options for opening an existing EDF+ file.
///
/// ```rust
/// use edfplus_engine::{OpenOptions, PrereadMode};
///
/// # edfplus_engine::doctest_utils::create_annotated_test_file("options.edf")?;
/// let file = OpenOptions::new()
///     .preread(PrereadMode::OnOpen)
///     .strict_checking(false)
///     .open("options.edf")?;
/// assert!(file.valid_format());
/// # drop(file);
/// # std::fs::remove_file("options.edf").ok();
/// # Ok::<(), edfplus_engine::EdfError>(())
/// ```
#[derive(Debug, Clone)]
pub struct OpenOptions {
    read_only: bool,
    preread: PrereadMode,
    strict_checking: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            read_only: true,
            preread: PrereadMode::None,
            strict_checking: true,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only(&mut self, read_only: bool) -> &mut Self {
        self.read_only = read_only;
        self
    }

    pub fn preread(&mut self, mode: PrereadMode) -> &mut Self {
        self.preread = mode;
        self
    }

    pub fn strict_checking(&mut self, strict: bool) -> &mut Self {
        self.strict_checking = strict;
        self
    }

    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<DataFile> {
        DataFile::open_with(path, self)
    }
}

/// Raw record storage: the file handle and the record layout it is read with.
#[derive(Debug)]
struct Storage {
    file: Option<File>,
    read_only: bool,
    header_bytes: u64,
    layout: RecordLayout,
    nr_records: usize,
    record_duration: f64,
}

impl Storage {
    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(EdfError::Closed)
    }

    fn record_position(&self, index: usize) -> u64 {
        self.header_bytes + (index as u64) * (self.layout.record_bytes() as u64)
    }

    fn read_record(&mut self, index: usize) -> Result<Vec<u8>> {
        if index >= self.nr_records {
            return Err(EdfError::InvalidRecordIndex(index));
        }
        let position = self.record_position(index);
        let mut record = vec![0u8; self.layout.record_bytes()];
        let file = self.file()?;
        file.seek(SeekFrom::Start(position))?;
        file.read_exact(&mut record)?;
        Ok(record)
    }

    /// Writes record `index`; `index == nr_records` appends.
    fn write_record(&mut self, index: usize, record: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(EdfError::ReadOnly);
        }
        if index > self.nr_records {
            return Err(EdfError::InvalidRecordIndex(index));
        }
        if record.len() != self.layout.record_bytes() {
            return Err(EdfError::InvalidArgument(format!(
                "record has {} bytes, layout needs {}",
                record.len(),
                self.layout.record_bytes()
            )));
        }
        let position = self.record_position(index);
        let file = self.file()?;
        file.seek(SeekFrom::Start(position))?;
        file.write_all(record)?;
        if index == self.nr_records {
            self.nr_records += 1;
        }
        Ok(())
    }
}

impl BlockLoader for Storage {
    fn load_block(&mut self, index: usize, block: &mut AnnotationBlock) -> Result<()> {
        let record = self.read_record(index)?;
        let ranges = self.layout.annotation_ranges();
        if ranges.is_empty() {
            // 普通EDF文件：按记录时长推算
            block.onset = index as f64 * self.record_duration;
            return Ok(());
        }
        for (channel, range) in ranges.iter().enumerate() {
            block.read_from_buffer(&record, range.start, range.len(), channel)?;
        }
        Ok(())
    }
}

/// State shared between the foreground caller and the preread worker.
#[derive(Debug)]
struct Shared {
    storage: Storage,
    annotations: AnnotationList,
}

fn lock(shared: &Mutex<Shared>) -> Result<MutexGuard<'_, Shared>> {
    shared.lock().map_err(|_| EdfError::Poisoned)
}

/// How far past the last known block an annotation block may be created.
const MAX_BLOCKS_AHEAD: usize = 65_536;

fn check_new_block(shared: &Shared, index: usize) -> Result<()> {
    let last = shared.storage.nr_records.max(shared.annotations.len());
    if index > last.saturating_add(MAX_BLOCKS_AHEAD) {
        return Err(EdfError::InvalidArgument(format!(
            "annotation block {} is too far past the last record ({})",
            index, last
        )));
    }
    Ok(())
}

fn check_time(what: &str, seconds: f64) -> Result<()> {
    if !seconds.is_finite() {
        return Err(EdfError::InvalidArgument(format!("{} {} is not a finite time", what, seconds)));
    }
    Ok(())
}

/// An EDF+ file on disk: header, raw data records and the annotation cache.
///
/// Record I/O and annotation loading go through one lock that the optional
/// background preread shares, so blocks are never observed half-loaded.
///
/// ```rust
/// use edfplus_engine::{DataFile, PrereadMode};
///
/// # edfplus_engine::doctest_utils::create_annotated_test_file("datafile.edf")?;
/// let mut file = DataFile::open("datafile.edf", true, PrereadMode::None)?;
/// println!("{} records of {} s", file.nr_records(), file.header().record_duration());
///
/// let eeg = file.read_physical_samples(0, 0, 256)?;
/// assert_eq!(eeg.len(), 256);
///
/// for annotation in file.annotations()? {
///     println!("{:.3} s: {}", annotation.onset, annotation.texts.join(", "));
/// }
/// # drop(file);
/// # std::fs::remove_file("datafile.edf").ok();
/// # Ok::<(), edfplus_engine::EdfError>(())
/// ```
pub struct DataFile {
    path: PathBuf,
    state: FileState,
    header: FileHeader,
    layout_generation: u64,
    shared: Arc<Mutex<Shared>>,
    preread: PrereadScheduler,
    header_errors: HeaderErrors,
    strict_checking: bool,
}

impl DataFile {
    /// Opens an existing file with default strict checking.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool, preread: PrereadMode) -> Result<Self> {
        OpenOptions::new().read_only(read_only).preread(preread).open(path)
    }

    /// Opens an existing file.
    ///
    /// Format problems do not fail the open; they are reported through
    /// [`DataFile::header_errors`] and [`DataFile::valid_format`].
    pub fn open_with<P: AsRef<Path>>(path: P, options: &OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EdfError::FileNotFound(path.display().to_string()));
        }

        let mut file = File::options().read(true).write(!options.read_only).open(path)?;
        let file_len = file.metadata()?.len();
        let mut header = FileHeader::parse(&mut file)?;
        let layout = RecordLayout::new(header.signals());
        let header_bytes = header.header_bytes() as u64;

        let mut errors = HeaderErrors::empty();
        if !header.invalid_fields().is_empty() {
            errors.insert(HeaderErrors::INVALID_FIELDS);
        }
        if layout.annotation_signals().is_empty() {
            errors.insert(HeaderErrors::MISSING_ANNOTATION_SIGNAL);
        }
        if header.record_duration() == 0.0 && !zero_duration_layout_valid(&header) {
            errors.insert(HeaderErrors::ZERO_DURATION_LAYOUT);
        }
        if layout.record_bytes() > RECOMMENDED_MAX_RECORD_BYTES {
            errors.insert(HeaderErrors::RECORD_SIZE_EXCEEDED);
        }

        let record_bytes = layout.record_bytes() as u64;
        let available = if record_bytes == 0 {
            0
        } else {
            file_len.saturating_sub(header_bytes) / record_bytes
        };
        let nr_records: u64 = if header.nr_data_records() < 0 {
            log::debug!("Number of data records unknown, {} found in file", available);
            if !options.read_only {
                header.set_nr_data_records(available as i64);
            }
            available
        } else {
            let declared = header.nr_data_records() as u64;
            if header_bytes + declared * record_bytes != file_len {
                errors.insert(HeaderErrors::FILE_SIZE_MISMATCH);
            }
            declared.min(available)
        };
        let nr_records = nr_records as usize;

        log::debug!(
            "Record layout: {} signals, {} bytes per record, {} records",
            layout.nr_signals(),
            layout.record_bytes(),
            nr_records
        );

        let storage = Storage {
            file: Some(file),
            read_only: options.read_only,
            header_bytes,
            layout,
            nr_records,
            record_duration: header.record_duration(),
        };
        let annotations = AnnotationList::new(nr_records, header.record_duration());
        let mut data_file = DataFile {
            path: path.to_path_buf(),
            state: FileState::Opening,
            layout_generation: header.layout_generation(),
            header,
            shared: Arc::new(Mutex::new(Shared { storage, annotations })),
            preread: PrereadScheduler::new(),
            header_errors: errors,
            strict_checking: options.strict_checking,
        };

        data_file.load_boundary_blocks()?;
        data_file.state = FileState::Open { read_only: options.read_only };

        let errors = data_file.header_errors();
        if errors.is_empty() {
            log::info!("Opened {} ({} records)", data_file.path.display(), nr_records);
        } else {
            log::warn!("Opened {} with format problems: {}", data_file.path.display(), errors);
        }

        data_file.set_preread_mode(options.preread)?;
        Ok(data_file)
    }

    /// Creates a new EDF+ file with `nr_ordinary_signals` signals plus one annotation signal.
    pub fn create<P: AsRef<Path>>(path: P, nr_ordinary_signals: usize) -> Result<Self> {
        let path = path.as_ref();
        let recognized = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| ext.eq_ignore_ascii_case("edf"));
        if !recognized {
            return Err(EdfError::UnsupportedFileType(format!(
                "{} does not have an .edf extension",
                path.display()
            )));
        }

        let header = FileHeader::new_edf_plus(nr_ordinary_signals, DEFAULT_ANNOTATION_SAMPLES);
        let file = File::options().read(true).write(true).create(true).truncate(true).open(path)?;
        let storage = Storage {
            file: Some(file),
            read_only: false,
            header_bytes: header.header_bytes() as u64,
            layout: RecordLayout::new(header.signals()),
            nr_records: 0,
            record_duration: header.record_duration(),
        };
        let annotations = AnnotationList::new(0, header.record_duration());
        let mut data_file = DataFile {
            path: path.to_path_buf(),
            state: FileState::Allocating,
            layout_generation: header.layout_generation(),
            header,
            shared: Arc::new(Mutex::new(Shared { storage, annotations })),
            preread: PrereadScheduler::new(),
            header_errors: HeaderErrors::empty(),
            strict_checking: true,
        };
        data_file.write_header()?;
        data_file.state = FileState::Open { read_only: false };

        log::info!(
            "Created {} with {} signals",
            data_file.path.display(),
            nr_ordinary_signals + 1
        );
        Ok(data_file)
    }

    fn load_boundary_blocks(&mut self) -> Result<()> {
        let mut guard = lock(&self.shared)?;
        let shared = &mut *guard;
        let nr_records = shared.storage.nr_records;
        if nr_records == 0 {
            return Ok(());
        }

        let first_onset = shared.annotations.block(0, &mut shared.storage)?.onset;
        shared.annotations.block(nr_records - 1, &mut shared.storage)?;
        self.header_errors.insert(shared.annotations.take_last_error());

        if !shared.storage.layout.annotation_signals().is_empty()
            && !first_onset.is_nan()
            && !(0.0..1.0).contains(&first_onset)
        {
            log::warn!("First data record starts at {} s", first_onset);
            self.header_errors.insert(HeaderErrors::FIRST_RECORD_OFFSET);
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn is_read_only(&self) -> bool {
        !matches!(self.state, FileState::Open { read_only: false })
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Header for editing; the record layout follows any signal change before the next record access.
    pub fn header_mut(&mut self) -> Result<&mut FileHeader> {
        self.ensure_writable()?;
        Ok(&mut self.header)
    }

    /// Number of data records that can be read.
    pub fn nr_records(&self) -> usize {
        lock(&self.shared).map_or(0, |shared| shared.storage.nr_records)
    }

    /// Format problems found while opening plus those found by loading annotation blocks since.
    pub fn header_errors(&self) -> HeaderErrors {
        let seen = lock(&self.shared).map_or(HeaderErrors::empty(), |shared| shared.annotations.errors_seen());
        self.header_errors | seen
    }

    pub fn valid_format(&self) -> bool {
        self.header_errors().valid_format(self.strict_checking)
    }

    pub fn strict_checking(&self) -> bool {
        self.strict_checking
    }

    pub fn set_strict_checking(&mut self, strict: bool) {
        self.strict_checking = strict;
    }

    /// Reads the raw bytes of record `index`; annotation channels with unsaved
    /// edits are returned as they will be written.
    pub fn read_data_block(&mut self, index: usize) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.sync_layout()?;
        let mut guard = lock(&self.shared)?;
        let shared = &mut *guard;
        let mut record = shared.storage.read_record(index)?;

        if shared.annotations.loaded(index).map_or(false, |block| block.modified) {
            for (channel, range) in shared.storage.layout.annotation_ranges().iter().enumerate() {
                shared
                    .annotations
                    .write_to_buffer(index, &mut record, range.start, range.len(), channel)?;
            }
        }
        Ok(record)
    }

    /// Writes the raw bytes of record `index`; `index == nr_records()` appends.
    ///
    /// Annotation channel bytes that are all zero are filled from the annotation
    /// cache; otherwise all channels are decoded first and replace the cached
    /// block once the record is on disk, so cache and disk agree.
    pub fn write_data_block(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.sync_layout()?;
        let mut guard = lock(&self.shared)?;
        let shared = &mut *guard;
        let storage = &mut shared.storage;
        let annotations = &mut shared.annotations;

        if index > storage.nr_records {
            return Err(EdfError::InvalidRecordIndex(index));
        }
        if bytes.len() != storage.layout.record_bytes() {
            return Err(EdfError::InvalidArgument(format!(
                "record has {} bytes, layout needs {}",
                bytes.len(),
                storage.layout.record_bytes()
            )));
        }

        let mut record = bytes.to_vec();
        let ranges = storage.layout.annotation_ranges();
        let mut decoded = None;
        if !ranges.is_empty() {
            let from_cache = ranges
                .iter()
                .all(|range| record[range.clone()].iter().all(|&b| b == 0));
            if from_cache {
                if annotations.loaded(index).is_none() {
                    if index < storage.nr_records {
                        annotations.block(index, storage)?;
                    } else {
                        annotations.add_block(index, index as f64 * storage.record_duration)?;
                    }
                }
                let capacities: Vec<usize> = ranges.iter().map(|range| range.len()).collect();
                annotations.balance_channels(index, &capacities)?;
                for (channel, range) in ranges.iter().enumerate() {
                    annotations.write_to_buffer(index, &mut record, range.start, range.len(), channel)?;
                }
            } else {
                // 先完整解码，写盘成功后才替换缓存
                decoded = Some(AnnotationBlock::from_record(index, &record, &ranges)?);
            }
        }

        let appended = index == storage.nr_records;
        storage.write_record(index, &record)?;
        if let Some(block) = decoded {
            annotations.install_block(block);
        }
        if let Some(block) = annotations.loaded_mut(index) {
            block.modified = false;
        }
        self.header_errors.insert(annotations.take_last_error());
        if appended {
            self.header.set_nr_data_records(storage.nr_records as i64);
        }
        Ok(())
    }

    /// Digital samples `first..first + count` of `signal`, clamped to the
    /// signal's digital range and cut short at the end of the file.
    pub fn read_digital_samples(&mut self, signal: usize, first: usize, count: usize) -> Result<Vec<i32>> {
        self.ensure_open()?;
        self.sync_layout()?;
        let descriptor = self.header.signal(signal)?.clone();
        if descriptor.is_annotation() {
            return Err(EdfError::InvalidArgument(format!(
                "signal {} is an annotation signal",
                signal
            )));
        }

        let mut guard = lock(&self.shared)?;
        let storage = &mut guard.storage;
        let per_record = descriptor.samples_per_record;
        if per_record == 0 {
            return Ok(Vec::new());
        }
        let total = storage.nr_records * per_record;
        let end = first.saturating_add(count).min(total);
        let range = storage
            .layout
            .signal_range(signal)
            .ok_or(EdfError::InvalidSignalIndex(signal))?;

        let mut samples = Vec::with_capacity(end.saturating_sub(first));
        let mut position = first;
        while position < end {
            let record_index = position / per_record;
            let record = storage.read_record(record_index)?;
            let bytes = &record[range.clone()];
            let record_end = ((record_index + 1) * per_record).min(end);
            for sample in position..record_end {
                let offset = (sample - record_index * per_record) * 2;
                let value = i16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as i32;
                samples.push(value.clamp(descriptor.digital_min, descriptor.digital_max));
            }
            position = record_end;
        }
        Ok(samples)
    }

    /// Like [`DataFile::read_digital_samples`], converted with the signal's calibration.
    pub fn read_physical_samples(&mut self, signal: usize, first: usize, count: usize) -> Result<Vec<f64>> {
        let digital = self.read_digital_samples(signal, first, count)?;
        let descriptor = self.header.signal(signal)?;
        Ok(digital.into_iter().map(|value| descriptor.to_physical(value)).collect())
    }

    /// Appends one data record built from physical samples of every ordinary
    /// signal, in signal order. Returns the index of the new record.
    pub fn write_physical_record(&mut self, samples: &[Vec<f64>]) -> Result<usize> {
        self.ensure_writable()?;
        self.sync_layout()?;
        let ordinary: Vec<usize> = (0..self.header.nr_signals())
            .filter(|&i| !self.header.signals()[i].is_annotation())
            .collect();
        if samples.len() != ordinary.len() {
            return Err(EdfError::InvalidArgument(format!(
                "expected samples for {} signals, got {}",
                ordinary.len(),
                samples.len()
            )));
        }

        let (record, index) = {
            let shared = lock(&self.shared)?;
            let mut record = vec![0u8; shared.storage.layout.record_bytes()];
            for (&signal, values) in ordinary.iter().zip(samples) {
                let descriptor = &self.header.signals()[signal];
                if values.len() != descriptor.samples_per_record {
                    return Err(EdfError::InvalidArgument(format!(
                        "signal {} needs {} samples per record, got {}",
                        signal,
                        descriptor.samples_per_record,
                        values.len()
                    )));
                }
                let range = shared
                    .storage
                    .layout
                    .signal_range(signal)
                    .ok_or(EdfError::InvalidSignalIndex(signal))?;
                for (chunk, &value) in record[range].chunks_exact_mut(2).zip(values) {
                    chunk.copy_from_slice(&(descriptor.to_digital(value) as i16).to_le_bytes());
                }
            }
            (record, shared.storage.nr_records)
        };

        self.write_data_block(index, &record)?;
        Ok(index)
    }

    /// Annotation block of record `index`, loading it if needed.
    pub fn annotation_block(&self, index: usize) -> Result<AnnotationBlock> {
        self.ensure_open()?;
        let mut guard = lock(&self.shared)?;
        let shared = &mut *guard;
        Ok(shared.annotations.block(index, &mut shared.storage)?.clone())
    }

    /// Whether block `index` is loaded, without loading it.
    pub fn block_in_memory(&self, index: usize) -> bool {
        lock(&self.shared).map_or(false, |shared| shared.annotations.block_in_memory(index))
    }

    /// Every annotation of the file, loading all blocks.
    pub fn annotations(&self) -> Result<Vec<Annotation>> {
        self.ensure_open()?;
        let mut guard = lock(&self.shared)?;
        let shared = &mut *guard;
        let mut all = Vec::new();
        for index in 0..shared.storage.nr_records {
            all.extend(shared.annotations.block(index, &mut shared.storage)?.annotations.iter().cloned());
        }
        Ok(all)
    }

    /// Adds `annotation` to the block whose window contains its onset, creating
    /// the block for records not yet written. Returns the block index.
    pub fn add_annotation(&mut self, annotation: Annotation) -> Result<usize> {
        self.ensure_writable()?;
        check_time("annotation onset", annotation.onset)?;
        if let Some(seconds) = annotation.duration {
            check_time("annotation duration", seconds)?;
        }
        let duration = self.header.record_duration();
        let mut guard = lock(&self.shared)?;
        let shared = &mut *guard;

        let index = if duration > 0.0 {
            (annotation.onset / duration).floor().max(0.0) as usize
        } else {
            shared.annotations.len().saturating_sub(1)
        };
        check_new_block(shared, index)?;
        let block = if index < shared.storage.nr_records {
            shared.annotations.block_mut(index, &mut shared.storage)?
        } else if shared.annotations.loaded(index).is_some() {
            shared
                .annotations
                .loaded_mut(index)
                .ok_or(EdfError::InvalidRecordIndex(index))?
        } else {
            shared.annotations.add_block(index, index as f64 * duration)?
        };
        if !block.is_decoded() {
            block.onset = index as f64 * duration;
        }
        block.annotations.push(annotation);
        block.modified = true;
        Ok(index)
    }

    /// Sets the onset of block `index`, keeping its annotations.
    pub fn set_block_onset(&mut self, index: usize, onset: f64) -> Result<()> {
        self.ensure_writable()?;
        check_time("block onset", onset)?;
        let mut guard = lock(&self.shared)?;
        let shared = &mut *guard;
        check_new_block(shared, index)?;
        let kept = if index < shared.storage.nr_records {
            std::mem::take(&mut shared.annotations.block_mut(index, &mut shared.storage)?.annotations)
        } else {
            shared
                .annotations
                .loaded_mut(index)
                .map(|block| std::mem::take(&mut block.annotations))
                .unwrap_or_default()
        };
        shared.annotations.add_block(index, onset)?.annotations = kept;
        self.header_errors.insert(shared.annotations.take_last_error());
        Ok(())
    }

    /// Moves loaded annotations to the blocks whose windows contain them.
    pub fn redistribute_annotations(&mut self) -> Result<()> {
        self.ensure_open()?;
        lock(&self.shared)?.annotations.redistribute_annotations();
        Ok(())
    }

    /// Locked access to the annotation cache.
    pub fn with_annotations<R>(&self, f: impl FnOnce(&mut AnnotationList) -> R) -> Result<R> {
        let mut shared = lock(&self.shared)?;
        Ok(f(&mut shared.annotations))
    }

    /// Writes every modified block of an existing record back to disk.
    /// Returns the number of records rewritten.
    pub fn flush_annotations(&mut self) -> Result<usize> {
        self.ensure_writable()?;
        self.sync_layout()?;
        let mut guard = lock(&self.shared)?;
        let shared = &mut *guard;
        let ranges = shared.storage.layout.annotation_ranges();
        if ranges.is_empty() {
            return Ok(0);
        }
        let capacities: Vec<usize> = ranges.iter().map(|range| range.len()).collect();

        let (existing, pending): (Vec<usize>, Vec<usize>) = shared
            .annotations
            .modified_blocks()
            .into_iter()
            .partition(|&index| index < shared.storage.nr_records);
        if !pending.is_empty() {
            log::warn!(
                "{} modified annotation blocks have no data record yet and were not written (first: {})",
                pending.len(),
                pending[0]
            );
        }

        let mut written = 0;
        for index in existing {
            let mut record = shared.storage.read_record(index)?;
            shared.annotations.balance_channels(index, &capacities)?;
            for (channel, range) in ranges.iter().enumerate() {
                shared
                    .annotations
                    .write_to_buffer(index, &mut record, range.start, range.len(), channel)?;
            }
            shared.storage.write_record(index, &record)?;
            if let Some(block) = shared.annotations.loaded_mut(index) {
                block.modified = false;
            }
            written += 1;
        }
        if written > 0 {
            log::debug!("Flushed {} annotation blocks", written);
        }
        Ok(written)
    }

    /// Grows the annotation signal of a file without records so the largest
    /// cached block fits. Returns the samples per record of the annotation signal.
    pub fn fit_annotation_channel(&mut self) -> Result<usize> {
        self.ensure_writable()?;
        let (records, needed) = {
            let shared = lock(&self.shared)?;
            (shared.storage.nr_records, shared.annotations.max_required_bytes())
        };
        let channels = self.header.annotation_signals();
        let signal = match channels.as_slice() {
            [signal] => *signal,
            _ => {
                return Err(EdfError::InvalidArgument(format!(
                    "expected one annotation signal, found {}",
                    channels.len()
                )))
            }
        };
        let current = self.header.signals()[signal].samples_per_record;
        let samples = needed.div_ceil(2).max(current);
        if samples != current {
            if records > 0 {
                return Err(EdfError::InvalidArgument(
                    "annotation signal cannot grow once records are written".to_string(),
                ));
            }
            self.header.set_samples_per_record(signal, samples)?;
            log::debug!("Annotation signal grown to {} samples per record", samples);
        }
        Ok(samples)
    }

    /// Picks the record duration and per-signal sample counts for the given
    /// sample rates of the ordinary signals. Only allowed before any record is written.
    pub fn configure_sample_rates(&mut self, rates: &[f64]) -> Result<BlockSize> {
        self.ensure_writable()?;
        if self.nr_records() > 0 {
            return Err(EdfError::InvalidArgument(
                "sample rates cannot change once records are written".to_string(),
            ));
        }
        let ordinary: Vec<usize> = (0..self.header.nr_signals())
            .filter(|&i| !self.header.signals()[i].is_annotation())
            .collect();
        if rates.len() != ordinary.len() {
            return Err(EdfError::InvalidArgument(format!(
                "expected {} sample rates, got {}",
                ordinary.len(),
                rates.len()
            )));
        }

        let annotation_bytes: usize = self
            .header
            .signals()
            .iter()
            .filter(|signal| signal.is_annotation())
            .map(|signal| signal.record_bytes())
            .sum();
        let budget = RECOMMENDED_MAX_RECORD_BYTES.saturating_sub(annotation_bytes);
        let block = BlockSizeCalculator::new(rates, budget)
            .calculate()
            .ok_or_else(|| EdfError::InvalidArgument(format!(
                "no record duration fits {:?} into {} bytes",
                rates, budget
            )))?;

        self.header.set_record_duration(block.duration)?;
        for (&signal, &samples) in ordinary.iter().zip(&block.samples) {
            self.header.set_samples_per_record(signal, samples)?;
        }
        log::debug!(
            "Record duration {} s for rates {:?} (max error {})",
            block.duration,
            rates,
            block.max_error
        );
        self.sync_layout()?;
        Ok(block)
    }

    /// Writes modified annotation blocks and the header. Does nothing on a
    /// read-only or closed file.
    pub fn commit(&mut self) -> Result<()> {
        if !matches!(self.state, FileState::Open { read_only: false }) {
            return Ok(());
        }
        self.flush_annotations()?;
        if self.header.is_modified() {
            self.write_header()?;
        }
        lock(&self.shared)?.storage.file()?.flush()?;
        Ok(())
    }

    /// Stops the preread, commits a writable file and releases the handle.
    /// Calling it again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.state == FileState::Closed {
            return Ok(());
        }
        self.preread.cancel();
        let result = self.commit();
        if let Ok(mut shared) = lock(&self.shared) {
            shared.storage.file = None;
        }
        self.state = FileState::Closed;
        log::info!("Closed {}", self.path.display());
        result
    }

    /// Restarts annotation preloading with `mode` for the blocks not yet in memory.
    pub fn set_preread_mode(&mut self, mode: PrereadMode) -> Result<()> {
        self.ensure_open()?;
        self.preread.cancel();
        let records: Vec<usize> = {
            let shared = lock(&self.shared)?;
            (0..shared.storage.nr_records)
                .filter(|&i| !shared.annotations.block_in_memory(i))
                .collect()
        };

        let shared = Arc::clone(&self.shared);
        self.preread.start(mode, records, move |record| {
            let mut guard = lock(&shared)?;
            let shared = &mut *guard;
            shared.annotations.block(record, &mut shared.storage)?;
            Ok(shared.annotations.take_last_error())
        });
        Ok(())
    }

    pub fn preread_mode(&self) -> PrereadMode {
        self.preread.mode()
    }

    /// Problems collected by the last preread.
    pub fn preread_errors(&self) -> Arc<Mutex<ErrorCollector>> {
        self.preread.errors()
    }

    /// Started/finished notifications of the last background preread.
    pub fn take_preread_events(&mut self) -> Option<Receiver<PrereadEvent>> {
        self.preread.take_events()
    }

    /// Blocks until a background preread has finished.
    pub fn wait_for_preread(&mut self) {
        self.preread.wait();
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            FileState::Open { .. } | FileState::Opening | FileState::Allocating => Ok(()),
            FileState::Closed => Err(EdfError::Closed),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.state {
            FileState::Open { read_only: false } | FileState::Allocating => Ok(()),
            FileState::Closed => Err(EdfError::Closed),
            _ => Err(EdfError::ReadOnly),
        }
    }

    /// Recomputes the record layout after header edits.
    fn sync_layout(&mut self) -> Result<()> {
        let mut shared = lock(&self.shared)?;
        shared.storage.record_duration = self.header.record_duration();
        shared.annotations.set_block_duration(self.header.record_duration());
        if self.header.layout_generation() != self.layout_generation {
            if shared.storage.nr_records > 0 {
                log::warn!(
                    "Record layout of {} changed after {} records were written",
                    self.path.display(),
                    shared.storage.nr_records
                );
            }
            shared.storage.layout = RecordLayout::new(self.header.signals());
            shared.storage.header_bytes = self.header.header_bytes() as u64;
            self.layout_generation = self.header.layout_generation();
            log::debug!("Record layout recomputed: {} bytes", shared.storage.layout.record_bytes());
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        self.sync_layout()?;
        let bytes = self.header.to_bytes()?;
        {
            let mut shared = lock(&self.shared)?;
            let file = shared.storage.file()?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&bytes)?;
        }
        self.header.clear_modified();
        Ok(())
    }
}

impl Drop for DataFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Closing {} failed: {}", self.path.display(), e);
        }
    }
}

/// A zero record duration is only meaningful when some signal has several
/// samples per record, or for a discontinuous file of single-sample signals.
fn zero_duration_layout_valid(header: &FileHeader) -> bool {
    let mut ordinary = header.signals().iter().filter(|signal| !signal.is_annotation());
    let any_multiple = ordinary.clone().any(|signal| signal.samples_per_record > 1);
    let all_single = ordinary.all(|signal| signal.samples_per_record == 1);
    any_multiple || (all_single && !header.is_continuous())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_requires_edf_extension() {
        let dir = tempdir().unwrap();
        let result = DataFile::create(dir.path().join("recording.txt"), 1);
        assert!(matches!(result, Err(EdfError::UnsupportedFileType(_))));
    }

    #[test]
    fn test_new_file_layout() {
        let dir = tempdir().unwrap();
        let file = DataFile::create(dir.path().join("new.edf"), 2).unwrap();
        assert_eq!(file.state(), FileState::Open { read_only: false });
        assert_eq!(file.header().nr_signals(), 3);

        let annotation = &file.header().signals()[2];
        assert!(annotation.is_annotation());
        assert_eq!(annotation.samples_per_record, DEFAULT_ANNOTATION_SAMPLES);
        assert_eq!((annotation.digital_min, annotation.digital_max), (-32768, 32767));
        assert_eq!((annotation.physical_min, annotation.physical_max), (0.0, 1.0));
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut file = DataFile::create(dir.path().join("close.edf"), 1).unwrap();
        file.close().unwrap();
        file.close().unwrap();
        assert_eq!(file.state(), FileState::Closed);
        assert!(matches!(file.read_data_block(0), Err(EdfError::Closed)));
    }

    #[test]
    fn test_open_missing_file() {
        let result = DataFile::open("/nonexistent/missing.edf", true, PrereadMode::None);
        assert!(matches!(result, Err(EdfError::FileNotFound(_))));
    }

    #[test]
    fn test_zero_duration_layout_rules() {
        let mut header = FileHeader::new_edf_plus(2, 10);
        header.set_record_duration(0.0).unwrap();
        assert!(!zero_duration_layout_valid(&header));

        header.set_continuous(false);
        assert!(zero_duration_layout_valid(&header));

        header.set_samples_per_record(0, 4).unwrap();
        header.set_continuous(true);
        assert!(zero_duration_layout_valid(&header));
    }
}
