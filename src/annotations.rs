use crate::error::{EdfError, Result};
use crate::types::{Annotation, AnnotationBlock, HeaderErrors};

/// Source of annotation blocks, usually the raw record storage of a data file.
pub trait BlockLoader {
    /// Decodes every annotation channel of record `index` into `block`.
    ///
    /// Malformed TAL bytes are reported as [`EdfError::TalDecode`]; any other
    /// error is treated as a storage failure.
    fn load_block(&mut self, index: usize, block: &mut AnnotationBlock) -> Result<()>;
}

#[derive(Debug, Clone)]
enum Slot {
    Unloaded,
    Loading,
    Loaded(AnnotationBlock),
}

/// Lazily populated annotation blocks, one per data record.
///
/// A block moves from unloaded straight to loaded inside [`AnnotationList::block`];
/// it is never observable half-decoded. Blocks are never removed, only
/// modified and written back by the owner.
#[derive(Debug, Clone)]
pub struct AnnotationList {
    slots: Vec<Slot>,
    block_duration: f64,
    last_error: HeaderErrors,
    errors_seen: HeaderErrors,
}

impl AnnotationList {
    pub fn new(nr_blocks: usize, block_duration: f64) -> Self {
        AnnotationList {
            slots: vec![Slot::Unloaded; nr_blocks],
            block_duration,
            last_error: HeaderErrors::empty(),
            errors_seen: HeaderErrors::empty(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn block_duration(&self) -> f64 {
        self.block_duration
    }

    pub fn set_block_duration(&mut self, seconds: f64) {
        self.block_duration = seconds;
    }

    /// Block `index`, loading it through `loader` on first access.
    ///
    /// A block whose TAL bytes cannot be decoded is kept as an empty block
    /// without onset and flagged with [`HeaderErrors::ANNOTATION_DECODE`];
    /// storage errors leave the slot unloaded and are returned.
    pub fn block(&mut self, index: usize, loader: &mut dyn BlockLoader) -> Result<&AnnotationBlock> {
        self.ensure_loaded(index, loader)?;
        self.loaded(index).ok_or(EdfError::ReentrantLoad(index))
    }

    /// Like [`AnnotationList::block`], for editing. Callers mark the block modified.
    pub fn block_mut(&mut self, index: usize, loader: &mut dyn BlockLoader) -> Result<&mut AnnotationBlock> {
        self.ensure_loaded(index, loader)?;
        match self.slots.get_mut(index) {
            Some(Slot::Loaded(block)) => Ok(block),
            _ => Err(EdfError::ReentrantLoad(index)),
        }
    }

    fn ensure_loaded(&mut self, index: usize, loader: &mut dyn BlockLoader) -> Result<()> {
        self.grow(index);
        match self.slots[index] {
            Slot::Loaded(_) => return Ok(()),
            Slot::Loading => return Err(EdfError::ReentrantLoad(index)),
            Slot::Unloaded => {}
        }

        self.slots[index] = Slot::Loading;
        let mut block = AnnotationBlock::placeholder(index);
        match loader.load_block(index, &mut block) {
            Ok(()) => {}
            Err(EdfError::TalDecode(reason)) => {
                log::warn!("Annotation block {} could not be decoded: {}", index, reason);
                block = AnnotationBlock::placeholder(index);
                self.flag(HeaderErrors::ANNOTATION_DECODE);
            }
            Err(e) => {
                self.slots[index] = Slot::Unloaded;
                return Err(e);
            }
        }

        log::trace!("Loaded annotation block {} (onset {})", index, block.onset);
        let decoded = block.is_decoded();
        self.slots[index] = Slot::Loaded(block);
        if decoded {
            self.check_order(index);
        }
        Ok(())
    }

    /// Block `index` if it is loaded; never triggers a load.
    pub fn loaded(&self, index: usize) -> Option<&AnnotationBlock> {
        match self.slots.get(index) {
            Some(Slot::Loaded(block)) => Some(block),
            _ => None,
        }
    }

    /// Whether block `index` is loaded and has an onset.
    pub fn block_in_memory(&self, index: usize) -> bool {
        self.loaded(index).map_or(false, AnnotationBlock::is_decoded)
    }

    /// Inserts or replaces block `index` with an empty block at `onset`, growing the list as needed.
    pub fn add_block(&mut self, index: usize, onset: f64) -> Result<&mut AnnotationBlock> {
        let mut block = AnnotationBlock::new(index, onset);
        block.modified = true;
        self.install_block(block);
        self.loaded_mut(index).ok_or(EdfError::InvalidRecordIndex(index))
    }

    /// Stores a fully decoded block in its slot, replacing what was there.
    pub fn install_block(&mut self, block: AnnotationBlock) {
        let index = block.record;
        self.grow(index);
        self.slots[index] = Slot::Loaded(block);
        self.check_order(index);
    }

    /// Moves every loaded annotation to the block whose `[onset, onset + duration)`
    /// window contains it.
    ///
    /// With a block duration of 0, or when no window matches, an annotation goes to
    /// the last block starting at or before it (or the first block). Blocks that
    /// gain or lose annotations are marked modified.
    pub fn redistribute_annotations(&mut self) {
        let mut anchors: Vec<(usize, f64)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Loaded(block) if block.is_decoded() => Some((index, block.onset)),
                _ => None,
            })
            .collect();
        if anchors.is_empty() {
            return;
        }
        anchors.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut pending: Vec<(usize, Annotation)> = Vec::new();
        for &(index, _) in &anchors {
            if let Slot::Loaded(block) = &mut self.slots[index] {
                pending.extend(block.annotations.drain(..).map(|a| (index, a)));
            }
        }

        let duration = self.block_duration;
        for (from, annotation) in pending {
            let window = anchors.iter().find(|&&(_, onset)| {
                duration > 0.0 && annotation.onset >= onset && annotation.onset < onset + duration
            });
            let target = window
                .or_else(|| anchors.iter().rev().find(|&&(_, onset)| onset <= annotation.onset))
                .unwrap_or(&anchors[0])
                .0;

            if target != from {
                if let Slot::Loaded(block) = &mut self.slots[from] {
                    block.modified = true;
                }
            }
            if let Slot::Loaded(block) = &mut self.slots[target] {
                if target != from {
                    block.modified = true;
                }
                block.annotations.push(annotation);
            }
        }

        for &(index, _) in &anchors {
            if let Slot::Loaded(block) = &mut self.slots[index] {
                block.annotations.sort_by(|a, b| a.onset.total_cmp(&b.onset));
            }
        }
    }

    /// Decodes one annotation channel region of `buffer` into block `block_nr`,
    /// creating the block if it does not exist yet.
    ///
    /// The slot only changes when decoding succeeds.
    pub fn read_from_buffer(
        &mut self,
        block_nr: usize,
        buffer: &[u8],
        byte_offset: usize,
        byte_count: usize,
        channel: usize,
    ) -> Result<()> {
        if matches!(self.slots.get(block_nr), Some(Slot::Loading)) {
            return Err(EdfError::ReentrantLoad(block_nr));
        }
        let mut block = self
            .loaded(block_nr)
            .cloned()
            .unwrap_or_else(|| AnnotationBlock::placeholder(block_nr));
        if let Err(e) = block.read_from_buffer(buffer, byte_offset, byte_count, channel) {
            if matches!(e, EdfError::TalDecode(_)) {
                self.flag(HeaderErrors::ANNOTATION_DECODE);
            }
            return Err(e);
        }
        self.install_block(block);
        Ok(())
    }

    /// Encodes channel `channel` of loaded block `block_nr` into `buffer`.
    pub fn write_to_buffer(
        &self,
        block_nr: usize,
        buffer: &mut [u8],
        byte_offset: usize,
        byte_count: usize,
        channel: usize,
    ) -> Result<()> {
        self.loaded(block_nr)
            .ok_or_else(|| EdfError::InvalidArgument(format!("annotation block {} is not loaded", block_nr)))?
            .write_to_buffer(buffer, byte_offset, byte_count, channel)
    }

    /// Indices of loaded blocks with unsaved changes.
    pub fn modified_blocks(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Loaded(block) if block.modified => Some(index),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn loaded_mut(&mut self, index: usize) -> Option<&mut AnnotationBlock> {
        match self.slots.get_mut(index) {
            Some(Slot::Loaded(block)) => Some(block),
            _ => None,
        }
    }

    /// Bytes loaded block `index` needs in a single channel, 0 when not loaded.
    pub fn required_bytes(&self, index: usize) -> usize {
        self.loaded(index).map_or(0, AnnotationBlock::required_bytes)
    }

    /// Spreads the annotations of block `index` over channels with the given byte capacities.
    pub fn balance_channels(&mut self, index: usize, capacities: &[usize]) -> Result<()> {
        self.loaded_mut(index)
            .ok_or_else(|| EdfError::InvalidArgument(format!("annotation block {} is not loaded", index)))?
            .balance_channels(capacities)
    }

    /// Largest number of bytes any loaded block needs in a single channel.
    pub fn max_required_bytes(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Loaded(block) => Some(block.required_bytes()),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// All annotations of loaded blocks, in block order.
    pub fn annotations(&self) -> impl Iterator<Item = &Annotation> {
        self.slots.iter().flat_map(|slot| match slot {
            Slot::Loaded(block) => block.annotations.iter(),
            _ => [].iter(),
        })
    }

    /// Problems flagged since the last [`AnnotationList::take_last_error`].
    pub fn last_error(&self) -> HeaderErrors {
        self.last_error
    }

    pub fn take_last_error(&mut self) -> HeaderErrors {
        std::mem::take(&mut self.last_error)
    }

    /// Every problem flagged during the lifetime of the list.
    pub fn errors_seen(&self) -> HeaderErrors {
        self.errors_seen
    }

    fn flag(&mut self, error: HeaderErrors) {
        self.last_error.insert(error);
        self.errors_seen.insert(error);
    }

    fn grow(&mut self, index: usize) {
        if index >= self.slots.len() {
            self.slots.resize(index + 1, Slot::Unloaded);
        }
    }

    /// Flags `BLOCK_ORDER` when block `index` breaks the non-decreasing onset
    /// order against its nearest loaded neighbours.
    fn check_order(&mut self, index: usize) {
        let onset = match self.loaded(index) {
            Some(block) if block.is_decoded() => block.onset,
            _ => return,
        };
        let decoded_onset = |slot: &Slot| match slot {
            Slot::Loaded(block) if block.is_decoded() => Some(block.onset),
            _ => None,
        };
        let previous = self.slots[..index].iter().rev().find_map(decoded_onset);
        let next = self.slots[index + 1..].iter().find_map(decoded_onset);

        if previous.map_or(false, |p| p > onset) || next.map_or(false, |n| n < onset) {
            log::warn!("Annotation block {} (onset {}) is out of chronological order", index, onset);
            self.flag(HeaderErrors::BLOCK_ORDER);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tal::encode_time_keeping;

    /// Serves records whose time-keeping onsets come from `onsets`;
    /// `None` produces undecodable bytes.
    struct FakeRecords {
        onsets: Vec<Option<f64>>,
        calls: Vec<usize>,
        fail_io: bool,
    }

    impl FakeRecords {
        fn new(onsets: &[f64]) -> Self {
            FakeRecords {
                onsets: onsets.iter().copied().map(Some).collect(),
                calls: Vec::new(),
                fail_io: false,
            }
        }
    }

    impl BlockLoader for FakeRecords {
        fn load_block(&mut self, index: usize, block: &mut AnnotationBlock) -> Result<()> {
            self.calls.push(index);
            if self.fail_io {
                return Err(EdfError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)));
            }
            let mut bytes = match self.onsets[index] {
                Some(onset) => encode_time_keeping(onset),
                None => b"garbage".to_vec(),
            };
            bytes.resize(20, 0);
            block.read_from_buffer(&bytes, 0, bytes.len(), 0)
        }
    }

    #[test]
    fn test_in_order_blocks() {
        let mut records = FakeRecords::new(&[0.0, 1.0, 2.0]);
        let mut list = AnnotationList::new(3, 1.0);
        for i in 0..3 {
            list.block(i, &mut records).unwrap();
        }
        assert!(list.last_error().is_empty());
        assert!(list.errors_seen().is_empty());
    }

    #[test]
    fn test_out_of_order_blocks() {
        let mut records = FakeRecords::new(&[0.0, 2.0, 1.0]);
        let mut list = AnnotationList::new(3, 1.0);
        for i in 0..3 {
            list.block(i, &mut records).unwrap();
        }
        assert!(list.last_error().contains(HeaderErrors::BLOCK_ORDER));
        assert!(list.take_last_error().contains(HeaderErrors::BLOCK_ORDER));
        assert!(list.last_error().is_empty());
        assert!(list.errors_seen().contains(HeaderErrors::BLOCK_ORDER));
    }

    #[test]
    fn test_block_is_loaded_once() {
        let mut records = FakeRecords::new(&[0.0, 1.0]);
        let mut list = AnnotationList::new(2, 1.0);
        assert!(!list.block_in_memory(1));

        assert_eq!(list.block(1, &mut records).unwrap().onset, 1.0);
        assert_eq!(list.block(1, &mut records).unwrap().onset, 1.0);
        assert_eq!(records.calls, vec![1]);
        assert!(list.block_in_memory(1));
        assert!(!list.block_in_memory(0));
    }

    #[test]
    fn test_decode_failure_degrades_block() {
        let mut records = FakeRecords::new(&[0.0]);
        records.onsets[0] = None;
        let mut list = AnnotationList::new(1, 1.0);

        let block = list.block(0, &mut records).unwrap();
        assert!(block.onset.is_nan());
        assert!(block.annotations.is_empty());
        assert!(!list.block_in_memory(0));
        assert!(list.last_error().contains(HeaderErrors::ANNOTATION_DECODE));

        list.block(0, &mut records).unwrap();
        assert_eq!(records.calls.len(), 1);
    }

    #[test]
    fn test_storage_failure_propagates() {
        let mut records = FakeRecords::new(&[0.0]);
        records.fail_io = true;
        let mut list = AnnotationList::new(1, 1.0);

        assert!(matches!(list.block(0, &mut records), Err(EdfError::Io(_))));
        assert!(list.loaded(0).is_none());

        records.fail_io = false;
        assert!(list.block(0, &mut records).is_ok());
    }

    #[test]
    fn test_add_block_grows_and_checks_order() {
        let mut list = AnnotationList::new(0, 1.0);
        list.add_block(2, 2.0).unwrap();
        assert_eq!(list.len(), 3);
        assert!(list.block_in_memory(2));
        assert!(!list.block_in_memory(0));
        assert_eq!(list.modified_blocks(), vec![2]);

        list.add_block(0, 5.0).unwrap();
        assert!(list.last_error().contains(HeaderErrors::BLOCK_ORDER));
    }

    #[test]
    fn test_redistribute_annotations() {
        let mut list = AnnotationList::new(0, 1.0);
        for i in 0..3 {
            list.add_block(i, i as f64).unwrap().modified = false;
        }
        if let Some(block) = list.loaded_mut(0) {
            block.annotations.push(Annotation::new(2.5, None, "late"));
            block.annotations.push(Annotation::new(0.5, None, "stays"));
        }
        list.loaded_mut(1).unwrap().annotations.push(Annotation::new(7.0, None, "after end"));

        list.redistribute_annotations();

        let texts = |i: usize| -> Vec<String> {
            list.loaded(i).unwrap().annotations.iter().map(|a| a.texts[0].clone()).collect()
        };
        assert_eq!(texts(0), vec!["stays".to_string()]);
        assert!(texts(1).is_empty());
        assert_eq!(texts(2), vec!["late".to_string(), "after end".to_string()]);
        assert_eq!(list.modified_blocks(), vec![0, 1, 2]);
        assert_eq!(list.annotations().count(), 3);
    }

    #[test]
    fn test_redistribute_with_zero_duration() {
        let mut list = AnnotationList::new(0, 0.0);
        list.add_block(0, 0.0).unwrap().modified = false;
        list.add_block(1, 10.0).unwrap().modified = false;
        list.loaded_mut(0).unwrap().annotations.push(Annotation::new(12.0, None, "event"));

        list.redistribute_annotations();
        assert!(list.loaded(0).unwrap().annotations.is_empty());
        assert_eq!(list.loaded(1).unwrap().annotations.len(), 1);
    }

    #[test]
    fn test_buffer_roundtrip_through_list() {
        let mut list = AnnotationList::new(1, 1.0);
        list.add_block(0, 0.0).unwrap().annotations.push(Annotation::new(0.5, None, "Beep"));

        let mut record = vec![0u8; 40];
        list.write_to_buffer(0, &mut record, 0, 40, 0).unwrap();

        let mut copy = AnnotationList::new(1, 1.0);
        copy.read_from_buffer(0, &record, 0, 40, 0).unwrap();
        assert!(copy.block_in_memory(0));
        assert_eq!(copy.annotations().next().unwrap().texts[0], "Beep");
        assert_eq!(copy.required_bytes(0), list.required_bytes(0));
        assert_eq!(copy.max_required_bytes(), 5 + 11);
        assert_eq!(copy.required_bytes(4), 0);

        assert!(copy.read_from_buffer(0, &[0u8; 8], 0, 8, 0).is_err());
        assert!(copy.last_error().contains(HeaderErrors::ANNOTATION_DECODE));
        // 解码失败时保留原来的块
        assert!(copy.block_in_memory(0));
        assert_eq!(copy.annotations().count(), 1);
        assert!(list.write_to_buffer(3, &mut record, 0, 40, 0).is_err());
    }

    #[test]
    fn test_failed_decode_leaves_slot_unloaded() {
        let mut list = AnnotationList::new(2, 1.0);
        assert!(list.read_from_buffer(1, b"junk", 0, 4, 0).is_err());
        assert!(list.loaded(1).is_none());

        let mut records = FakeRecords::new(&[0.0, 1.0]);
        assert_eq!(list.block(1, &mut records).unwrap().onset, 1.0);
        assert_eq!(records.calls, vec![1]);
    }

    #[test]
    fn test_install_block_checks_order() {
        let mut list = AnnotationList::new(2, 1.0);
        list.install_block(AnnotationBlock::new(0, 3.0));
        list.install_block(AnnotationBlock::new(1, 1.0));
        assert!(list.block_in_memory(1));
        assert!(list.last_error().contains(HeaderErrors::BLOCK_ORDER));
    }
}
