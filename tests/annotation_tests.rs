use edfplus_engine::doctest_utils::create_annotated_test_file;
use edfplus_engine::{
    Annotation, AnnotationBlock, AnnotationList, BlockLoader, DataFile, EdfError, HeaderErrors,
    PrereadMode, Result,
};
use tempfile::tempdir;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// 内存中的注释块来源，记录加载次数
struct MemoryLoader {
    onsets: Vec<f64>,
    texts: Vec<Option<&'static str>>,
    loads: usize,
}

impl MemoryLoader {
    fn new(onsets: &[f64]) -> Self {
        MemoryLoader {
            onsets: onsets.to_vec(),
            texts: vec![None; onsets.len()],
            loads: 0,
        }
    }
}

impl BlockLoader for MemoryLoader {
    fn load_block(&mut self, index: usize, block: &mut AnnotationBlock) -> Result<()> {
        self.loads += 1;
        let onset = *self.onsets.get(index).ok_or(EdfError::InvalidRecordIndex(index))?;
        block.onset = onset;
        if let Some(text) = self.texts[index] {
            block.annotations.push(Annotation::new(onset + 0.5, None, text));
        }
        Ok(())
    }
}

#[test]
fn test_file_annotations_in_order() {
    init_logger();
    let dir = tempdir().unwrap();
    let path = dir.path().join("annotations.edf");
    create_annotated_test_file(&path).unwrap();

    let file = DataFile::open(&path, true, PrereadMode::None).unwrap();
    for index in 0..file.nr_records() {
        let block = file.annotation_block(index).unwrap();
        assert_eq!(block.record, index);
        assert_eq!(block.onset, index as f64);
        assert!(!block.modified);
    }

    let annotations = file.annotations().unwrap();
    let onsets: Vec<f64> = annotations.iter().map(|a| a.onset).collect();
    assert_eq!(onsets, vec![1.5, 3.25]);
    // 时间记录注释不出现在列表中
    assert!(annotations.iter().all(|a| a.texts.iter().all(|t| !t.is_empty())));
    assert!(!file.header_errors().contains(HeaderErrors::BLOCK_ORDER));
}

#[test]
fn test_redistribute_moves_misplaced_annotation() {
    init_logger();
    let dir = tempdir().unwrap();
    let path = dir.path().join("redistribute.edf");
    create_annotated_test_file(&path).unwrap();

    {
        let mut file = DataFile::open(&path, false, PrereadMode::None).unwrap();
        file.annotations().unwrap();

        // 把 7.25 s 的注释写进第 2 条记录
        let mut record = file.read_data_block(2).unwrap();
        let mut misplaced = AnnotationBlock::new(2, 2.0);
        misplaced.annotations.push(Annotation::new(7.25, None, "Spindle"));
        let annotation_bytes = record.len() - 544;
        misplaced.write_to_buffer(&mut record, 544, annotation_bytes, 0).unwrap();
        file.write_data_block(2, &record).unwrap();
        assert_eq!(file.annotation_block(2).unwrap().annotations.len(), 1);

        file.redistribute_annotations().unwrap();
        let modified = file.with_annotations(|list| list.modified_blocks()).unwrap();
        assert_eq!(modified, vec![2, 7]);
        assert_eq!(file.flush_annotations().unwrap(), 2);
        file.close().unwrap();
    }

    let file = DataFile::open(&path, true, PrereadMode::None).unwrap();
    assert!(file.annotation_block(2).unwrap().annotations.is_empty());
    let block = file.annotation_block(7).unwrap();
    assert_eq!(block.annotations.len(), 1);
    assert_eq!(block.annotations[0].onset, 7.25);
    assert_eq!(block.annotations[0].texts, vec!["Spindle".to_string()]);
    assert_eq!(file.annotations().unwrap().len(), 3);
}

#[test]
fn test_list_loads_each_block_once() {
    let mut loader = MemoryLoader::new(&[0.0, 1.0, 2.0, 3.0]);
    loader.texts[2] = Some("Blink");
    let mut list = AnnotationList::new(4, 1.0);

    assert_eq!(list.block(2, &mut loader).unwrap().annotations.len(), 1);
    assert_eq!(list.block(2, &mut loader).unwrap().onset, 2.0);
    assert_eq!(loader.loads, 1);

    // 只遍历已加载的块
    assert_eq!(list.annotations().count(), 1);
    assert!(list.block_in_memory(2));
    assert!(!list.block_in_memory(0));
    assert!(list.modified_blocks().is_empty());
    assert!(list.errors_seen().is_empty());
}

#[test]
fn test_list_flags_out_of_order_block() {
    let mut loader = MemoryLoader::new(&[0.0, 5.0, 2.0]);
    let mut list = AnnotationList::new(3, 1.0);

    list.block(0, &mut loader).unwrap();
    list.block(1, &mut loader).unwrap();
    assert!(list.last_error().is_empty());

    list.block(2, &mut loader).unwrap();
    assert_eq!(list.take_last_error(), HeaderErrors::BLOCK_ORDER);
    assert!(list.last_error().is_empty());
    assert!(list.errors_seen().contains(HeaderErrors::BLOCK_ORDER));
}

#[test]
fn test_list_propagates_load_failure() {
    let mut loader = MemoryLoader::new(&[0.0]);
    let mut list = AnnotationList::new(2, 1.0);

    assert!(matches!(list.block(1, &mut loader), Err(EdfError::InvalidRecordIndex(1))));
    assert!(!list.block_in_memory(1));
    assert!(list.errors_seen().is_empty());
}

#[test]
fn test_block_onsets_edited_before_writing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("onsets.edf");
    {
        let mut file = DataFile::create(&path, 1).unwrap();
        file.add_annotation(Annotation::new(0.25, Some(0.5), "Start")).unwrap();
        file.set_block_onset(0, 0.5).unwrap();
        // 注释保留在块中
        assert_eq!(file.annotation_block(0).unwrap().annotations.len(), 1);
        file.fit_annotation_channel().unwrap();
        file.write_physical_record(&[vec![0.0]]).unwrap();
        file.close().unwrap();
    }

    let file = DataFile::open(&path, true, PrereadMode::None).unwrap();
    let block = file.annotation_block(0).unwrap();
    assert_eq!(block.onset, 0.5);
    assert_eq!(block.annotations[0].duration, Some(0.5));
    assert_eq!(block.annotations[0].texts, vec!["Start".to_string()]);
    assert!(!file.header_errors().contains(HeaderErrors::FIRST_RECORD_OFFSET));
}
