use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EdfError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Signal index {0} out of range")]
    InvalidSignalIndex(usize),

    #[error("Data record {0} out of range")]
    InvalidRecordIndex(usize),

    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("Invalid header size")]
    InvalidHeader,

    #[error("Invalid number of signals: {0}")]
    InvalidSignalCount(i64),

    #[error("Physical min equals physical max")]
    PhysicalMinEqualsMax,

    #[error("Digital min equals digital max")]
    DigitalMinEqualsMax,

    #[error("File is opened read-only")]
    ReadOnly,

    #[error("File is closed")]
    Closed,

    #[error("Annotation signal decode error: {0}")]
    TalDecode(String),

    #[error("Annotations of record {record} do not fit into annotation channel {channel}")]
    AnnotationOverflow { record: usize, channel: usize },

    #[error("Annotation block {0} requested while it is being loaded")]
    ReentrantLoad(usize),

    #[error("Shared file state is poisoned")]
    Poisoned,

    #[error("Invalid setting {slot} for filter {filter}")]
    FilterSetting { filter: String, slot: usize },

    #[error("Unknown filter: {0}")]
    UnknownFilter(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, EdfError>;
