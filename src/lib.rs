//! # EDF+ Engine for Rust
//!
//! A pure Rust engine for EDF+ (European Data Format Plus) recordings: header
//! validation, raw data-record I/O, a lazily loaded annotation cache with an
//! optional background preread, record-duration selection for new files and
//! recursive filters for the stored signals.
//!
//! ## Quick Start
//!
//! ### Reading an EDF+ file
//!
//! ```rust
//! use edfplus_engine::{DataFile, PrereadMode, Result};
//!
//! fn main() -> Result<()> {
//!     # edfplus_engine::doctest_utils::create_annotated_test_file("quick_read.edf")?;
//!     let mut file = DataFile::open("quick_read.edf", true, PrereadMode::OnOpen)?;
//!
//!     let header = file.header();
//!     println!("Signals: {}", header.nr_signals());
//!     println!("Record duration: {} s", header.record_duration());
//!     if !file.valid_format() {
//!         println!("Format problems: {}", file.header_errors());
//!     }
//!
//!     // First second of the EEG channel
//!     let samples = file.read_physical_samples(0, 0, 256)?;
//!     println!("Read {} samples", samples.len());
//!
//!     for annotation in file.annotations()? {
//!         println!("{:.2} s: {}", annotation.onset, annotation.texts.join(" "));
//!     }
//!     # drop(file);
//!     # std::fs::remove_file("quick_read.edf").ok();
//!     Ok(())
//! }
//! ```
//!
//! ### Creating an EDF+ file
//!
//! ```rust
//! use edfplus_engine::{Annotation, DataFile, Result};
//!
//! fn main() -> Result<()> {
//!     // Two ordinary signals plus the annotation signal
//!     let mut file = DataFile::create("quick_write.edf", 2)?;
//!     file.header_mut()?.set_signal_label(0, "EEG Fp1")?;
//!     file.header_mut()?.set_signal_label(1, "Pleth")?;
//!
//!     // 10 Hz and 1 Hz give 1 s records with 10 and 1 samples
//!     let block = file.configure_sample_rates(&[10.0, 1.0])?;
//!     assert_eq!(block.duration, 1.0);
//!
//!     // Annotations must be added before their record is written
//!     file.add_annotation(Annotation::new(0.5, None, "Start"))?;
//!     for _ in 0..5 {
//!         file.write_physical_record(&[vec![0.0; 10], vec![0.0]])?;
//!     }
//!     file.close()?;
//!     # std::fs::remove_file("quick_write.edf").ok();
//!     Ok(())
//! }
//! ```
//!
//! ## Format problems
//!
//! Opening never fails because of non-fatal format problems. They are
//! collected as [`HeaderErrors`] bits; [`DataFile::valid_format`] weighs them
//! against the strict-checking policy, which can be changed at any time:
//!
//! ```rust
//! use edfplus_engine::{DataFile, HeaderErrors, PrereadMode};
//!
//! # edfplus_engine::doctest_utils::create_test_file_with_onsets("order.edf", &[0.0, 2.0, 1.0])?;
//! let mut file = DataFile::open("order.edf", true, PrereadMode::OnOpen)?;
//! assert!(file.header_errors().contains(HeaderErrors::BLOCK_ORDER));
//! assert!(!file.valid_format());
//!
//! file.set_strict_checking(false);
//! assert!(file.valid_format());
//! # drop(file);
//! # std::fs::remove_file("order.edf").ok();
//! # Ok::<(), edfplus_engine::EdfError>(())
//! ```

pub mod annotations;
pub mod block_size;
pub mod datafile;
pub mod error;
pub mod error_collector;
pub mod filter;
pub mod header;
pub mod preread;
pub mod tal;
pub mod types;
pub mod utils;

#[doc(hidden)]
pub mod doctest_utils; // For internal doctest support

// Re-export main types for convenience
pub use annotations::{AnnotationList, BlockLoader};
pub use block_size::{BlockSize, BlockSizeCalculator};
pub use datafile::{DataFile, FileState, OpenOptions};
pub use error::{EdfError, Result};
pub use error_collector::ErrorCollector;
pub use filter::{Direction, Filter, FilterSettings, FilterState};
pub use header::{FileHeader, RecordLayout};
pub use preread::{PrereadEvent, PrereadMode, PrereadScheduler};
pub use types::{Annotation, AnnotationBlock, HeaderErrors, HeaderFields, SignalDescriptor};

// Important constants
pub const EDFLIB_TIME_DIMENSION: i64 = 10_000_000; // 100 nanoseconds unit
pub const EDFLIB_MAXSIGNALS: usize = 4096;
/// Record size above which a file is flagged under strict checking.
pub const RECOMMENDED_MAX_RECORD_BYTES: usize = 61_440;
pub const ANNOTATION_LABEL: &str = "EDF Annotations";
/// Samples per record of the annotation signal of a new file.
pub const DEFAULT_ANNOTATION_SAMPLES: usize = 10;

/// Library version
///
/// ```rust
/// let version = edfplus_engine::version();
/// assert!(version.contains('.'));
/// ```
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
