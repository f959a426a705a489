//! Eager or background loading of annotation blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::Result;
use crate::error_collector::ErrorCollector;
use crate::types::HeaderErrors;

/// Collector id for a preread that stopped on a hard error.
pub const PREREAD_FAILURE_ID: i32 = -1;

const BLOCK_ORDER_MESSAGE: &str = "Annotation blocks are not in chronological order";
const ANNOTATION_DECODE_MESSAGE: &str = "Annotation signal could not be decoded";

/// When annotation blocks are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrereadMode {
    /// Blocks load on first access.
    #[default]
    None,
    /// Every block loads before `open` returns.
    OnOpen,
    /// Blocks load in a worker thread.
    Background,
}

/// Notifications sent by a background preread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrereadEvent {
    Started,
    Finished,
}

/// Walks records in order, calling a per-record step that loads one block and
/// reports the problems it flagged.
///
/// At most one worker runs at a time. Cancellation is checked between records,
/// so `cancel` returns after the record in progress is finished.
#[derive(Debug, Default)]
pub struct PrereadScheduler {
    mode: PrereadMode,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    errors: Arc<Mutex<ErrorCollector>>,
    events: Option<Receiver<PrereadEvent>>,
}

impl PrereadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> PrereadMode {
        self.mode
    }

    /// Runs `step` over `records` according to `mode`, cancelling any running worker first.
    ///
    /// `OnOpen` runs to completion on the calling thread; `Background` returns
    /// immediately and reports through [`PrereadScheduler::take_events`].
    pub fn start<F>(&mut self, mode: PrereadMode, records: Vec<usize>, mut step: F)
    where
        F: FnMut(usize) -> Result<HeaderErrors> + Send + 'static,
    {
        self.cancel();
        self.mode = mode;
        self.cancel.store(false, Ordering::Release);
        if let Ok(mut errors) = self.errors.lock() {
            errors.clear();
        }

        match mode {
            PrereadMode::None => {}
            PrereadMode::OnOpen => {
                log::debug!("Preread of {} records on open", records.len());
                walk(&records, &mut step, &self.cancel, &self.errors);
            }
            PrereadMode::Background => {
                let (tx, rx) = mpsc::channel();
                self.events = Some(rx);
                let cancel = Arc::clone(&self.cancel);
                let errors = Arc::clone(&self.errors);
                log::debug!("Starting background preread of {} records", records.len());
                self.worker = Some(std::thread::spawn(move || {
                    notify(&tx, PrereadEvent::Started);
                    walk(&records, &mut step, &cancel, &errors);
                    notify(&tx, PrereadEvent::Finished);
                }));
            }
        }
    }

    /// Requests cancellation and joins the worker, if any.
    pub fn cancel(&mut self) {
        if self.worker.is_some() {
            self.cancel.store(true, Ordering::Release);
            self.join();
        }
    }

    /// Waits for a running worker to finish without cancelling it.
    pub fn wait(&mut self) {
        self.join();
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, |worker| !worker.is_finished())
    }

    /// Problems collected by the last preread.
    pub fn errors(&self) -> Arc<Mutex<ErrorCollector>> {
        Arc::clone(&self.errors)
    }

    /// Receiver for the notifications of the last background preread.
    pub fn take_events(&mut self) -> Option<Receiver<PrereadEvent>> {
        self.events.take()
    }

    fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("Preread worker panicked");
            }
        }
    }
}

impl Drop for PrereadScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn notify(tx: &Sender<PrereadEvent>, event: PrereadEvent) {
    // 接收端可能已被丢弃
    let _ = tx.send(event);
}

fn walk<F>(records: &[usize], step: &mut F, cancel: &AtomicBool, errors: &Mutex<ErrorCollector>)
where
    F: FnMut(usize) -> Result<HeaderErrors>,
{
    for &record in records {
        if cancel.load(Ordering::Acquire) {
            log::debug!("Preread cancelled before record {}", record);
            return;
        }
        match step(record) {
            Ok(flags) => {
                if flags.contains(HeaderErrors::BLOCK_ORDER) {
                    collect(errors, BLOCK_ORDER_MESSAGE, HeaderErrors::BLOCK_ORDER);
                }
                if flags.contains(HeaderErrors::ANNOTATION_DECODE) {
                    collect(errors, ANNOTATION_DECODE_MESSAGE, HeaderErrors::ANNOTATION_DECODE);
                }
            }
            Err(e) => {
                log::warn!("Preread stopped at record {}: {}", record, e);
                if let Ok(mut errors) = errors.lock() {
                    errors.add(format!("Preread stopped at record {}: {}", record, e), PREREAD_FAILURE_ID);
                }
                return;
            }
        }
    }
}

fn collect(errors: &Mutex<ErrorCollector>, message: &str, flag: HeaderErrors) {
    if let Ok(mut errors) = errors.lock() {
        errors.add(message, flag.bits() as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EdfError;
    use std::time::Duration;

    #[test]
    fn test_on_open_runs_every_record() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&visited);
        let mut scheduler = PrereadScheduler::new();
        scheduler.start(PrereadMode::OnOpen, vec![1, 2, 3], move |record| {
            seen.lock().unwrap().push(record);
            Ok(HeaderErrors::empty())
        });

        assert_eq!(*visited.lock().unwrap(), vec![1, 2, 3]);
        assert!(!scheduler.is_running());
        assert!(scheduler.take_events().is_none());
        assert!(!scheduler.errors().lock().unwrap().is_signaled());
    }

    #[test]
    fn test_none_mode_does_nothing() {
        let mut scheduler = PrereadScheduler::new();
        scheduler.start(PrereadMode::None, vec![0, 1], |_| panic!("step called"));
        assert_eq!(scheduler.mode(), PrereadMode::None);
    }

    #[test]
    fn test_background_events_and_errors() {
        let mut scheduler = PrereadScheduler::new();
        scheduler.start(PrereadMode::Background, (0..10).collect(), |record| {
            if record == 3 || record == 5 {
                Ok(HeaderErrors::BLOCK_ORDER)
            } else if record == 7 {
                Err(EdfError::InvalidRecordIndex(record))
            } else {
                Ok(HeaderErrors::empty())
            }
        });

        let events = scheduler.take_events().unwrap();
        assert_eq!(events.recv().unwrap(), PrereadEvent::Started);
        assert_eq!(events.recv().unwrap(), PrereadEvent::Finished);
        scheduler.wait();

        let errors = scheduler.errors();
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors.contains_id(HeaderErrors::BLOCK_ORDER.bits() as i32));
        assert!(errors.contains_id(PREREAD_FAILURE_ID));
    }

    #[test]
    fn test_cancel_stops_between_records() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&visited);
        let mut scheduler = PrereadScheduler::new();
        scheduler.start(PrereadMode::Background, (0..1000).collect(), move |record| {
            seen.lock().unwrap().push(record);
            std::thread::sleep(Duration::from_millis(1));
            Ok(HeaderErrors::empty())
        });

        std::thread::sleep(Duration::from_millis(5));
        scheduler.cancel();
        assert!(!scheduler.is_running());

        let visited = visited.lock().unwrap();
        assert!(visited.len() < 1000);
        assert!(visited.iter().enumerate().all(|(i, &record)| i == record));
    }

    #[test]
    fn test_restart_clears_previous_errors() {
        let mut scheduler = PrereadScheduler::new();
        scheduler.start(PrereadMode::OnOpen, vec![0], |_| Ok(HeaderErrors::BLOCK_ORDER));
        assert!(scheduler.errors().lock().unwrap().is_signaled());

        scheduler.start(PrereadMode::OnOpen, vec![0], |_| Ok(HeaderErrors::empty()));
        assert!(!scheduler.errors().lock().unwrap().is_signaled());
    }
}
