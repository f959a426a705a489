// Internal utilities for documentation and integration tests
// Helpers generating small EDF+ files through the public DataFile API

use crate::{Annotation, DataFile, Result};
use std::f64::consts::PI;
use std::path::Path;

/// Creates a 10 s EDF+ file: 256 Hz EEG, 16 Hz respiration and two annotations.
pub fn create_annotated_test_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let mut file = DataFile::create(&path, 2)?;
    {
        let header = file.header_mut()?;
        header.set_patient("DOC001 M 01-JAN-1990 Test_Patient")?;
        header.set_signal_label(0, "EEG Fp1")?;
        header.set_physical_dimension(0, "uV")?;
        header.set_prefilter(0, "HP:0.1Hz LP:70Hz")?;
        header.set_calibration(0, -200.0, 200.0, -32768, 32767)?;
        header.set_signal_label(1, "Resp Thorax")?;
        header.set_physical_dimension(1, "mV")?;
        header.set_calibration(1, -5.0, 5.0, -2048, 2047)?;
        header.set_record_duration(1.0)?;
        header.set_samples_per_record(0, 256)?;
        header.set_samples_per_record(1, 16)?;
    }

    file.add_annotation(Annotation::new(1.5, None, "Eyes closed"))?;
    file.add_annotation(Annotation::new(3.25, Some(2.0), "Arousal"))?;
    file.fit_annotation_channel()?;

    for record in 0..10 {
        let eeg = sine(256, 10.0, 50.0, record);
        let resp = sine(16, 0.25, 2.0, record);
        file.write_physical_record(&[eeg, resp])?;
    }
    file.close()
}

/// Creates an EDF+ file with a 10 Hz and a 1 Hz signal and one record of 1 s per
/// entry of `onsets`, each record's time-keeping annotation set to that onset.
pub fn create_test_file_with_onsets<P: AsRef<Path>>(path: P, onsets: &[f64]) -> Result<()> {
    let mut file = DataFile::create(&path, 2)?;
    {
        let header = file.header_mut()?;
        header.set_signal_label(0, "EEG C3")?;
        header.set_signal_label(1, "Pleth")?;
    }
    file.configure_sample_rates(&[10.0, 1.0])?;

    for (record, &onset) in onsets.iter().enumerate() {
        file.set_block_onset(record, onset)?;
        file.write_physical_record(&[sine(10, 1.0, 0.5, record), vec![0.25]])?;
    }
    file.close()
}

fn sine(samples: usize, frequency: f64, amplitude: f64, record: usize) -> Vec<f64> {
    (0..samples)
        .map(|i| {
            let t = record as f64 + i as f64 / samples as f64;
            amplitude * (2.0 * PI * frequency * t).sin()
        })
        .collect()
}
