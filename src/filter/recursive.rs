use crate::error::{EdfError, Result};

use super::{Direction, FilterState};

/// Feedback sums closer to 1 than this are treated as an integrator.
const INTEGRATOR_TOLERANCE: f64 = 1e-12;

/// Direct-form recursive (IIR) filter core.
///
/// `zeros[k]` multiplies the input `k` samples back, `poles[k]` (for `k >= 1`)
/// the output `k` samples back; `poles[0]` is the normalisation and always 1.
#[derive(Debug, Clone)]
pub struct RecursiveFilter {
    zeros: Vec<f64>,
    poles: Vec<f64>,
    state_z: Vec<f64>,
    state_p: Vec<f64>,
    anticipate: bool,
    backpolate: f64,
    direction: Direction,
    reset_armed: bool,
}

impl Default for RecursiveFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl RecursiveFilter {
    pub fn new() -> Self {
        RecursiveFilter {
            zeros: Vec::new(),
            poles: Vec::new(),
            state_z: Vec::new(),
            state_p: Vec::new(),
            anticipate: true,
            backpolate: 0.0,
            direction: Direction::Forward,
            reset_armed: false,
        }
    }

    /// Installs new coefficients. Delay lines keep their contents when their
    /// length does not change.
    pub fn set_coefficients(&mut self, zeros: Vec<f64>, poles: Vec<f64>) {
        self.state_z.resize(zeros.len(), 0.0);
        self.state_p.resize(poles.len(), 0.0);
        self.zeros = zeros;
        self.poles = poles;
    }

    pub fn has_coefficients(&self) -> bool {
        !self.zeros.is_empty() && !self.poles.is_empty()
    }

    pub fn zeros(&self) -> &[f64] {
        &self.zeros
    }

    pub fn poles(&self) -> &[f64] {
        &self.poles
    }

    pub fn anticipate(&self) -> bool {
        self.anticipate
    }

    /// With anticipation off, each output is the feedback part only, so the
    /// current input first shows up in the next sample.
    pub fn set_anticipate(&mut self, anticipate: bool) {
        self.anticipate = anticipate;
    }

    pub fn backpolate(&self) -> f64 {
        self.backpolate
    }

    /// Blend ratio of the previous output into each new output, clamped to `[0, 1]`.
    pub fn set_backpolate(&mut self, ratio: f64) {
        self.backpolate = ratio.clamp(0.0, 1.0);
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    pub fn reset(&mut self) {
        self.state_z.fill(0.0);
        self.state_p.fill(0.0);
        self.reset_armed = false;
    }

    /// Makes the next input sample reinitialize the filter through [`RecursiveFilter::reset_to`].
    pub fn reset_on_next_sample(&mut self) {
        self.reset_armed = true;
    }

    pub fn is_reset_armed(&self) -> bool {
        self.reset_armed
    }

    /// Puts the filter in the steady state for a constant input `value`.
    ///
    /// An integrator has no finite steady state; its output line is set to `value`.
    pub fn reset_to(&mut self, value: f64) {
        let zero_sum: f64 = self.zeros.iter().sum();
        let feedback: f64 = self.poles.iter().skip(1).sum();
        let denominator = 1.0 - feedback;
        let output = if denominator.abs() < INTEGRATOR_TOLERANCE {
            value
        } else {
            value * zero_sum / denominator
        };
        self.state_z.fill(value);
        self.state_p.fill(output);
        self.reset_armed = false;
    }

    pub fn save_state(&self) -> FilterState {
        FilterState {
            zeros: self.state_z.clone(),
            poles: self.state_p.clone(),
        }
    }

    pub fn restore_state(&mut self, state: &FilterState) -> Result<()> {
        if self.has_coefficients()
            && (state.zeros.len() != self.zeros.len() || state.poles.len() != self.poles.len())
        {
            return Err(EdfError::InvalidArgument(format!(
                "filter state has {}/{} delays, filter needs {}/{}",
                state.zeros.len(),
                state.poles.len(),
                self.zeros.len(),
                self.poles.len()
            )));
        }
        self.state_z.clone_from(&state.zeros);
        self.state_p.clone_from(&state.poles);
        Ok(())
    }

    /// Filters `input[start..=end]` into `output`, starting at `out_start`.
    /// Output positions follow input positions in both directions.
    pub fn filter_samples(
        &mut self,
        input: &[f64],
        output: &mut [f64],
        start: usize,
        end: usize,
        out_start: usize,
    ) -> Result<()> {
        check_range(input.len(), start, end)?;
        check_range(output.len(), out_start, out_start + (end - start))?;
        for i in self.order(start, end) {
            output[out_start + (i - start)] = self.step(input[i]);
        }
        Ok(())
    }

    /// Filters `data[start..=end]` in place.
    pub fn filter_in_place(&mut self, data: &mut [f64], start: usize, end: usize) -> Result<()> {
        check_range(data.len(), start, end)?;
        for i in self.order(start, end) {
            data[i] = self.step(data[i]);
        }
        Ok(())
    }

    fn order(&self, start: usize, end: usize) -> Box<dyn Iterator<Item = usize>> {
        match self.direction {
            Direction::Forward => Box::new(start..=end),
            Direction::Reverse => Box::new((start..=end).rev()),
        }
    }

    fn step(&mut self, input: f64) -> f64 {
        if self.reset_armed {
            self.reset_to(input);
        }

        self.state_z.rotate_right(1);
        if let Some(current) = self.state_z.first_mut() {
            *current = input;
        }
        self.state_p.rotate_right(1);

        let feedback: f64 = self
            .poles
            .iter()
            .zip(&self.state_p)
            .skip(1)
            .map(|(pole, past)| pole * past)
            .sum();
        let full = feedback
            + self
                .zeros
                .iter()
                .zip(&self.state_z)
                .map(|(zero, past)| zero * past)
                .sum::<f64>();

        let mut sample = if self.anticipate { full } else { feedback };
        if self.backpolate > 0.0 {
            let previous = self.state_p.get(1).copied().unwrap_or(0.0);
            sample = self.backpolate * previous + (1.0 - self.backpolate) * sample;
        }
        if let Some(current) = self.state_p.first_mut() {
            *current = full;
        }
        sample
    }
}

fn check_range(len: usize, start: usize, end: usize) -> Result<()> {
    if start > end || end >= len {
        return Err(EdfError::InvalidArgument(format!(
            "sample range {}..={} outside buffer of {}",
            start, end, len
        )));
    }
    Ok(())
}
