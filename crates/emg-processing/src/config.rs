//! Filter settings for the chunk pipeline

use crate::filters::{BiquadCoeffs, ButterworthFilter, NotchFilter};
use emg_core::{EmgError, EmgResult};
use serde::{Deserialize, Serialize};

/// Parameters of the per-channel cleaning chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// When false, raw samples pass through untouched and only the envelope is computed
    pub enabled: bool,
    /// Mains interference frequency (Hz)
    pub notch_freq: f64,
    pub notch_q: f64,
    /// Band-limiting cutoffs (Hz); `high_cutoff` is clamped below Nyquist per chunk
    pub low_cutoff: f64,
    pub high_cutoff: f64,
    pub order: usize,
    /// Envelope smoothing window in seconds
    pub envelope_window_secs: f64,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            notch_freq: 60.0,
            notch_q: 30.0,
            low_cutoff: 20.0,
            high_cutoff: 80.0,
            order: 4,
            envelope_window_secs: 0.05,
        }
    }
}

/// Coefficients resolved for one sample rate
#[derive(Debug, Clone)]
pub struct FilterDesign {
    /// Absent when the notch frequency is at or above Nyquist
    pub notch: Option<BiquadCoeffs>,
    pub bandpass: Vec<BiquadCoeffs>,
    pub envelope_window: usize,
}

impl FilterDesign {
    /// Sections in the order they are applied
    pub fn sections(&self) -> Vec<BiquadCoeffs> {
        self.notch
            .iter()
            .copied()
            .chain(self.bandpass.iter().copied())
            .collect()
    }
}

impl FilterSettings {
    /// Surface EMG from an 8-channel Ganglion-class board
    pub fn ganglion_emg() -> Self {
        Self {
            low_cutoff: 40.0,
            high_cutoff: 100.0,
            ..Self::default()
        }
    }

    /// Unfiltered raw with a smoothed envelope
    pub fn passthrough() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> EmgResult<()> {
        if !(self.notch_freq > 0.0 && self.notch_freq.is_finite()) {
            return Err(EmgError::config(format!(
                "notch_freq must be positive, got {}",
                self.notch_freq
            )));
        }
        if !(self.notch_q > 0.0 && self.notch_q.is_finite()) {
            return Err(EmgError::config(format!(
                "notch_q must be positive, got {}",
                self.notch_q
            )));
        }
        if !(self.low_cutoff > 0.0 && self.low_cutoff < self.high_cutoff) {
            return Err(EmgError::config(format!(
                "cutoffs must satisfy 0 < low ({}) < high ({})",
                self.low_cutoff, self.high_cutoff
            )));
        }
        if !(1..=8).contains(&self.order) {
            return Err(EmgError::config(format!(
                "order must be between 1 and 8, got {}",
                self.order
            )));
        }
        if !(self.envelope_window_secs > 0.0 && self.envelope_window_secs.is_finite()) {
            return Err(EmgError::config(format!(
                "envelope_window_secs must be positive, got {}",
                self.envelope_window_secs
            )));
        }
        Ok(())
    }

    /// Upper band edge actually used at `sample_rate`
    pub fn clamped_high(&self, sample_rate: f64) -> f64 {
        self.high_cutoff.min(sample_rate / 2.0 - 1.0)
    }

    /// Envelope smoothing window in samples, never less than one
    pub fn envelope_window(&self, sample_rate: f64) -> usize {
        let samples = (self.envelope_window_secs * sample_rate).round();
        if samples.is_finite() && samples >= 1.0 {
            samples as usize
        } else {
            1
        }
    }

    /// Resolve coefficients for `sample_rate`
    pub fn design(&self, sample_rate: f64) -> EmgResult<FilterDesign> {
        if !(sample_rate > 0.0 && sample_rate.is_finite()) {
            return Err(EmgError::filter(format!(
                "sample rate must be positive, got {}",
                sample_rate
            )));
        }

        let high = self.clamped_high(sample_rate);
        if self.low_cutoff >= high {
            return Err(EmgError::filter(format!(
                "degenerate band: low {:.2} Hz >= high {:.2} Hz at {:.1} Hz",
                self.low_cutoff, high, sample_rate
            )));
        }

        let notch = if self.notch_freq < sample_rate / 2.0 {
            Some(NotchFilter::design(self.notch_freq, sample_rate, self.notch_q).map_err(EmgError::filter)?)
        } else {
            None
        };

        let bandpass = ButterworthFilter::bandpass(self.low_cutoff, high, sample_rate, self.order)
            .map_err(EmgError::filter)?;

        Ok(FilterDesign {
            notch,
            bandpass,
            envelope_window: self.envelope_window(sample_rate),
        })
    }

    pub fn to_json(&self) -> EmgResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EmgError::config(format!("Failed to serialize filter settings: {}", e)))
    }

    pub fn from_json(json: &str) -> EmgResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| EmgError::config(format!("Failed to deserialize filter settings: {}", e)))
    }
}
