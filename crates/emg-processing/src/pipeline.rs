//! Per-channel cleaning chain: detrend, notch, band-limit, envelope

use crate::config::FilterSettings;
use crate::filters::{detrend_constant, envelope, SosFilter};
use crate::processor::{ChunkFilter, FilteredChunk};
use emg_core::{EmgError, EmgResult, SignalMatrix};
use tracing::trace;

/// Stateless chunk filter.
///
/// Filter state starts at zero for every channel of every chunk, so any
/// chunk can be processed on its own. Successive chunks overlap on the live
/// path, which makes carried-over state meaningless anyway.
#[derive(Debug, Clone, Default)]
pub struct FilterPipeline {
    settings: FilterSettings,
}

impl FilterPipeline {
    pub fn new(settings: FilterSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &FilterSettings {
        &self.settings
    }
}

impl ChunkFilter for FilterPipeline {
    fn filter(&self, chunk: &SignalMatrix, sample_rate: f64) -> EmgResult<FilteredChunk> {
        let (rows, channels) = chunk.shape();
        if rows == 0 {
            return Ok(FilteredChunk::fallback(chunk));
        }

        let (sections, window) = if self.settings.enabled {
            let design = self.settings.design(sample_rate)?;
            (Some(design.sections()), design.envelope_window)
        } else {
            (None, self.settings.envelope_window(sample_rate))
        };

        let mut raw = SignalMatrix::zeros(rows, channels);
        let mut env = SignalMatrix::zeros(rows, channels);

        for (idx, mut samples) in chunk.all_channels().into_iter().enumerate() {
            let cleaned = match &sections {
                Some(sections) => {
                    detrend_constant(&mut samples);
                    SosFilter::new(sections).filter(&samples)
                }
                None => samples,
            };
            env.set_channel(idx, &envelope(&cleaned, window))?;
            raw.set_channel(idx, &cleaned)?;
        }

        if !raw.is_finite() || !env.is_finite() {
            return Err(EmgError::filter("non-finite filter output"));
        }

        trace!(rows, channels, window, "Filtered chunk");
        Ok(FilteredChunk { raw, env })
    }

    fn name(&self) -> &str {
        "emg_bandpass"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::SafeFilter;
    use std::f64::consts::PI;

    fn chunk_of(rows: usize, channels: usize, f: impl Fn(usize, usize) -> f64) -> SignalMatrix {
        SignalMatrix::from_rows(
            (0..rows)
                .map(|r| (0..channels).map(|c| f(r, c)).collect())
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_shape_preserved() {
        let pipeline = FilterPipeline::default();
        let chunk = chunk_of(20, 2, |r, c| (r as f64 * 0.3 + c as f64).sin());

        let out = pipeline.filter(&chunk, 200.0).unwrap();
        assert_eq!(out.raw.shape(), (20, 2));
        assert_eq!(out.env.shape(), (20, 2));
        assert!(out.env.data().iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_dc_removed() {
        let pipeline = FilterPipeline::default();
        let chunk = chunk_of(50, 3, |_, c| 5.0 + c as f64);

        let out = pipeline.filter(&chunk, 200.0).unwrap();
        assert!(out.raw.data().iter().all(|v| v.abs() < 1e-9));
        assert!(out.env.data().iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn test_mains_hum_suppressed() {
        let fs = 200.0;
        let pipeline = FilterPipeline::default();
        let chunk = chunk_of(2000, 1, |r, _| (2.0 * PI * 60.0 * r as f64 / fs).sin());

        let out = pipeline.filter(&chunk, fs).unwrap();
        let tail = &out.raw.data()[1500..];
        let rms = (tail.iter().map(|v| v * v).sum::<f64>() / tail.len() as f64).sqrt();
        assert!(rms < 0.1);
    }

    #[test]
    fn test_envelope_uses_designed_window() {
        let settings = FilterSettings {
            envelope_window_secs: 0.1,
            ..FilterSettings::default()
        };
        let design = settings.design(200.0).unwrap();
        assert_eq!(design.envelope_window, 20);

        let chunk = chunk_of(60, 1, |r, _| (r as f64 * 0.9).sin());
        let out = FilterPipeline::new(settings).filter(&chunk, 200.0).unwrap();
        assert_eq!(out.env.channel_data(0).unwrap(), envelope(&out.raw.channel_data(0).unwrap(), 20));
    }

    #[test]
    fn test_passthrough_keeps_raw() {
        let pipeline = FilterPipeline::new(FilterSettings::passthrough());
        let chunk = chunk_of(10, 2, |r, _| -(r as f64));

        let out = pipeline.filter(&chunk, 200.0).unwrap();
        assert_eq!(out.raw, chunk);
        assert!(out.env.data().iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_degenerate_band_falls_back() {
        let settings = FilterSettings {
            low_cutoff: 120.0,
            high_cutoff: 150.0,
            ..FilterSettings::default()
        };
        let safe = SafeFilter::new(FilterPipeline::new(settings));
        let chunk = chunk_of(20, 2, |r, c| (r * 2 + c) as f64);

        let out = safe.process(&chunk, 200.0);
        assert_eq!(out.raw, chunk);
        assert_eq!(out.env, SignalMatrix::zeros(20, 2));
        assert_eq!(safe.stats().failures, 1);
    }

    #[test]
    fn test_non_finite_input_falls_back() {
        let safe = SafeFilter::new(FilterPipeline::default());
        let chunk = chunk_of(20, 1, |r, _| if r == 5 { f64::NAN } else { 0.0 });

        let out = safe.process(&chunk, 200.0);
        assert_eq!(out.env, SignalMatrix::zeros(20, 1));
        assert_eq!(safe.stats().failures, 1);
    }

    #[test]
    fn test_empty_chunk() {
        let out = FilterPipeline::default()
            .filter(&SignalMatrix::empty(4), 200.0)
            .unwrap();
        assert_eq!(out.raw.shape(), (0, 4));
    }
}
