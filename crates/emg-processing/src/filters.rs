//! Digital filters for biosignal chunks
//!
//! IIR filters are built from second-order sections (biquads) for numerical
//! stability. Designs are plain coefficient sets; a fresh [`SosFilter`] with
//! zeroed state is instantiated for every channel of every chunk.

use std::f64::consts::PI;

/// Biquad coefficients, normalized so that a0 = 1.
///
/// `H(z) = (b0 + b1*z^-1 + b2*z^-2) / (1 + a1*z^-1 + a2*z^-2)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    fn is_finite(&self) -> bool {
        [self.b0, self.b1, self.b2, self.a1, self.a2]
            .iter()
            .all(|c| c.is_finite())
    }
}

/// Single biquad section (Direct Form II Transposed)
#[derive(Debug, Clone)]
struct BiquadSection {
    coeffs: BiquadCoeffs,
    z1: f64,
    z2: f64,
}

impl BiquadSection {
    fn new(coeffs: BiquadCoeffs) -> Self {
        Self { coeffs, z1: 0.0, z2: 0.0 }
    }

    #[inline]
    fn process_sample(&mut self, input: f64) -> f64 {
        let c = &self.coeffs;
        let output = c.b0 * input + self.z1;
        self.z1 = c.b1 * input - c.a1 * output + self.z2;
        self.z2 = c.b2 * input - c.a2 * output;
        output
    }
}

/// Cascade of biquad sections
#[derive(Debug, Clone)]
pub struct SosFilter {
    sections: Vec<BiquadSection>,
}

impl SosFilter {
    pub fn new(sections: &[BiquadCoeffs]) -> Self {
        Self {
            sections: sections.iter().copied().map(BiquadSection::new).collect(),
        }
    }

    /// Filter one sample through all sections in series
    #[inline]
    pub fn process_sample(&mut self, input: f64) -> f64 {
        self.sections
            .iter_mut()
            .fold(input, |sample, section| section.process_sample(sample))
    }

    /// Filter a signal, returning a new vector
    pub fn filter(&mut self, signal: &[f64]) -> Vec<f64> {
        signal.iter().map(|&s| self.process_sample(s)).collect()
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn reset(&mut self) {
        for section in &mut self.sections {
            section.z1 = 0.0;
            section.z2 = 0.0;
        }
    }
}

/// Butterworth designs via the bilinear transform
pub struct ButterworthFilter;

impl ButterworthFilter {
    pub fn lowpass(cutoff: f64, sample_rate: f64, order: usize) -> Result<Vec<BiquadCoeffs>, String> {
        let k = Self::prewarp(cutoff, sample_rate)?;
        Self::design(k, order, false)
    }

    pub fn highpass(cutoff: f64, sample_rate: f64, order: usize) -> Result<Vec<BiquadCoeffs>, String> {
        let k = Self::prewarp(cutoff, sample_rate)?;
        Self::design(k, order, true)
    }

    /// Band-limiting filter: high-pass at `low` cascaded with low-pass at `high`,
    /// both of the given order
    pub fn bandpass(
        low: f64,
        high: f64,
        sample_rate: f64,
        order: usize,
    ) -> Result<Vec<BiquadCoeffs>, String> {
        if low >= high {
            return Err(format!(
                "Low cutoff ({:.2} Hz) must be less than high cutoff ({:.2} Hz)",
                low, high
            ));
        }

        let mut sections = Self::highpass(low, sample_rate, order)?;
        sections.extend(Self::lowpass(high, sample_rate, order)?);
        Ok(sections)
    }

    fn prewarp(cutoff: f64, sample_rate: f64) -> Result<f64, String> {
        let nyquist = sample_rate / 2.0;
        if !(cutoff > 0.0 && cutoff < nyquist) {
            return Err(format!(
                "Cutoff frequency ({:.2} Hz) must lie in (0, {:.2}) Hz",
                cutoff, nyquist
            ));
        }
        Ok((PI * cutoff / sample_rate).tan())
    }

    fn design(k: f64, order: usize, highpass: bool) -> Result<Vec<BiquadCoeffs>, String> {
        if order == 0 {
            return Err("Filter order must be at least 1".to_string());
        }

        let k2 = k * k;
        let mut sections = Vec::with_capacity((order + 1) / 2);

        // Conjugate pole pairs of the analog prototype: s^2 + d*s + 1
        for pair in 0..order / 2 {
            let theta = PI * (2 * pair + 1) as f64 / (2 * order) as f64;
            let d = 2.0 * theta.sin();
            let denom = 1.0 + d * k + k2;

            let (b0, b1, b2) = if highpass {
                (1.0 / denom, -2.0 / denom, 1.0 / denom)
            } else {
                (k2 / denom, 2.0 * k2 / denom, k2 / denom)
            };

            sections.push(BiquadCoeffs {
                b0,
                b1,
                b2,
                a1: 2.0 * (k2 - 1.0) / denom,
                a2: (1.0 - d * k + k2) / denom,
            });
        }

        // Odd orders keep one real pole: s + 1
        if order % 2 == 1 {
            let denom = k + 1.0;
            let (b0, b1) = if highpass {
                (1.0 / denom, -1.0 / denom)
            } else {
                (k / denom, k / denom)
            };
            sections.push(BiquadCoeffs {
                b0,
                b1,
                b2: 0.0,
                a1: (k - 1.0) / denom,
                a2: 0.0,
            });
        }

        if sections.iter().all(BiquadCoeffs::is_finite) {
            Ok(sections)
        } else {
            Err("Filter design produced non-finite coefficients".to_string())
        }
    }
}

/// Band-reject filter for mains interference
pub struct NotchFilter;

impl NotchFilter {
    /// Design a notch at `center_freq`; higher `q_factor` gives a narrower notch
    pub fn design(center_freq: f64, sample_rate: f64, q_factor: f64) -> Result<BiquadCoeffs, String> {
        let nyquist = sample_rate / 2.0;
        if !(center_freq > 0.0 && center_freq < nyquist) {
            return Err(format!(
                "Notch frequency ({:.2} Hz) must lie in (0, {:.2}) Hz",
                center_freq, nyquist
            ));
        }
        if !(q_factor > 0.0) {
            return Err(format!("Notch quality factor must be positive, got {}", q_factor));
        }

        let omega = 2.0 * PI * center_freq / sample_rate;
        let alpha = omega.sin() / (2.0 * q_factor);
        let cos_omega = omega.cos();
        let a0 = 1.0 + alpha;

        Ok(BiquadCoeffs {
            b0: 1.0 / a0,
            b1: -2.0 * cos_omega / a0,
            b2: 1.0 / a0,
            a1: -2.0 * cos_omega / a0,
            a2: (1.0 - alpha) / a0,
        })
    }
}

/// Subtract the mean (constant detrend) in place
pub fn detrend_constant(signal: &mut [f64]) {
    if signal.is_empty() {
        return;
    }
    let mean = signal.iter().sum::<f64>() / signal.len() as f64;
    signal.iter_mut().for_each(|s| *s -= mean);
}

/// Trailing moving average.
///
/// Until the window fills, the average runs over the samples seen so far.
pub fn moving_average(signal: &[f64], window_size: usize) -> Vec<f64> {
    let window = window_size.max(1);
    let mut output = Vec::with_capacity(signal.len());
    let mut sum = 0.0;

    for (idx, &sample) in signal.iter().enumerate() {
        sum += sample;
        if idx >= window {
            sum -= signal[idx - window];
        }
        output.push(sum / (idx + 1).min(window) as f64);
    }

    output
}

/// Full-wave rectification followed by moving-average smoothing
pub fn envelope(signal: &[f64], window_size: usize) -> Vec<f64> {
    let rectified: Vec<f64> = signal.iter().map(|s| s.abs()).collect();
    moving_average(&rectified, window_size)
}
