//! SignalMatrix: time × channel container for sample data

use crate::error::{EmgError, EmgResult};
use serde::{Deserialize, Serialize};

/// Dense sample matrix, rows = time ticks, columns = channels.
///
/// Samples are stored interleaved (row-major):
/// `[t0_ch0, t0_ch1, t1_ch0, t1_ch1, ...]`. On the wire the matrix is a
/// nested array of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f64>>", into = "Vec<Vec<f64>>")]
pub struct SignalMatrix {
    data: Vec<f64>,
    rows: usize,
    channels: usize,
}

impl SignalMatrix {
    /// Create a matrix from interleaved data
    pub fn new(data: Vec<f64>, channels: usize) -> EmgResult<Self> {
        if channels == 0 {
            if !data.is_empty() {
                return Err(EmgError::ShapeMismatch {
                    expected: "at least one channel".to_string(),
                    actual: format!("{} samples with 0 channels", data.len()),
                });
            }
            return Ok(Self::empty(0));
        }

        if data.len() % channels != 0 {
            return Err(EmgError::ShapeMismatch {
                expected: format!("a multiple of {} samples", channels),
                actual: format!("{} samples", data.len()),
            });
        }

        Ok(SignalMatrix {
            rows: data.len() / channels,
            data,
            channels,
        })
    }

    /// Matrix with no rows and a fixed channel count
    pub fn empty(channels: usize) -> Self {
        SignalMatrix {
            data: Vec::new(),
            rows: 0,
            channels,
        }
    }

    /// All-zero matrix
    pub fn zeros(rows: usize, channels: usize) -> Self {
        SignalMatrix {
            data: vec![0.0; rows * channels],
            rows,
            channels,
        }
    }

    /// Build from nested rows (time × channel)
    pub fn from_rows(rows: Vec<Vec<f64>>) -> EmgResult<Self> {
        let channels = rows.first().map(Vec::len).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * channels);

        for (idx, row) in rows.iter().enumerate() {
            if row.len() != channels {
                return Err(EmgError::ShapeMismatch {
                    expected: format!("{} columns", channels),
                    actual: format!("{} columns in row {}", row.len(), idx),
                });
            }
            data.extend_from_slice(row);
        }

        Ok(SignalMatrix {
            rows: rows.len(),
            data,
            channels,
        })
    }

    /// Build from channel-major data (one vector per channel)
    pub fn from_channels(channels: &[Vec<f64>]) -> EmgResult<Self> {
        let rows = channels.first().map(Vec::len).unwrap_or(0);
        if let Some(bad) = channels.iter().position(|ch| ch.len() != rows) {
            return Err(EmgError::ShapeMismatch {
                expected: format!("{} samples per channel", rows),
                actual: format!("{} samples in channel {}", channels[bad].len(), bad),
            });
        }

        let mut data = Vec::with_capacity(rows * channels.len());
        for row in 0..rows {
            for channel in channels {
                data.push(channel[row]);
            }
        }

        Ok(SignalMatrix {
            data,
            rows,
            channels: channels.len(),
        })
    }

    /// Number of time ticks
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of channels
    pub fn channel_count(&self) -> usize {
        self.channels
    }

    /// (rows, channels)
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.channels)
    }

    /// Total number of samples across all channels
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Interleaved sample data
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    /// Sample at (row, channel)
    pub fn get(&self, row: usize, channel: usize) -> Option<f64> {
        if row >= self.rows || channel >= self.channels {
            return None;
        }
        self.data.get(row * self.channels + channel).copied()
    }

    /// One time tick across all channels
    pub fn row(&self, row: usize) -> Option<&[f64]> {
        if row >= self.rows {
            return None;
        }
        let start = row * self.channels;
        Some(&self.data[start..start + self.channels])
    }

    /// Get data for a specific channel
    pub fn channel_data(&self, channel_index: usize) -> EmgResult<Vec<f64>> {
        if channel_index >= self.channels {
            return Err(EmgError::ShapeMismatch {
                expected: format!("channel index below {}", self.channels),
                actual: format!("channel index {}", channel_index),
            });
        }

        Ok(self
            .data
            .iter()
            .skip(channel_index)
            .step_by(self.channels)
            .copied()
            .collect())
    }

    /// All channel data as separate vectors
    pub fn all_channels(&self) -> Vec<Vec<f64>> {
        let mut channels = vec![Vec::with_capacity(self.rows); self.channels];
        for row in self.data.chunks_exact(self.channels.max(1)) {
            for (channel, &sample) in channels.iter_mut().zip(row) {
                channel.push(sample);
            }
        }
        channels
    }

    /// Overwrite one channel in place
    pub fn set_channel(&mut self, channel_index: usize, samples: &[f64]) -> EmgResult<()> {
        if channel_index >= self.channels || samples.len() != self.rows {
            return Err(EmgError::ShapeMismatch {
                expected: format!("{} samples for a channel below {}", self.rows, self.channels),
                actual: format!("{} samples for channel {}", samples.len(), channel_index),
            });
        }

        for (row, &sample) in samples.iter().enumerate() {
            self.data[row * self.channels + channel_index] = sample;
        }
        Ok(())
    }

    /// Append the rows of another matrix with the same channel count
    pub fn append(&mut self, other: &SignalMatrix) -> EmgResult<()> {
        if other.channels != self.channels {
            return Err(EmgError::ShapeMismatch {
                expected: format!("{} channels", self.channels),
                actual: format!("{} channels", other.channels),
            });
        }

        self.data.extend_from_slice(&other.data);
        self.rows += other.rows;
        Ok(())
    }

    /// Keep every `step`-th row starting with row 0; `step < 1` is treated as 1
    pub fn decimate(&self, step: i64) -> SignalMatrix {
        let step = step.max(1) as usize;
        if step == 1 {
            return self.clone();
        }

        let mut data = Vec::with_capacity(self.rows.div_ceil(step) * self.channels);
        for row in (0..self.rows).step_by(step) {
            let start = row * self.channels;
            data.extend_from_slice(&self.data[start..start + self.channels]);
        }

        SignalMatrix {
            rows: self.rows.div_ceil(step),
            data,
            channels: self.channels,
        }
    }

    /// Nested rows, as sent to clients
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.data
            .chunks_exact(self.channels.max(1))
            .map(<[f64]>::to_vec)
            .collect()
    }

    /// True if every sample is a finite number
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

impl TryFrom<Vec<Vec<f64>>> for SignalMatrix {
    type Error = EmgError;

    fn try_from(rows: Vec<Vec<f64>>) -> EmgResult<Self> {
        SignalMatrix::from_rows(rows)
    }
}

impl From<SignalMatrix> for Vec<Vec<f64>> {
    fn from(matrix: SignalMatrix) -> Self {
        matrix.to_rows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(rows: usize, channels: usize) -> SignalMatrix {
        let data = (0..rows * channels).map(|i| i as f64).collect();
        SignalMatrix::new(data, channels).unwrap()
    }

    #[test]
    fn test_multichannel_matrix() {
        // Interleaved data: [ch0_t0, ch1_t0, ch0_t1, ch1_t1, ...]
        let matrix = ramp(1000, 2);

        assert_eq!(matrix.len(), 2000);
        assert_eq!(matrix.rows(), 1000);
        assert_eq!(matrix.channel_count(), 2);

        let ch0 = matrix.channel_data(0).unwrap();
        let ch1 = matrix.channel_data(1).unwrap();
        assert_eq!(ch0.len(), 1000);
        assert_eq!(ch0[0], 0.0);
        assert_eq!(ch1[0], 1.0);
        assert_eq!(ch0[1], 2.0);
        assert_eq!(ch1[1], 3.0);
        assert!(matrix.channel_data(2).is_err());
    }

    #[test]
    fn test_rejects_ragged_data() {
        assert!(SignalMatrix::new(vec![1.0, 2.0, 3.0], 2).is_err());
        assert!(SignalMatrix::from_rows(vec![vec![1.0, 2.0], vec![3.0]]).is_err());
        assert!(SignalMatrix::from_channels(&[vec![1.0, 2.0], vec![3.0]]).is_err());
    }

    #[test]
    fn test_from_channels_transposes() {
        let matrix = SignalMatrix::from_channels(&[vec![1.0, 2.0, 3.0], vec![10.0, 20.0, 30.0]]).unwrap();
        assert_eq!(matrix.shape(), (3, 2));
        assert_eq!(matrix.row(1), Some(&[2.0, 20.0][..]));
        assert_eq!(matrix.all_channels()[1], vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_append_keeps_channel_count() {
        let mut buffer = SignalMatrix::empty(2);
        for _ in 0..5 {
            buffer.append(&ramp(20, 2)).unwrap();
        }
        assert_eq!(buffer.shape(), (100, 2));

        let wrong = ramp(20, 3);
        assert!(buffer.append(&wrong).is_err());
        assert_eq!(buffer.shape(), (100, 2));
    }

    #[test]
    fn test_decimate_selects_every_nth_row() {
        let matrix = ramp(7, 2);
        let decimated = matrix.decimate(3);

        // rows 0, 3, 6
        assert_eq!(decimated.shape(), (3, 2));
        assert_eq!(decimated.row(0), matrix.row(0));
        assert_eq!(decimated.row(1), matrix.row(3));
        assert_eq!(decimated.row(2), matrix.row(6));

        assert_eq!(matrix.decimate(0), matrix);
        assert_eq!(matrix.decimate(-4), matrix);
        assert_eq!(matrix.decimate(100).rows(), 1);
    }

    #[test]
    fn test_set_channel() {
        let mut matrix = SignalMatrix::zeros(3, 2);
        matrix.set_channel(1, &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(matrix.channel_data(1).unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(matrix.channel_data(0).unwrap(), vec![0.0; 3]);
        assert!(matrix.set_channel(1, &[1.0]).is_err());
    }

    #[test]
    fn test_serializes_as_nested_rows() {
        let matrix = SignalMatrix::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let json = serde_json::to_string(&matrix).unwrap();
        assert_eq!(json, "[[1.0,2.0],[3.0,4.0]]");

        let parsed: SignalMatrix = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, matrix);
        assert!(serde_json::from_str::<SignalMatrix>("[[1.0],[2.0,3.0]]").is_err());
    }
}
