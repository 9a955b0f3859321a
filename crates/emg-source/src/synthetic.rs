//! Synthetic EMG board
//!
//! Stands in for acquisition hardware: a background task generates
//! EMG-like samples at the configured rate into a per-channel ring buffer,
//! and `read_latest` copies the newest samples out without consuming them.

use crate::signal_patterns::SignalPattern;
use crate::source::{ChannelId, SignalSource};
use emg_core::{EmgError, EmgResult};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// How often the generator task tops up the ring buffer
const GENERATOR_TICK_MS: u64 = 10;

const MAX_CHANNELS: usize = 16;

/// Configuration for the synthetic board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Sampling rate in Hz
    pub sample_rate: f64,
    /// Number of channels to simulate
    pub channel_count: usize,
    /// Samples kept per channel
    pub buffer_capacity: usize,
    /// Muscle activation pattern
    pub pattern: SignalPattern,
    /// Gaussian noise standard deviation
    pub noise_std: f64,
    /// Slow baseline drift amplitude
    pub baseline_wander: f64,
    /// Constant electrode offset
    pub dc_offset: f64,
    /// Mains interference frequency, if any
    pub powerline_freq: Option<f64>,
    /// Random seed for reproducibility
    pub seed: Option<u64>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            sample_rate: 200.0,
            channel_count: 4,
            buffer_capacity: 45_000,
            pattern: SignalPattern::default(),
            noise_std: 0.05,
            baseline_wander: 0.02,
            dc_offset: 0.5,
            powerline_freq: Some(60.0),
            seed: None,
        }
    }
}

impl SourceSettings {
    pub fn validate(&self) -> EmgResult<()> {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(EmgError::config(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.channel_count == 0 || self.channel_count > MAX_CHANNELS {
            return Err(EmgError::config(format!(
                "channel count must be 1-{}, got {}",
                MAX_CHANNELS, self.channel_count
            )));
        }
        if self.buffer_capacity == 0 {
            return Err(EmgError::config("buffer capacity must be greater than 0"));
        }
        if self.noise_std.is_nan() || self.noise_std < 0.0 {
            return Err(EmgError::config("noise standard deviation must be non-negative"));
        }
        Ok(())
    }
}

/// Sample generator
pub struct EmgSimulator {
    settings: SourceSettings,
    rng: rand::rngs::StdRng,
    normal_dist: Normal<f64>,
    sample_index: u64,
}

impl EmgSimulator {
    pub fn new(settings: SourceSettings) -> EmgResult<Self> {
        settings.validate()?;

        let rng = match settings.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
            None => rand::rngs::StdRng::from_entropy(),
        };
        let normal_dist = Normal::new(0.0, settings.noise_std)
            .map_err(|e| EmgError::config(format!("invalid noise distribution: {}", e)))?;

        Ok(EmgSimulator {
            settings,
            rng,
            normal_dist,
            sample_index: 0,
        })
    }

    /// Next time tick, one value per channel
    pub fn next_frame(&mut self) -> Vec<f64> {
        let time = self.sample_index as f64 / self.settings.sample_rate;
        self.sample_index += 1;

        let activation = self.settings.pattern.activation_at_time(time);
        (0..self.settings.channel_count)
            .map(|channel| self.sample(time, channel, activation))
            .collect()
    }

    fn sample(&mut self, time: f64, channel: usize, activation: f64) -> f64 {
        // Motor unit firing spread over the EMG band, slightly shifted per channel
        let base_frequency = 45.0 + channel as f64 * 7.0;
        let amplitude = activation * 2.0;

        let mut value = amplitude * (2.0 * PI * base_frequency * time).sin();
        value += amplitude * 0.4 * (2.0 * PI * base_frequency * 1.5 * time).sin();
        value += activation * self.rng.gen_range(-0.2..0.2);

        value += self.normal_dist.sample(&mut self.rng);
        value += self.settings.baseline_wander * (2.0 * PI * 0.1 * time).sin();
        value += self.settings.dc_offset;

        if let Some(powerline) = self.settings.powerline_freq {
            value += 0.05 * (2.0 * PI * powerline * time).sin();
        }

        value
    }

    /// Seconds of signal generated so far
    pub fn elapsed(&self) -> f64 {
        self.sample_index as f64 / self.settings.sample_rate
    }
}

struct RingState {
    simulator: EmgSimulator,
    buffers: Vec<VecDeque<f64>>,
    capacity: usize,
    released: bool,
}

impl RingState {
    fn pump(&mut self, samples: usize) {
        for _ in 0..samples {
            let frame = self.simulator.next_frame();
            for (buffer, value) in self.buffers.iter_mut().zip(frame) {
                if buffer.len() == self.capacity {
                    buffer.pop_front();
                }
                buffer.push_back(value);
            }
        }
    }
}

/// Synthetic board backed by a ring buffer
pub struct SyntheticSource {
    settings: SourceSettings,
    state: Arc<Mutex<RingState>>,
    generator: Mutex<Option<JoinHandle<()>>>,
}

impl SyntheticSource {
    pub fn new(settings: SourceSettings) -> EmgResult<Self> {
        let simulator = EmgSimulator::new(settings.clone())?;
        let buffers = vec![VecDeque::with_capacity(settings.buffer_capacity); settings.channel_count];

        Ok(SyntheticSource {
            state: Arc::new(Mutex::new(RingState {
                simulator,
                buffers,
                capacity: settings.buffer_capacity,
                released: false,
            })),
            settings,
            generator: Mutex::new(None),
        })
    }

    /// Start the background generator; must be called inside a tokio runtime
    pub fn start(&self) -> EmgResult<()> {
        if self.state.lock().released {
            return Err(EmgError::source_unavailable("source has been released"));
        }

        let mut generator = self.generator.lock();
        if generator.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EmgError::source_unavailable(format!("no async runtime: {}", e)))?;

        let state = Arc::clone(&self.state);
        let sample_rate = self.settings.sample_rate;
        *generator = Some(runtime.spawn(async move {
            let started = Instant::now();
            let mut produced: u64 = 0;
            let mut ticker = interval(Duration::from_millis(GENERATOR_TICK_MS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let due = (started.elapsed().as_secs_f64() * sample_rate) as u64;
                if due > produced {
                    state.lock().pump((due - produced) as usize);
                    produced = due;
                }
            }
        }));

        info!(
            "Synthetic source started - {} channels at {:.0}Hz",
            self.settings.channel_count, self.settings.sample_rate
        );
        Ok(())
    }

    /// Generate `samples` ticks immediately, independent of the generator task
    pub fn pump(&self, samples: usize) -> EmgResult<()> {
        let mut state = self.state.lock();
        if state.released {
            return Err(EmgError::source_unavailable("source has been released"));
        }
        state.pump(samples);
        Ok(())
    }

    /// Samples currently buffered per channel
    pub fn buffered(&self) -> usize {
        self.state.lock().buffers.first().map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.generator.lock().is_some()
    }

    pub fn settings(&self) -> &SourceSettings {
        &self.settings
    }
}

impl SignalSource for SyntheticSource {
    fn sample_rate(&self) -> f64 {
        self.settings.sample_rate
    }

    fn channels(&self) -> Vec<ChannelId> {
        (1..=self.settings.channel_count).collect()
    }

    fn read_latest(&self, n: usize) -> EmgResult<Vec<Vec<f64>>> {
        let state = self.state.lock();
        if state.released {
            return Err(EmgError::source_unavailable("source has been released"));
        }

        Ok(state
            .buffers
            .iter()
            .map(|buffer| {
                let available = buffer.len().min(n);
                let mut channel = vec![0.0; n - available];
                channel.extend(buffer.range(buffer.len() - available..));
                channel
            })
            .collect())
    }

    fn stop(&self) -> EmgResult<()> {
        if let Some(handle) = self.generator.lock().take() {
            handle.abort();
            debug!(
                "Synthetic source stopped after {:.1}s of signal",
                self.state.lock().simulator.elapsed()
            );
        }
        Ok(())
    }

    fn release(&self) -> EmgResult<()> {
        self.stop()?;
        let mut state = self.state.lock();
        state.released = true;
        state.buffers.iter_mut().for_each(VecDeque::clear);
        info!("Synthetic source released");
        Ok(())
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        if let Some(handle) = self.generator.get_mut().take() {
            handle.abort();
        }
    }
}
