//! Muscle activation patterns driving the synthetic source

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Activation envelope over time, 0.0 (rest) to 1.0 (maximal contraction)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPattern {
    /// Constant activation level
    Constant { level: f64 },
    /// Sinusoidal contraction
    Sinusoidal {
        frequency: f64,
        amplitude: f64,
        baseline: f64,
    },
    /// On/off cycles, e.g. repeated swallows
    Burst {
        on_duration: f64,
        off_duration: f64,
        amplitude: f64,
    },
    /// Steady activation with physiological tremor
    Realistic {
        base_activation: f64,
        tremor_frequency: f64,
        tremor_amplitude: f64,
    },
}

impl SignalPattern {
    /// Activation level at the given time in seconds
    pub fn activation_at_time(&self, time: f64) -> f64 {
        let level = match *self {
            SignalPattern::Constant { level } => level,

            SignalPattern::Sinusoidal { frequency, amplitude, baseline } => {
                baseline + amplitude * (2.0 * PI * frequency * time).sin()
            }

            SignalPattern::Burst { on_duration, off_duration, amplitude } => {
                let cycle = on_duration + off_duration;
                if cycle <= 0.0 {
                    return 0.0;
                }
                if time.rem_euclid(cycle) < on_duration {
                    amplitude
                } else {
                    0.0
                }
            }

            SignalPattern::Realistic { base_activation, tremor_frequency, tremor_amplitude } => {
                base_activation + tremor_amplitude * (2.0 * PI * tremor_frequency * time).sin()
            }
        };

        level.clamp(0.0, 1.0)
    }

    pub fn description(&self) -> &'static str {
        match self {
            SignalPattern::Constant { .. } => "Constant activation",
            SignalPattern::Sinusoidal { .. } => "Sinusoidal contraction",
            SignalPattern::Burst { .. } => "Burst pattern",
            SignalPattern::Realistic { .. } => "Realistic with tremor",
        }
    }
}

impl Default for SignalPattern {
    fn default() -> Self {
        // roughly one swallow every two seconds
        SignalPattern::Burst {
            on_duration: 0.6,
            off_duration: 1.4,
            amplitude: 0.8,
        }
    }
}
