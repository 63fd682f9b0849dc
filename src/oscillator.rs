use std::f64::consts::TAU;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Waveform {
    Sine,
    Sawtooth,
    Triangle,
    Pulse,
}

impl Default for Waveform {
    fn default() -> Self {
        Waveform::Sine
    }
}

impl Waveform {
    pub const ALL: [Waveform; 4] = [
        Waveform::Sine,
        Waveform::Sawtooth,
        Waveform::Triangle,
        Waveform::Pulse,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Out-of-range indices saturate to the last shape.
    pub fn from_index(index: usize) -> Self {
        Self::ALL[index.min(Self::ALL.len() - 1)]
    }

    pub fn name(self) -> &'static str {
        match self {
            Waveform::Sine => "sine",
            Waveform::Sawtooth => "sawtooth",
            Waveform::Triangle => "triangle",
            Waveform::Pulse => "pulse",
        }
    }

    /// Value of the waveform at `phase` radians, `phase` in [0, 2π).
    #[inline]
    pub fn sample(self, phase: f64) -> f32 {
        let saw = 2.0 * (phase / TAU + 0.5).fract() - 1.0;
        let value = match self {
            Waveform::Sine => phase.sin(),
            Waveform::Sawtooth => saw,
            Waveform::Triangle => 2.0 * saw.abs() - 1.0,
            Waveform::Pulse => {
                if phase < TAU / 2.0 {
                    1.0
                } else {
                    -1.0
                }
            }
        };
        value as f32
    }
}

impl fmt::Display for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Waveform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|w| w.name() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown waveform {:?}", s))
    }
}

/// Phase-accumulator oscillator.
///
/// The phase is carried across `render` calls, so rendering a block in one
/// call or in several consecutive calls yields the same samples.
#[derive(Clone, Debug)]
pub struct Oscillator {
    sample_rate: f32,
    frequency: f32,
    waveform: Waveform,
    phase: f64,
}

impl Oscillator {
    pub fn new(sample_rate: f32, waveform: Waveform) -> Self {
        Self {
            sample_rate,
            frequency: 440.0,
            waveform,
            phase: 0.0,
        }
    }

    pub fn set_frequency(&mut self, frequency: f32) {
        self.frequency = frequency;
    }

    pub fn set_waveform(&mut self, waveform: Waveform) {
        self.waveform = waveform;
    }

    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    pub fn waveform(&self) -> Waveform {
        self.waveform
    }

    /// Current phase in radians, always in [0, 2π).
    pub fn phase(&self) -> f64 {
        self.phase
    }

    pub fn render(&mut self, out: &mut [f32]) {
        let increment = TAU * self.frequency as f64 / self.sample_rate as f64;
        for sample in out.iter_mut() {
            *sample = self.waveform.sample(self.phase);
            self.phase = (self.phase + increment).rem_euclid(TAU);
        }
    }
}
