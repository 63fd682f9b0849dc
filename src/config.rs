use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use crate::params::{Param, SynthParams};

/// Master volume, applied to the whole mix.
pub const CC_MASTER_VOLUME: u8 = 7;
pub const CC_SUSTAIN_PEDAL: u8 = 64;
pub const CC_ALL_NOTES_OFF: u8 = 123;

const RESERVED_CCS: [u8; 3] = [CC_MASTER_VOLUME, CC_SUSTAIN_PEDAL, CC_ALL_NOTES_OFF];

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlBinding {
    pub cc: u8,
    pub param: Param,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Samples rendered per generation step.
    pub block_size: usize,
    /// Ring buffer size between the generator and the audio callback.
    pub buffer_capacity: usize,
    /// Length of the fade at edited block seams and after an underrun.
    pub crossfade_len: usize,
    pub max_polyphony: usize,
    /// Pitch bend range in semitones either way.
    pub pitch_bend_range: f32,
    /// Channel carrying notes; `None` listens on all of them.
    pub keyboard_channel: Option<u8>,
    /// Channel carrying parameter controllers; `None` listens on all.
    pub controller_channel: Option<u8>,
    pub params: SynthParams,
    pub controls: Vec<ControlBinding>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 512,
            buffer_capacity: 4096,
            crossfade_len: 64,
            max_polyphony: 16,
            pitch_bend_range: 2.0,
            keyboard_channel: None,
            controller_channel: None,
            params: SynthParams::default(),
            controls: default_controls(),
        }
    }
}

fn default_controls() -> Vec<ControlBinding> {
    [
        (1, Param::LfoAmount),
        (71, Param::FilterResonance),
        (72, Param::AmpRelease),
        (73, Param::AmpAttack),
        (74, Param::FilterCutoff),
        (75, Param::AmpDecay),
    ]
    .iter()
    .map(|&(cc, param)| ControlBinding { cc, param })
    .collect()
}

impl EngineConfig {
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        text.parse::<Self>()
            .with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.block_size > 0, "block_size must be positive");
        ensure!(
            self.buffer_capacity >= 2 * self.block_size,
            "buffer_capacity ({}) must hold at least two blocks of {}",
            self.buffer_capacity,
            self.block_size
        );
        ensure!(
            self.buffer_capacity % self.block_size == 0,
            "buffer_capacity ({}) must be a whole number of blocks of {}",
            self.buffer_capacity,
            self.block_size
        );
        ensure!(self.crossfade_len > 0, "crossfade_len must be positive");
        ensure!(self.max_polyphony > 0, "max_polyphony must be positive");
        ensure!(
            self.pitch_bend_range >= 0.0 && self.pitch_bend_range <= 24.0,
            "pitch_bend_range must be within 0..=24 semitones"
        );

        for channel in [self.keyboard_channel, self.controller_channel]
            .iter()
            .flatten()
        {
            ensure!(*channel < 16, "MIDI channel {} out of range 0..=15", channel);
        }

        for binding in &self.controls {
            ensure!(binding.cc < 128, "controller {} out of range 0..=127", binding.cc);
            ensure!(
                !RESERVED_CCS.contains(&binding.cc),
                "controller {} is reserved and cannot be bound to {}",
                binding.cc,
                binding.param
            );
        }

        Ok(())
    }

    /// Grows `buffer_capacity` so that one device period of `frames` samples
    /// fits in the bridge next to the block being generated. The capacity
    /// stays a whole number of blocks.
    pub fn fit_period(&mut self, frames: usize) {
        let block = self.block_size.max(1);
        let needed = self.buffer_capacity.max(frames + block);
        let blocks = (needed + block - 1) / block;
        self.buffer_capacity = blocks.max(2) * block;
    }
}

impl FromStr for EngineConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut config: EngineConfig = toml::from_str(s)?;
        config.params = config.params.clamped();
        config.validate()?;
        Ok(config)
    }
}

/// Controller number to parameter lookup.
#[derive(Debug, Clone)]
pub struct ControlMap {
    bindings: [Option<Param>; 128],
}

impl ControlMap {
    pub fn empty() -> Self {
        Self {
            bindings: [None; 128],
        }
    }

    pub fn from_bindings(bindings: &[ControlBinding]) -> Self {
        let mut map = Self::empty();
        for binding in bindings {
            map.bind(binding.cc, binding.param);
        }
        map
    }

    /// Out-of-range controller numbers are ignored.
    pub fn bind(&mut self, cc: u8, param: Param) {
        if let Some(slot) = self.bindings.get_mut(cc as usize) {
            *slot = Some(param);
        }
    }

    pub fn get(&self, cc: u8) -> Option<Param> {
        self.bindings.get(cc as usize).copied().flatten()
    }
}

impl Default for ControlMap {
    fn default() -> Self {
        Self::from_bindings(&default_controls())
    }
}
