use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::Deserialize;

use crate::envelope::Adsr;
use crate::oscillator::Waveform;

/// Cutoff at which the per-voice low-pass is switched out entirely.
pub const FILTER_CUTOFF_MAX: f32 = 20_000.0;
pub const FILTER_CUTOFF_MIN: f32 = 20.0;
/// Octaves the filter envelope opens the cutoff by at full amount.
pub const FILTER_ENV_OCTAVES: f32 = 4.0;
pub const MAX_DETUNE_CENTS: f32 = 100.0;
pub const MAX_STAGE_TIME: f32 = 10.0;
pub const MAX_LFO_RATE: f32 = 20.0;

/// Every parameter the control surface can read or write.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Param {
    Waveform,
    Detune,
    FilterCutoff,
    FilterResonance,
    FilterEnvAmount,
    AmpAttack,
    AmpDecay,
    AmpSustain,
    AmpRelease,
    FilterAttack,
    FilterDecay,
    FilterSustain,
    FilterRelease,
    LfoRate,
    LfoAmount,
}

impl Param {
    pub const ALL: [Param; 15] = [
        Param::Waveform,
        Param::Detune,
        Param::FilterCutoff,
        Param::FilterResonance,
        Param::FilterEnvAmount,
        Param::AmpAttack,
        Param::AmpDecay,
        Param::AmpSustain,
        Param::AmpRelease,
        Param::FilterAttack,
        Param::FilterDecay,
        Param::FilterSustain,
        Param::FilterRelease,
        Param::LfoRate,
        Param::LfoAmount,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Param::Waveform => "waveform",
            Param::Detune => "detune",
            Param::FilterCutoff => "filter_cutoff",
            Param::FilterResonance => "filter_resonance",
            Param::FilterEnvAmount => "filter_env_amount",
            Param::AmpAttack => "amp_attack",
            Param::AmpDecay => "amp_decay",
            Param::AmpSustain => "amp_sustain",
            Param::AmpRelease => "amp_release",
            Param::FilterAttack => "filter_attack",
            Param::FilterDecay => "filter_decay",
            Param::FilterSustain => "filter_sustain",
            Param::FilterRelease => "filter_release",
            Param::LfoRate => "lfo_rate",
            Param::LfoAmount => "lfo_amount",
        }
    }

    /// Valid range of the parameter's value.
    pub fn range(self) -> (f32, f32) {
        match self {
            Param::Waveform => (0.0, (Waveform::ALL.len() - 1) as f32),
            Param::Detune => (-MAX_DETUNE_CENTS, MAX_DETUNE_CENTS),
            Param::FilterCutoff => (FILTER_CUTOFF_MIN, FILTER_CUTOFF_MAX),
            Param::AmpAttack
            | Param::AmpDecay
            | Param::AmpRelease
            | Param::FilterAttack
            | Param::FilterDecay
            | Param::FilterRelease => (0.0, MAX_STAGE_TIME),
            Param::LfoRate => (0.0, MAX_LFO_RATE),
            Param::FilterResonance
            | Param::FilterEnvAmount
            | Param::AmpSustain
            | Param::FilterSustain
            | Param::LfoAmount => (0.0, 1.0),
        }
    }

    /// Maps a normalized controller position in [0, 1] onto the parameter.
    pub fn from_normalized(self, value: f32) -> f32 {
        let value = value.clamp(0.0, 1.0);
        let (lo, hi) = self.range();
        match self {
            Param::Waveform => (value * hi).round(),
            Param::FilterCutoff => lo * (hi / lo).powf(value),
            Param::AmpAttack
            | Param::AmpDecay
            | Param::AmpRelease
            | Param::FilterAttack
            | Param::FilterDecay
            | Param::FilterRelease => {
                if value == 0.0 {
                    0.0
                } else {
                    (0.001 * 2.0f32.powf(value * 13.3)).min(hi)
                }
            }
            _ => lo + (hi - lo) * value,
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Param {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.name() == s)
            .ok_or_else(|| anyhow!("unknown parameter {:?}", s))
    }
}

/// The synth's control-surface parameters.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SynthParams {
    pub waveform: Waveform,
    pub detune: f32,
    pub filter_cutoff: f32,
    pub filter_resonance: f32,
    pub filter_env_amount: f32,
    pub amp: Adsr,
    pub filter: Adsr,
    pub lfo_rate: f32,
    pub lfo_amount: f32,
}

impl Default for SynthParams {
    fn default() -> Self {
        Self {
            waveform: Waveform::Sine,
            detune: 0.0,
            filter_cutoff: FILTER_CUTOFF_MAX,
            filter_resonance: 0.0,
            filter_env_amount: 0.0,
            amp: Adsr::default(),
            filter: Adsr::new(0.01, 0.3, 0.0, 0.2),
            lfo_rate: 5.0,
            lfo_amount: 0.0,
        }
    }
}

impl SynthParams {
    pub fn get(&self, param: Param) -> f32 {
        match param {
            Param::Waveform => self.waveform.index() as f32,
            Param::Detune => self.detune,
            Param::FilterCutoff => self.filter_cutoff,
            Param::FilterResonance => self.filter_resonance,
            Param::FilterEnvAmount => self.filter_env_amount,
            Param::AmpAttack => self.amp.attack,
            Param::AmpDecay => self.amp.decay,
            Param::AmpSustain => self.amp.sustain,
            Param::AmpRelease => self.amp.release,
            Param::FilterAttack => self.filter.attack,
            Param::FilterDecay => self.filter.decay,
            Param::FilterSustain => self.filter.sustain,
            Param::FilterRelease => self.filter.release,
            Param::LfoRate => self.lfo_rate,
            Param::LfoAmount => self.lfo_amount,
        }
    }

    /// Sets `param`, clamping `value` into its range. NaN is ignored.
    pub fn set(&mut self, param: Param, value: f32) {
        if value.is_nan() {
            return;
        }

        let (lo, hi) = param.range();
        let value = value.clamp(lo, hi);
        match param {
            Param::Waveform => self.waveform = Waveform::from_index(value.round() as usize),
            Param::Detune => self.detune = value,
            Param::FilterCutoff => self.filter_cutoff = value,
            Param::FilterResonance => self.filter_resonance = value,
            Param::FilterEnvAmount => self.filter_env_amount = value,
            Param::AmpAttack => self.amp.attack = value,
            Param::AmpDecay => self.amp.decay = value,
            Param::AmpSustain => self.amp.sustain = value,
            Param::AmpRelease => self.amp.release = value,
            Param::FilterAttack => self.filter.attack = value,
            Param::FilterDecay => self.filter.decay = value,
            Param::FilterSustain => self.filter.sustain = value,
            Param::FilterRelease => self.filter.release = value,
            Param::LfoRate => self.lfo_rate = value,
            Param::LfoAmount => self.lfo_amount = value,
        }
    }

    /// Re-applies every range clamp, used after deserializing.
    pub fn clamped(&self) -> Self {
        let mut params = self.clone();
        for param in Param::ALL {
            params.set(param, self.get(param));
        }
        params
    }

    pub fn iter(&self) -> impl Iterator<Item = (Param, f32)> + '_ {
        Param::ALL.iter().map(move |&p| (p, self.get(p)))
    }

    pub fn filter_enabled(&self) -> bool {
        self.filter_cutoff < FILTER_CUTOFF_MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for param in Param::ALL {
            assert_eq!(param.name().parse::<Param>().unwrap(), param);
        }
        assert!("volume".parse::<Param>().is_err());
    }

    #[test]
    fn set_then_get_by_name() {
        let mut params = SynthParams::default();
        let cutoff: Param = "filter_cutoff".parse().unwrap();
        params.set(cutoff, 800.0);
        assert_eq!(params.get(cutoff), 800.0);
        assert!(params.filter_enabled());

        params.set(Param::Waveform, 2.0);
        assert_eq!(params.waveform, Waveform::Triangle);
        assert_eq!(params.get(Param::Waveform), 2.0);
    }

    #[test]
    fn values_are_clamped() {
        let mut params = SynthParams::default();
        params.set(Param::AmpSustain, 1.5);
        assert_eq!(params.amp.sustain, 1.0);

        params.set(Param::Detune, -250.0);
        assert_eq!(params.detune, -MAX_DETUNE_CENTS);

        params.set(Param::LfoAmount, f32::NAN);
        assert_eq!(params.lfo_amount, 0.0);
    }

    #[test]
    fn normalized_mapping_covers_range() {
        for param in Param::ALL {
            let (lo, hi) = param.range();
            let bottom = param.from_normalized(0.0);
            let top = param.from_normalized(1.0);
            assert!((bottom - lo).abs() < 1e-3, "{} bottom {}", param, bottom);
            assert!((top - hi).abs() < 1e-2, "{} top {}", param, top);
        }
    }

    #[test]
    fn normalized_times_are_exponential() {
        let quarter = Param::AmpAttack.from_normalized(0.25);
        let half = Param::AmpAttack.from_normalized(0.5);
        assert!(half / quarter > 8.0);
    }

    #[test]
    fn iter_lists_every_param() {
        let params = SynthParams::default();
        let listed: Vec<Param> = params.iter().map(|(p, _)| p).collect();
        assert_eq!(listed, Param::ALL.to_vec());
    }

    #[test]
    fn default_bypasses_filter() {
        assert!(!SynthParams::default().filter_enabled());
    }
}
