use crate::envelope::{Envelope, EnvelopeState};
use crate::filter::LadderFilter;
use crate::oscillator::Oscillator;
use crate::params::{SynthParams, FILTER_CUTOFF_MAX, FILTER_ENV_OCTAVES};
use crate::util::note_to_freq;

/// One sounding note: an oscillator shaped by an amplitude envelope, with an
/// optional envelope-swept low-pass.
#[derive(Clone, Debug)]
pub struct Voice {
    note: u8,
    frequency: f32,
    velocity: f32,
    oscillator: Oscillator,
    amp_env: Envelope,
    filter_env: Envelope,
    filter: LadderFilter,
}

impl Voice {
    /// Creates a voice already in its attack stage. Envelope times are taken
    /// from `params` now and stay fixed for the life of the note.
    pub fn new(note: u8, velocity: f32, params: &SynthParams, sample_rate: f32) -> Self {
        let frequency = note_to_freq(note);

        let mut oscillator = Oscillator::new(sample_rate, params.waveform);
        oscillator.set_frequency(frequency);

        let mut amp_env = Envelope::new(sample_rate, params.amp);
        amp_env.trigger_attack();
        let mut filter_env = Envelope::new(sample_rate, params.filter);
        filter_env.trigger_attack();

        Self {
            note,
            frequency,
            velocity: velocity.clamp(0.0, 1.0),
            oscillator,
            amp_env,
            filter_env,
            filter: LadderFilter::new(sample_rate),
        }
    }

    pub fn note(&self) -> u8 {
        self.note
    }

    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    pub fn velocity(&self) -> f32 {
        self.velocity
    }

    pub fn phase(&self) -> f64 {
        self.oscillator.phase()
    }

    pub fn envelope(&self) -> &Envelope {
        &self.amp_env
    }

    pub fn envelope_state(&self) -> EnvelopeState {
        self.amp_env.state()
    }

    pub fn is_released(&self) -> bool {
        matches!(
            self.amp_env.state(),
            EnvelopeState::Release | EnvelopeState::Idle
        )
    }

    pub fn is_finished(&self) -> bool {
        self.amp_env.is_finished()
    }

    pub fn release(&mut self) {
        self.amp_env.trigger_release();
        self.filter_env.trigger_release();
    }

    /// Renders `out.len()` samples of `oscillator * envelope * velocity`.
    ///
    /// `gain` is scratch space of the same length. `pitch_ratio` scales the
    /// note frequency for detune and pitch bend without touching it.
    pub fn render(
        &mut self,
        out: &mut [f32],
        gain: &mut [f32],
        params: &SynthParams,
        pitch_ratio: f32,
    ) {
        debug_assert_eq!(out.len(), gain.len());

        self.oscillator.set_waveform(params.waveform);
        self.oscillator.set_frequency(self.frequency * pitch_ratio);
        self.oscillator.render(out);

        if params.filter_enabled() {
            self.filter.set_resonance(params.filter_resonance);
            let depth = FILTER_ENV_OCTAVES * params.filter_env_amount;
            for sample in out.iter_mut() {
                let sweep = self.filter_env.next_sample();
                let cutoff = params.filter_cutoff * 2.0f32.powf(depth * sweep);
                self.filter.set_cutoff(cutoff.min(FILTER_CUTOFF_MAX));
                *sample = self.filter.process(*sample);
            }
        } else {
            // Keep the filter envelope in step so turning the filter on
            // mid-note picks it up where it should be.
            for _ in 0..out.len() {
                self.filter_env.next_sample();
            }
        }

        self.amp_env.render(gain);
        for (sample, g) in out.iter_mut().zip(gain.iter()) {
            *sample *= g * self.velocity;
        }
    }
}
