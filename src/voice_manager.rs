use std::sync::mpsc;

use anyhow::Result;
use slotmap::{DefaultKey, DenseSlotMap, Key};
use tracing::{debug, trace};

use crate::config::{ControlMap, EngineConfig, CC_MASTER_VOLUME};
use crate::filter::HighPass;
use crate::oscillator::{Oscillator, Waveform};
use crate::params::{Param, SynthParams};
use crate::util::{cents_to_ratio, semitones_to_ratio, Mix};
use crate::voice::Voice;

pub const NUM_NOTES: usize = 128;
pub const NUM_CONTROLLERS: usize = 128;
/// Default length of the fade between two blocks rendered from different
/// states.
pub const DEFAULT_CROSSFADE_LEN: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SynthEvent {
    NoteOn { key: u8, vel: f32 },
    NoteOff { key: u8 },
    ControlChange { cc: u8, value: f32 },
    /// Bend position in [-1, 1].
    PitchBend { bend: f32 },
    AllNotesOff,
}

/// Owns every live voice, routes note and control events to them and mixes
/// them into blocks.
///
/// Voices live in a dense slot map for cache-friendly mixing, with a per-note
/// index on the side so there is at most one voice per note.
pub struct VoiceManager {
    sample_rate: f32,
    max_polyphony: usize,
    voices: DenseSlotMap<DefaultKey, Voice>,
    by_note: [DefaultKey; NUM_NOTES],
    control_values: [f32; NUM_CONTROLLERS],
    control_map: ControlMap,
    params: SynthParams,
    pitch_bend: f32,
    pitch_bend_range: f32,
    lfo: Oscillator,
    high_pass: HighPass,
    crossfade_len: usize,
    seam: Option<Seam>,
    voice_buf: Vec<f32>,
    gain_buf: Vec<f32>,
    fade_buf: Vec<f32>,
}

/// Everything that shapes the mix, as it stood at the end of the last block.
///
/// Captured by the first edit after a block. The next block starts on this
/// state and fades over to the edited one, so per-block changes never step.
struct Seam {
    voices: DenseSlotMap<DefaultKey, Voice>,
    params: SynthParams,
    pitch_ratio: f32,
    gain: f32,
}

impl VoiceManager {
    pub fn new(sample_rate: f32, max_polyphony: usize) -> Result<Self> {
        let mut control_values = [0.0; NUM_CONTROLLERS];
        control_values[CC_MASTER_VOLUME as usize] = 1.0;

        Ok(Self {
            sample_rate,
            max_polyphony,
            voices: DenseSlotMap::with_capacity(max_polyphony + 1),
            by_note: [DefaultKey::null(); NUM_NOTES],
            control_values,
            control_map: ControlMap::default(),
            params: SynthParams::default(),
            pitch_bend: 0.0,
            pitch_bend_range: 2.0,
            lfo: Oscillator::new(sample_rate, Waveform::Sine),
            high_pass: HighPass::new(sample_rate)?,
            crossfade_len: DEFAULT_CROSSFADE_LEN,
            seam: None,
            voice_buf: Vec::new(),
            gain_buf: Vec::new(),
            fade_buf: Vec::new(),
        })
    }

    pub fn from_config(sample_rate: f32, config: &EngineConfig) -> Result<Self> {
        let mut manager = Self::new(sample_rate, config.max_polyphony)?;
        manager.params = config.params.clone();
        manager.control_map = ControlMap::from_bindings(&config.controls);
        manager.pitch_bend_range = config.pitch_bend_range;
        manager.crossfade_len = config.crossfade_len;
        Ok(manager)
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn max_polyphony(&self) -> usize {
        self.max_polyphony
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Notes with a live voice, lowest first.
    pub fn live_notes(&self) -> Vec<u8> {
        (0..NUM_NOTES as u8)
            .filter(|&note| self.voice(note).is_some())
            .collect()
    }

    pub fn voice(&self, note: u8) -> Option<&Voice> {
        self.by_note
            .get(note as usize)
            .and_then(|&key| self.voices.get(key))
    }

    pub fn control_value(&self, cc: u8) -> Option<f32> {
        self.control_values.get(cc as usize).copied()
    }

    pub fn params(&self) -> &SynthParams {
        &self.params
    }

    pub fn param(&self, param: Param) -> f32 {
        self.params.get(param)
    }

    /// Takes effect from the next rendered block.
    pub fn set_param(&mut self, param: Param, value: f32) {
        self.mark_seam();
        self.params.set(param, value);
    }

    pub fn set_control_map(&mut self, control_map: ControlMap) {
        self.control_map = control_map;
    }

    pub fn pitch_bend(&self) -> f32 {
        self.pitch_bend
    }

    pub fn handle_event(&mut self, event: SynthEvent) {
        match event {
            SynthEvent::NoteOn { key, vel } => self.note_on(key, vel),
            SynthEvent::NoteOff { key } => self.note_off(key),
            SynthEvent::ControlChange { cc, value } => self.control_change(cc, value),
            SynthEvent::PitchBend { bend } => self.set_pitch_bend(bend),
            SynthEvent::AllNotesOff => self.all_notes_off(),
        }
    }

    /// Applies every queued event; returns how many there were.
    pub fn pump_events(&mut self, queue: &mpsc::Receiver<SynthEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = queue.try_recv() {
            self.handle_event(event);
            count += 1;
        }
        count
    }

    /// Starts a fresh voice on `key`, replacing any voice already there.
    ///
    /// Going over the polyphony limit evicts the voice with the lowest note
    /// number, which may be the one just started.
    pub fn note_on(&mut self, key: u8, vel: f32) {
        if key as usize >= NUM_NOTES {
            debug!("ignoring note on for out-of-range key {}", key);
            return;
        }

        self.mark_seam();
        self.remove_voice(key);
        let voice = Voice::new(key, vel, &self.params, self.sample_rate);
        self.by_note[key as usize] = self.voices.insert(voice);

        if self.voices.len() > self.max_polyphony {
            if let Some(lowest) = (0..NUM_NOTES as u8).find(|&n| self.voice(n).is_some()) {
                debug!("polyphony limit {} reached, evicting note {}", self.max_polyphony, lowest);
                self.remove_voice(lowest);
            }
        }
    }

    pub fn note_off(&mut self, key: u8) {
        let voice_key = match self.by_note.get(key as usize) {
            Some(&k) => k,
            None => {
                debug!("ignoring note off for out-of-range key {}", key);
                return;
            }
        };

        if self.voices.contains_key(voice_key) {
            self.mark_seam();
        }
        if let Some(voice) = self.voices.get_mut(voice_key) {
            voice.release();
        }
    }

    pub fn all_notes_off(&mut self) {
        self.mark_seam();
        for voice in self.voices.values_mut() {
            voice.release();
        }
    }

    /// Stores a normalized controller value and forwards it to the bound
    /// parameter, if any.
    pub fn control_change(&mut self, cc: u8, value: f32) {
        if cc as usize >= NUM_CONTROLLERS || value.is_nan() {
            debug!("ignoring control change {} = {}", cc, value);
            return;
        }

        let value = value.clamp(0.0, 1.0);
        self.mark_seam();
        self.control_values[cc as usize] = value;

        if let Some(param) = self.control_map.get(cc) {
            let mapped = param.from_normalized(value);
            trace!("cc {} -> {} = {}", cc, param, mapped);
            self.params.set(param, mapped);
        }
    }

    pub fn set_pitch_bend(&mut self, bend: f32) {
        if bend.is_nan() {
            return;
        }
        self.mark_seam();
        self.pitch_bend = bend.clamp(-1.0, 1.0);
    }

    /// Mixes every live voice into `out`, then removes finished voices and
    /// runs the shared post-processing: tremolo, high-pass and a hard clip to
    /// [-1, 1].
    ///
    /// If anything was edited since the last block, the first
    /// `crossfade_len` samples blend from the pre-edit state into the new
    /// one.
    pub fn render_block(&mut self, out: &mut [f32]) {
        let len = out.len();
        if self.voice_buf.len() < len {
            self.voice_buf.resize(len, 0.0);
            self.gain_buf.resize(len, 0.0);
        }

        let pitch_ratio = self.pitch_ratio();
        let gain = self.master_gain();
        mix_voices(
            &mut self.voices,
            out,
            &mut self.voice_buf[..len],
            &mut self.gain_buf[..len],
            &self.params,
            pitch_ratio,
            gain,
        );

        if let Some(mut seam) = self.seam.take() {
            let head = self.crossfade_len.min(len);
            if self.fade_buf.len() < head {
                self.fade_buf.resize(head, 0.0);
            }

            let fade = &mut self.fade_buf[..head];
            mix_voices(
                &mut seam.voices,
                fade,
                &mut self.voice_buf[..head],
                &mut self.gain_buf[..head],
                &seam.params,
                seam.pitch_ratio,
                seam.gain,
            );
            crossfade(&mut out[..head], fade);
        }

        let by_note = &mut self.by_note;
        self.voices.retain(|_, voice| {
            if voice.is_finished() {
                by_note[voice.note() as usize] = DefaultKey::null();
                false
            } else {
                true
            }
        });

        // The LFO runs every block so its phase stays continuous.
        let gain_buf = &mut self.gain_buf[..len];
        self.lfo.set_frequency(self.params.lfo_rate);
        self.lfo.render(gain_buf);
        let depth = self.params.lfo_amount;
        if depth > 0.0 {
            for (o, lfo) in out.iter_mut().zip(gain_buf.iter()) {
                *o *= depth.mix(1.0, 0.5 - 0.5 * lfo);
            }
        }

        self.high_pass.process(out);

        for o in out.iter_mut() {
            *o = o.clamp(-1.0, 1.0);
        }
    }

    fn pitch_ratio(&self) -> f32 {
        cents_to_ratio(self.params.detune)
            * semitones_to_ratio(self.pitch_bend * self.pitch_bend_range)
    }

    fn master_gain(&self) -> f32 {
        self.control_values[CC_MASTER_VOLUME as usize]
    }

    /// Snapshots the current state unless this block already has one.
    fn mark_seam(&mut self) {
        if self.seam.is_none() {
            self.seam = Some(Seam {
                voices: self.voices.clone(),
                params: self.params.clone(),
                pitch_ratio: self.pitch_ratio(),
                gain: self.master_gain(),
            });
        }
    }

    fn remove_voice(&mut self, key: u8) -> Option<Voice> {
        let slot = self.by_note.get_mut(key as usize)?;
        let voice_key = std::mem::replace(slot, DefaultKey::null());
        self.voices.remove(voice_key)
    }
}

fn mix_voices(
    voices: &mut DenseSlotMap<DefaultKey, Voice>,
    out: &mut [f32],
    voice_buf: &mut [f32],
    gain_buf: &mut [f32],
    params: &SynthParams,
    pitch_ratio: f32,
    gain: f32,
) {
    out.fill(0.0);
    for voice in voices.values_mut() {
        voice.render(voice_buf, gain_buf, params, pitch_ratio);
        for (o, v) in out.iter_mut().zip(voice_buf.iter()) {
            *o += v * gain;
        }
    }
}

/// Linear blend from `from` into `out` over the length of `from`.
fn crossfade(out: &mut [f32], from: &[f32]) {
    let steps = (from.len() + 1) as f32;
    for (i, (o, f)) in out.iter_mut().zip(from.iter()).enumerate() {
        let t = (i + 1) as f32 / steps;
        *o = t.mix(*f, *o);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Adsr, EnvelopeState};

    const SAMPLE_RATE: f32 = 44_100.0;

    fn manager(max_polyphony: usize) -> VoiceManager {
        VoiceManager::new(SAMPLE_RATE, max_polyphony).unwrap()
    }

    fn render(vm: &mut VoiceManager, samples: usize) -> Vec<f32> {
        let mut out = vec![0.0; samples];
        vm.render_block(&mut out);
        out
    }

    #[test]
    fn evicts_lowest_note() {
        let mut vm = manager(2);
        vm.note_on(60, 1.0);
        vm.note_on(64, 1.0);
        vm.note_on(67, 1.0);
        assert_eq!(vm.live_notes(), vec![64, 67]);
        assert_eq!(vm.voice_count(), 2);
    }

    #[test]
    fn eviction_can_drop_the_new_note() {
        let mut vm = manager(2);
        vm.note_on(67, 1.0);
        vm.note_on(64, 1.0);
        vm.note_on(60, 1.0);
        assert_eq!(vm.live_notes(), vec![64, 67]);
    }

    #[test]
    fn polyphony_bound_holds_under_load() {
        let mut vm = manager(16);
        for note in (0..128u8).rev().chain(0..128) {
            vm.note_on(note, 0.5);
            assert!(vm.voice_count() <= 16);
        }
        assert_eq!(vm.voice_count(), 16);
    }

    #[test]
    fn retrigger_replaces_voice() {
        let mut vm = manager(4);
        vm.note_on(60, 1.0);
        render(&mut vm, 2000);
        vm.note_off(60);
        assert_eq!(vm.voice(60).unwrap().envelope_state(), EnvelopeState::Release);

        vm.note_on(60, 0.3);
        let voice = vm.voice(60).unwrap();
        assert_eq!(vm.voice_count(), 1);
        assert_eq!(voice.envelope_state(), EnvelopeState::Attack);
        assert_eq!(voice.envelope().level(), 0.0);
        assert_eq!(voice.velocity(), 0.3);
    }

    #[test]
    fn note_off_for_unknown_note_is_noop() {
        let mut vm = manager(4);
        vm.note_on(60, 1.0);
        vm.note_off(61);
        vm.note_off(200);
        assert_eq!(vm.voice(60).unwrap().envelope_state(), EnvelopeState::Attack);
    }

    #[test]
    fn out_of_range_events_are_ignored() {
        let mut vm = manager(4);
        vm.note_on(128, 1.0);
        vm.control_change(128, 1.0);
        vm.control_change(1, f32::NAN);
        assert_eq!(vm.voice_count(), 0);
        assert_eq!(vm.control_value(1), Some(0.0));
    }

    #[test]
    fn finished_voices_are_removed() {
        let mut vm = manager(4);
        vm.set_param(Param::AmpRelease, 0.01);
        vm.note_on(60, 1.0);
        render(&mut vm, 1000);
        vm.note_off(60);

        render(&mut vm, 440);
        assert_eq!(vm.live_notes(), vec![60]);
        render(&mut vm, 1);
        assert!(vm.live_notes().is_empty());
        assert!(vm.voice(60).is_none());
    }

    #[test]
    fn note_on_then_off_end_to_end() {
        let mut vm = manager(16);
        vm.set_param(Param::AmpAttack, 0.01);
        vm.set_param(Param::AmpDecay, 0.05);
        vm.set_param(Param::AmpSustain, 0.8);
        vm.set_param(Param::AmpRelease, 0.1);

        vm.note_on(60, 100.0 / 127.0);
        assert_eq!(vm.voice(60).unwrap().envelope_state(), EnvelopeState::Attack);

        let first = render(&mut vm, 4410);
        assert!(first.iter().any(|s| *s != 0.0));
        let voice = vm.voice(60).unwrap();
        assert_eq!(voice.envelope_state(), EnvelopeState::Sustain);
        assert_eq!(voice.envelope().level(), 0.8);

        vm.handle_event(SynthEvent::NoteOff { key: 60 });
        let voice = vm.voice(60).unwrap();
        assert_eq!(voice.envelope_state(), EnvelopeState::Release);
        assert_eq!(voice.envelope().position(), 0);

        render(&mut vm, 4409);
        assert!(!vm.voice(60).unwrap().is_finished());
        render(&mut vm, 1);
        assert!(vm.voice(60).is_none());
    }

    #[test]
    fn rendering_is_deterministic() {
        let run = || {
            let mut vm = manager(8);
            vm.set_param(Param::Waveform, 1.0);
            vm.set_param(Param::FilterCutoff, 2000.0);
            vm.set_param(Param::FilterEnvAmount, 0.5);
            vm.set_param(Param::LfoAmount, 0.3);
            let mut blocks = Vec::new();
            for (i, note) in [48u8, 55, 60, 64, 67].iter().enumerate() {
                vm.note_on(*note, 0.2 * (i + 1) as f32);
                blocks.extend(render(&mut vm, 300));
            }
            vm.set_pitch_bend(0.5);
            vm.note_off(55);
            blocks.extend(render(&mut vm, 5000));
            blocks
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn output_is_clipped() {
        let mut vm = manager(16);
        vm.set_param(Param::Waveform, 3.0);
        vm.params.amp = Adsr::new(0.0, 0.0, 1.0, 0.1);
        for note in 40..56 {
            vm.note_on(note, 1.0);
        }

        for _ in 0..20 {
            let block = render(&mut vm, 512);
            assert!(block.iter().all(|s| (-1.0..=1.0).contains(s)));
        }
        assert!(render(&mut vm, 512).iter().any(|s| s.abs() == 1.0));
    }

    #[test]
    fn master_volume_scales_mix() {
        let mut loud = manager(4);
        let mut quiet = manager(4);
        quiet.control_change(CC_MASTER_VOLUME, 0.5);
        assert_eq!(quiet.control_value(CC_MASTER_VOLUME), Some(0.5));

        loud.note_on(69, 0.5);
        quiet.note_on(69, 0.5);
        let a = render(&mut loud, 2048);
        let b = render(&mut quiet, 2048);
        for (x, y) in a.iter().zip(&b) {
            assert!((x * 0.5 - y).abs() < 1e-6);
        }

        quiet.control_change(CC_MASTER_VOLUME, 0.0);
        let muted = render(&mut quiet, 8820);
        assert!(muted[0].abs() > 0.0);
        assert!(render(&mut quiet, 256).iter().all(|s| s.abs() < 1e-4));
    }

    fn max_step(samples: &[f32]) -> f32 {
        samples
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn parameter_change_fades_across_block_seam() {
        let mut vm = manager(4);
        vm.set_param(Param::FilterCutoff, 150.0);
        vm.note_on(45, 1.0);
        let before = render(&mut vm, 4410);

        vm.set_param(Param::FilterCutoff, 20_000.0);
        let after = render(&mut vm, 4410);

        let mut seam = vec![before[4409]];
        seam.extend_from_slice(&after[..128]);
        assert!(max_step(&seam) < 0.05, "seam step {}", max_step(&seam));
    }

    #[test]
    fn waveform_switch_fades_across_block_seam() {
        let mut vm = manager(4);
        vm.set_param(Param::Waveform, 0.0);
        vm.note_on(57, 1.0);
        let before = render(&mut vm, 4410);

        vm.set_param(Param::Waveform, 2.0);
        let after = render(&mut vm, 512);

        let mut seam = vec![before[4409]];
        seam.extend_from_slice(&after[..DEFAULT_CROSSFADE_LEN]);
        assert!(max_step(&seam) < 0.1, "seam step {}", max_step(&seam));
    }

    #[test]
    fn untouched_seams_are_seamless() {
        let setup = || {
            let mut vm = manager(4);
            vm.set_param(Param::Waveform, 1.0);
            vm.set_param(Param::FilterCutoff, 900.0);
            vm.note_on(60, 0.8);
            vm.note_on(67, 0.6);
            vm
        };

        let mut whole = setup();
        let a = render(&mut whole, 2048);

        let mut split = setup();
        let mut b = render(&mut split, 1024);
        b.extend(render(&mut split, 1024));

        assert_eq!(a, b);
    }

    #[test]
    fn retrigger_fades_out_replaced_voice() {
        let mut vm = manager(4);
        vm.params.amp = Adsr::new(0.0, 0.0, 1.0, 0.1);
        vm.set_param(Param::Waveform, 3.0);
        vm.note_on(60, 1.0);
        let before = render(&mut vm, 1000);
        assert!(before[999].abs() > 0.5);

        vm.params.amp = Adsr::new(0.5, 0.0, 1.0, 0.1);
        vm.note_on(60, 1.0);
        let after = render(&mut vm, 256);
        assert!((after[0] - before[999]).abs() < 0.05);
    }

    #[test]
    fn bound_controllers_set_params() {
        let mut vm = manager(4);
        vm.control_change(74, 0.0);
        assert_eq!(vm.param(Param::FilterCutoff), 20.0);
        vm.control_change(74, 1.0);
        assert_eq!(vm.param(Param::FilterCutoff), 20_000.0);

        let mut map = ControlMap::empty();
        map.bind(20, Param::Waveform);
        vm.set_control_map(map);
        vm.control_change(20, 1.0);
        assert_eq!(vm.params().waveform, Waveform::Pulse);
        assert_eq!(vm.control_value(20), Some(1.0));
    }

    #[test]
    fn params_apply_to_next_block_only() {
        let mut vm = manager(4);
        vm.note_on(60, 1.0);
        vm.set_param(Param::AmpAttack, 5.0);
        assert_eq!(vm.voice(60).unwrap().envelope().adsr().attack, 0.01);

        vm.note_on(62, 1.0);
        assert_eq!(vm.voice(62).unwrap().envelope().adsr().attack, 5.0);
    }

    #[test]
    fn pitch_bend_moves_oscillator_not_note() {
        let mut vm = manager(4);
        vm.handle_event(SynthEvent::PitchBend { bend: 1.0 });
        vm.note_on(69, 1.0);
        render(&mut vm, 100);

        let voice = vm.voice(69).unwrap();
        assert_eq!(voice.frequency(), 440.0);
        let bent = 440.0 * 2.0f64.powf(2.0 / 12.0);
        let expected = (bent * 100.0 / SAMPLE_RATE as f64).fract() * std::f64::consts::TAU;
        assert!((voice.phase() - expected).abs() < 1e-3);
    }

    #[test]
    fn all_notes_off_releases_everything() {
        let mut vm = manager(4);
        vm.note_on(60, 1.0);
        vm.note_on(64, 1.0);

        let (tx, rx) = mpsc::channel();
        tx.send(SynthEvent::AllNotesOff).unwrap();
        assert_eq!(vm.pump_events(&rx), 1);

        for note in vm.live_notes() {
            assert!(vm.voice(note).unwrap().is_released());
        }
    }

    #[test]
    fn silence_without_voices() {
        let mut vm = manager(4);
        assert!(render(&mut vm, 1024).iter().all(|s| *s == 0.0));
    }
}
