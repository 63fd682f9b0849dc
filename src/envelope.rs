use serde::Deserialize;

/// Level under which an idle envelope counts as silent.
pub const FINISHED_EPSILON: f32 = 1e-4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EnvelopeState {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Stage times in seconds, sustain as a level in [0, 1].
#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Adsr {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for Adsr {
    fn default() -> Self {
        Self {
            attack: 0.01,
            decay: 0.1,
            sustain: 0.7,
            release: 0.2,
        }
    }
}

impl Adsr {
    pub fn new(attack: f32, decay: f32, sustain: f32, release: f32) -> Self {
        Self {
            attack,
            decay,
            sustain,
            release,
        }
    }
}

/// Linear ADSR state machine.
///
/// Every ramp is computed from the sample position inside its stage rather
/// than by accumulating increments, so stage ends land exactly on 1.0, the
/// sustain level and 0.0. Transitions happen on the sample that completes a
/// stage, which means `state()` is accurate at every block boundary.
#[derive(Clone, Debug)]
pub struct Envelope {
    sample_rate: f32,
    adsr: Adsr,
    state: EnvelopeState,
    position: u32,
    level: f32,
    release_level: f32,
}

impl Envelope {
    pub fn new(sample_rate: f32, adsr: Adsr) -> Self {
        Self {
            sample_rate,
            adsr: Adsr {
                sustain: adsr.sustain.clamp(0.0, 1.0),
                ..adsr
            },
            state: EnvelopeState::Idle,
            position: 0,
            level: 0.0,
            release_level: 0.0,
        }
    }

    pub fn state(&self) -> EnvelopeState {
        self.state
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    /// Samples spent in the current stage.
    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn adsr(&self) -> Adsr {
        self.adsr
    }

    pub fn is_finished(&self) -> bool {
        self.state == EnvelopeState::Idle && self.level < FINISHED_EPSILON
    }

    pub fn trigger_attack(&mut self) {
        self.level = 0.0;
        self.enter(EnvelopeState::Attack);
    }

    /// Starts the release ramp from the current level. Ignored when idle or
    /// already releasing.
    pub fn trigger_release(&mut self) {
        if matches!(self.state, EnvelopeState::Idle | EnvelopeState::Release) {
            return;
        }

        self.release_level = self.level;
        if self.stage_len(self.adsr.release) == 0 {
            self.level = 0.0;
            self.enter(EnvelopeState::Idle);
        } else {
            self.enter(EnvelopeState::Release);
        }
    }

    pub fn render(&mut self, out: &mut [f32]) {
        for sample in out.iter_mut() {
            *sample = self.next_sample();
        }
    }

    pub fn next_sample(&mut self) -> f32 {
        loop {
            match self.state {
                EnvelopeState::Idle => {
                    self.level = 0.0;
                }

                EnvelopeState::Attack => {
                    let len = self.stage_len(self.adsr.attack);
                    if len == 0 {
                        self.level = 1.0;
                        self.enter(EnvelopeState::Decay);
                        continue;
                    }

                    self.position += 1;
                    self.level = self.position as f32 / len as f32;
                    if self.position >= len {
                        self.level = 1.0;
                        self.enter(EnvelopeState::Decay);
                    }
                }

                EnvelopeState::Decay => {
                    let sustain = self.adsr.sustain;
                    let len = self.stage_len(self.adsr.decay);
                    if len == 0 {
                        self.level = sustain;
                        self.enter(EnvelopeState::Sustain);
                        continue;
                    }

                    self.position += 1;
                    let progress = self.position as f32 / len as f32;
                    self.level = 1.0 - progress * (1.0 - sustain);
                    if self.position >= len {
                        self.level = sustain;
                        self.enter(EnvelopeState::Sustain);
                    }
                }

                EnvelopeState::Sustain => {
                    self.level = self.adsr.sustain;
                }

                EnvelopeState::Release => {
                    let len = self.stage_len(self.adsr.release);
                    if len == 0 {
                        self.level = 0.0;
                        self.enter(EnvelopeState::Idle);
                        continue;
                    }

                    self.position += 1;
                    let progress = self.position as f32 / len as f32;
                    self.level = (self.release_level * (1.0 - progress)).max(0.0);
                    if self.position >= len {
                        self.level = 0.0;
                        self.enter(EnvelopeState::Idle);
                    }
                }
            }

            debug_assert!((0.0..=1.0).contains(&self.level));
            return self.level;
        }
    }

    fn enter(&mut self, state: EnvelopeState) {
        self.state = state;
        self.position = 0;
    }

    fn stage_len(&self, seconds: f32) -> u32 {
        (seconds.max(0.0) * self.sample_rate).round() as u32
    }
}
