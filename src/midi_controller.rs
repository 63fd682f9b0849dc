use std::sync::mpsc;

use crate::config::{CC_ALL_NOTES_OFF, CC_SUSTAIN_PEDAL};
use crate::midi;
use crate::util::*;
use crate::voice_manager::SynthEvent;

/// Turns decoded MIDI into synth events: filters channels and implements the
/// sustain pedal, so the voice manager only ever sees plain note on/off.
#[derive(Clone, Debug)]
pub struct MidiController {
    sustain_pedal: bool,
    pressed: [bool; 128],
    sustained: [bool; 128],
    event_output: mpsc::SyncSender<SynthEvent>,
    keyboard_channel: Option<u8>,
    controller_channel: Option<u8>,
}

fn listens(filter: Option<u8>, channel: u8) -> bool {
    filter.map_or(true, |c| c == channel)
}

impl MidiController {
    /// `None` for a channel means every channel is accepted.
    pub fn new(
        event_output: mpsc::SyncSender<SynthEvent>,
        keyboard_channel: Option<u8>,
        controller_channel: Option<u8>,
    ) -> Self {
        Self {
            sustain_pedal: false,
            pressed: [false; 128],
            sustained: [false; 128],
            event_output,
            keyboard_channel,
            controller_channel,
        }
    }

    fn key_on(&mut self, key: u8, vel: u8) {
        self.send_event(SynthEvent::NoteOn {
            key,
            vel: vel as f32 / 127.0,
        });

        self.pressed[key as usize] = true;
        if self.sustain_pedal {
            self.sustained[key as usize] = true;
        }
    }

    fn key_off(&mut self, key: u8) {
        if self.pressed[key as usize] && !self.sustain_pedal {
            self.send_event(SynthEvent::NoteOff { key });
        }

        self.pressed[key as usize] = false;
    }

    fn pedal_on(&mut self) {
        self.sustain_pedal = true;

        for i in 0..128 {
            self.sustained[i] |= self.pressed[i];
        }
    }

    fn pedal_off(&mut self) {
        self.sustain_pedal = false;

        for i in 0..128 {
            if self.sustained[i] && !self.pressed[i] {
                self.send_event(SynthEvent::NoteOff { key: i as u8 });
            }

            self.sustained[i] = false;
        }
    }

    fn all_notes_off(&mut self) {
        self.pressed = [false; 128];
        self.sustained = [false; 128];
        self.send_event(SynthEvent::AllNotesOff);
    }

    pub fn handle_midi_event(&mut self, event: midi::Event) {
        let on_keyboard = listens(self.keyboard_channel, event.channel);
        let on_controller = listens(self.controller_channel, event.channel);

        match event.content {
            midi::EventContent::NoteOn { key, vel } if key < 128 => {
                if on_keyboard {
                    self.key_on(key, vel);
                }
            }

            midi::EventContent::NoteOff { key, .. } if key < 128 => {
                if on_keyboard {
                    self.key_off(key);
                }
            }

            midi::EventContent::Controller { controller, value } => {
                if on_keyboard && controller == CC_SUSTAIN_PEDAL {
                    if value >= 64 {
                        self.pedal_on()
                    } else {
                        self.pedal_off()
                    }
                } else if on_keyboard && controller == CC_ALL_NOTES_OFF {
                    self.all_notes_off();
                } else if on_controller {
                    self.send_event(SynthEvent::ControlChange {
                        cc: controller,
                        value: value as f32 / 127.0,
                    });
                }
            }

            midi::EventContent::PitchBend { bend } => {
                if on_keyboard {
                    self.send_event(SynthEvent::PitchBend { bend });
                }
            }

            _ => {}
        }
    }

    fn send_event(&mut self, event: SynthEvent) {
        let r = self.event_output.try_send(event);
        log_if_error("synth send_event failed", r);
    }
}
