use anyhow::{anyhow, Context, Result};
use std::sync::mpsc;

use midir::{MidiInput, MidiInputConnection};
use midly::live::LiveEvent;
use midly::MidiMessage;
use tracing::{debug, info, trace};

use crate::util::log_if_error;

const PITCH_BEND_CENTER: f32 = 8192.0;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum EventContent {
    NoteOff { key: u8, vel: u8 },
    NoteOn { key: u8, vel: u8 },
    Controller { controller: u8, value: u8 },
    /// Bend position normalized to [-1, 1], 0 at rest.
    PitchBend { bend: f32 },
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Event {
    pub timestamp: u64,
    pub channel: u8,
    pub content: EventContent,
}

impl Event {
    pub fn new(channel: u8, content: EventContent) -> Self {
        Self {
            timestamp: 0,
            channel,
            content,
        }
    }
}

/// Decodes one raw channel message.
///
/// Note on with velocity 0 comes out as note off. Anything that is not a note,
/// controller or pitch bend message, or that has a data byte with the high bit
/// set, is dropped.
pub fn decode(timestamp: u64, bytes: &[u8]) -> Option<Event> {
    if bytes.iter().skip(1).any(|b| b & 0x80 != 0) {
        trace!("dropping MIDI message with invalid data byte {:?}", bytes);
        return None;
    }

    let (channel, message) = match LiveEvent::parse(bytes) {
        Ok(LiveEvent::Midi { channel, message }) => (channel, message),
        Ok(_) => return None,
        Err(err) => {
            debug!("could not parse MIDI message {:?}: {}", bytes, err);
            return None;
        }
    };

    let content = match message {
        MidiMessage::NoteOff { key, vel } => EventContent::NoteOff {
            key: key.into(),
            vel: vel.into(),
        },

        MidiMessage::NoteOn { key, vel } if vel.as_int() == 0 => EventContent::NoteOff {
            key: key.into(),
            vel: 0,
        },

        MidiMessage::NoteOn { key, vel } => EventContent::NoteOn {
            key: key.into(),
            vel: vel.into(),
        },

        MidiMessage::Controller { controller, value } => EventContent::Controller {
            controller: controller.into(),
            value: value.into(),
        },

        MidiMessage::PitchBend { bend } => EventContent::PitchBend {
            bend: normalize_bend(bend.0.as_int()),
        },

        _ => return None,
    };

    Some(Event {
        timestamp,
        channel: channel.into(),
        content,
    })
}

/// Maps the 14-bit bend value onto [-1, 1] with 8192 at 0.
fn normalize_bend(raw: u16) -> f32 {
    let offset = raw as f32 - PITCH_BEND_CENTER;
    if offset < 0.0 {
        offset / PITCH_BEND_CENTER
    } else {
        offset / (PITCH_BEND_CENTER - 1.0)
    }
}

pub fn list_devices() -> Result<Vec<String>> {
    let midi_in = MidiInput::new("polysynth port scan")?;
    let names = midi_in
        .ports()
        .iter()
        .filter_map(|p| midi_in.port_name(p).ok())
        .collect();
    Ok(names)
}

pub struct Connection(MidiInputConnection<mpsc::SyncSender<Event>>);

/// Opens every named input port. Decoded events from all of them are sent to
/// `sender`.
pub fn connect_to_ports(
    midi_ports: Vec<String>,
    sender: mpsc::SyncSender<Event>,
) -> Result<Vec<Connection>> {
    midi_ports
        .into_iter()
        .map(|port_name| -> Result<Connection> {
            let midi_in = MidiInput::new(&format!("polysynth to {}", port_name))?;

            let selected_port = midi_in
                .ports()
                .into_iter()
                .find(|p| midi_in.port_name(p).map_or(false, |name| name == port_name))
                .with_context(|| format!("could not find MIDI port {}", port_name))?;

            let conn = midi_in
                .connect(
                    &selected_port,
                    &format!("polysynth conn to {}", port_name),
                    |timestamp, bytes, sender| {
                        if let Some(event) = decode(timestamp, bytes) {
                            log_if_error("failed to queue MIDI event", sender.try_send(event));
                        }
                    },
                    sender.clone(),
                )
                .map_err(|err| anyhow!("connecting to MIDI port {}: {}", port_name, err))?;

            info!("listening on MIDI port {}", port_name);
            Ok(Connection(conn))
        })
        .collect()
}
