//! Real-time polyphonic MIDI software synthesizer.
//!
//! [`engine::Engine`] runs MIDI ingestion and block generation on their own
//! threads and hands samples to the audio callback through a lock-free
//! [`ring_buffer`].

pub mod audio;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod filter;
pub mod midi;
pub mod midi_controller;
pub mod oscillator;
pub mod params;
pub mod ring_buffer;
pub mod util;
pub mod voice;
pub mod voice_manager;
