use std::error::Error;
use std::sync::{Mutex, MutexGuard};

use tracing::warn;

pub fn log_if_error<T, E: Error>(msg: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(o) => Some(o),
        Err(e) => {
            warn!("{}: {}", msg, e);
            None
        }
    }
}

/// Locks `mutex`, taking the guard back out of a poisoned lock.
///
/// A panic in the generation thread poisons the voice lock; the state behind
/// it is still usable, so the engine keeps going instead of wedging.
pub fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("recovering poisoned lock");
        poisoned.into_inner()
    })
}

/// Equal-tempered frequency of a MIDI note, A4 (69) = 440 Hz.
pub fn note_to_freq(note: u8) -> f32 {
    440.0 * 2.0f32.powf((note as f32 - 69.0) / 12.0)
}

pub fn cents_to_ratio(cents: f32) -> f32 {
    2.0f32.powf(cents / 1200.0)
}

pub fn semitones_to_ratio(semitones: f32) -> f32 {
    2.0f32.powf(semitones / 12.0)
}

pub trait Mix {
    /// Linear blend, `self` = 0 gives `a`, `self` = 1 gives `b`.
    fn mix(self, a: Self, b: Self) -> Self;
}

impl Mix for f32 {
    fn mix(self, a: f32, b: f32) -> f32 {
        a + (b - a) * self
    }
}
