use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::midi;
use crate::midi_controller::MidiController;
use crate::params::Param;
use crate::ring_buffer::{stream_bridge, StreamConsumer, StreamProducer};
use crate::util::lock_or_recover;
use crate::voice_manager::{SynthEvent, VoiceManager};

const EVENT_QUEUE_LEN: usize = 1024;
const EVENT_POLL: Duration = Duration::from_millis(20);
const PANIC_BACKOFF: Duration = Duration::from_millis(10);

/// Runs event ingestion and block generation on their own threads.
///
/// The audio side only sees the [`StreamConsumer`] returned by
/// [`Engine::start`]; it never touches the voice lock. Dropping the engine
/// stops and joins both threads.
pub struct Engine {
    running: Arc<AtomicBool>,
    voices: Arc<Mutex<VoiceManager>>,
    midi_sender: mpsc::SyncSender<midi::Event>,
    underruns: Arc<AtomicU64>,
    threads: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn start(config: &EngineConfig, sample_rate: f32) -> Result<(Self, StreamConsumer)> {
        config.validate()?;

        let voices = Arc::new(Mutex::new(VoiceManager::from_config(sample_rate, config)?));
        let running = Arc::new(AtomicBool::new(true));
        let (producer, consumer) = stream_bridge(config.buffer_capacity, config.crossfade_len);
        let underruns = consumer.underrun_counter();

        let (midi_sender, midi_queue) = mpsc::sync_channel(EVENT_QUEUE_LEN);
        let (synth_sender, synth_queue) = mpsc::sync_channel(EVENT_QUEUE_LEN);
        let controller = MidiController::new(
            synth_sender,
            config.keyboard_channel,
            config.controller_channel,
        );

        let ingestion = Ingestion {
            running: Arc::clone(&running),
            voices: Arc::clone(&voices),
            midi_queue,
            synth_queue,
            controller,
        };

        let generator = Generator {
            running: Arc::clone(&running),
            voices: Arc::clone(&voices),
            producer,
            block: vec![0.0; config.block_size],
            idle: block_duration(config.block_size, sample_rate) / 4,
        };

        let mut engine = Self {
            running,
            voices,
            midi_sender,
            underruns,
            threads: Vec::with_capacity(2),
        };

        engine.spawn("polysynth-ingest", move || ingestion.run())?;
        engine.spawn("polysynth-generate", move || generator.run())?;

        info!(
            "engine started at {} Hz: block {} samples, buffer {} samples, {} voices",
            sample_rate, config.block_size, config.buffer_capacity, config.max_polyphony
        );

        Ok((engine, consumer))
    }

    fn spawn<F: FnOnce() + Send + 'static>(&mut self, name: &str, f: F) -> Result<()> {
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(f)
            .with_context(|| format!("spawning {} thread", name))?;
        self.threads.push(handle);
        Ok(())
    }

    /// Sender for decoded MIDI input, e.g. for [`midi::connect_to_ports`].
    pub fn event_sender(&self) -> mpsc::SyncSender<midi::Event> {
        self.midi_sender.clone()
    }

    pub fn param(&self, param: Param) -> f32 {
        lock_or_recover(&self.voices).param(param)
    }

    pub fn set_param(&self, param: Param, value: f32) {
        lock_or_recover(&self.voices).set_param(param, value);
    }

    /// Runs `f` with the voice manager locked. Keep it short, generation
    /// waits on the same lock.
    pub fn with_voices<R>(&self, f: impl FnOnce(&mut VoiceManager) -> R) -> R {
        let mut voices = lock_or_recover(&self.voices);
        f(&mut *voices)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stops both threads and waits for them. Safe to call more than once.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);

        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("engine").to_owned();
            if handle.join().is_err() {
                error!("{} thread panicked", name);
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn block_duration(block_size: usize, sample_rate: f32) -> Duration {
    Duration::from_secs_f32(block_size as f32 / sample_rate.max(1.0))
}

struct Ingestion {
    running: Arc<AtomicBool>,
    voices: Arc<Mutex<VoiceManager>>,
    midi_queue: mpsc::Receiver<midi::Event>,
    synth_queue: mpsc::Receiver<SynthEvent>,
    controller: MidiController,
}

impl Ingestion {
    fn run(mut self) {
        while self.running.load(Ordering::Relaxed) {
            match self.midi_queue.recv_timeout(EVENT_POLL) {
                Ok(event) => self.apply(event),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            while let Ok(event) = self.midi_queue.try_recv() {
                self.apply(event);
            }
        }

        debug!("ingestion thread exiting");
    }

    /// A single MIDI event expands to at most 128 synth events (pedal up), so
    /// draining after each one keeps the synth queue from filling up.
    fn apply(&mut self, event: midi::Event) {
        self.controller.handle_midi_event(event);
        let applied = lock_or_recover(&self.voices).pump_events(&self.synth_queue);
        trace!("applied {} synth events", applied);
    }
}

struct Generator {
    running: Arc<AtomicBool>,
    voices: Arc<Mutex<VoiceManager>>,
    producer: StreamProducer,
    block: Vec<f32>,
    idle: Duration,
}

impl Generator {
    fn run(mut self) {
        while self.running.load(Ordering::Relaxed) {
            if self.producer.vacant() < self.block.len() {
                thread::sleep(self.idle);
                continue;
            }

            let voices = &self.voices;
            let block = &mut self.block;
            let rendered = panic::catch_unwind(AssertUnwindSafe(|| {
                lock_or_recover(voices).render_block(block);
            }));

            if rendered.is_err() {
                error!("block generation panicked, retrying");
                thread::sleep(PANIC_BACKOFF);
                continue;
            }

            let written = self.producer.push(&self.block, &self.running);
            if written < self.block.len() {
                warn!(
                    "dropped {} samples while shutting down",
                    self.block.len() - written
                );
            }
        }

        debug!("generation thread exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::{Event, EventContent};
    use std::time::Instant;

    fn small_config() -> EngineConfig {
        EngineConfig {
            block_size: 64,
            buffer_capacity: 256,
            ..EngineConfig::default()
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn midi_reaches_voice_manager() {
        let (engine, _consumer) = Engine::start(&small_config(), 48000.0).unwrap();
        let sender = engine.event_sender();
        sender
            .send(Event::new(0, EventContent::NoteOn { key: 60, vel: 100 }))
            .unwrap();

        assert!(wait_for(|| engine.with_voices(|v| v.live_notes()) == vec![60]));
    }

    #[test]
    fn generator_fills_buffer_and_waits() {
        let (engine, consumer) = Engine::start(&small_config(), 48000.0).unwrap();
        assert!(wait_for(|| consumer.available() == 256));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(consumer.available(), 256);
        assert_eq!(engine.underruns(), 0);
    }

    #[test]
    fn params_are_shared() {
        let (engine, _consumer) = Engine::start(&small_config(), 48000.0).unwrap();
        engine.set_param(Param::FilterCutoff, 800.0);
        assert_eq!(engine.param(Param::FilterCutoff), 800.0);
    }

    #[test]
    fn stop_joins_threads_with_full_buffer() {
        let (mut engine, consumer) = Engine::start(&small_config(), 48000.0).unwrap();
        assert!(wait_for(|| consumer.available() == 256));

        engine.stop();
        assert!(!engine.is_running());
        engine.stop();
    }

    #[test]
    fn note_off_burst_releases_every_voice() {
        let mut manager = VoiceManager::new(48000.0, 16).unwrap();
        manager.set_param(Param::AmpRelease, 0.01);
        let voices = Arc::new(Mutex::new(manager));

        let (midi_sender, midi_queue) = mpsc::sync_channel(8192);
        let (synth_sender, synth_queue) = mpsc::sync_channel(EVENT_QUEUE_LEN);
        let ingestion = Ingestion {
            running: Arc::new(AtomicBool::new(true)),
            voices: Arc::clone(&voices),
            midi_queue,
            synth_queue,
            controller: MidiController::new(synth_sender, None, None),
        };

        let mut note_offs = 0;
        for _ in 0..10 {
            for key in 0..128 {
                let on = EventContent::NoteOn { key, vel: 100 };
                midi_sender.send(Event::new(key % 16, on)).unwrap();
            }
            for key in 0..128 {
                let off = EventContent::NoteOff { key, vel: 0 };
                midi_sender.send(Event::new(key % 16, off)).unwrap();
                note_offs += 1;
            }
        }
        assert!(note_offs > EVENT_QUEUE_LEN);

        // Runs until the queue is drained and the sender is gone.
        drop(midi_sender);
        ingestion.run();

        let mut voices = voices.lock().unwrap();
        assert_eq!(voices.voice_count(), 16);
        assert!(voices
            .live_notes()
            .iter()
            .all(|&note| voices.voice(note).unwrap().is_released()));

        let mut block = vec![0.0; 1024];
        voices.render_block(&mut block);
        assert_eq!(voices.voice_count(), 0);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = EngineConfig {
            block_size: 0,
            ..EngineConfig::default()
        };
        assert!(Engine::start(&config, 48000.0).is_err());
    }
}
