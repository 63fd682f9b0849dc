use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use cpal::traits::*;
use cpal::{BufferSize, SampleFormat, SupportedBufferSize};
use structopt::StructOpt;
use tracing::{info, warn};

use polysynth::audio;
use polysynth::config::EngineConfig;
use polysynth::engine::Engine;
use polysynth::midi;

#[derive(StructOpt)]
struct PlayOpt {
    #[structopt(long = "config", parse(from_os_str))]
    /// TOML file with engine settings, initial parameters and CC bindings.
    config: Option<PathBuf>,

    #[structopt(short = "k", long = "keyboard")]
    /// The MIDI channel the synthesizer listens on for keyboard events.
    midi_keyboard_channel: Option<u8>,

    #[structopt(short = "c", long = "controller")]
    /// The MIDI channel the synthesizer listens on for controller events.
    midi_controller_channel: Option<u8>,

    #[structopt(short = "p", long = "polyphony")]
    /// Maximum number of simultaneous voices.
    max_polyphony: Option<usize>,

    input_midi_ports: Vec<String>,
}

#[derive(StructOpt)]
#[structopt(about = "Polyphonic MIDI software synthesizer.")]
enum SynthOpt {
    /// List all available MIDI ports.
    ListMidi,

    /// Play the software synth.
    Play(PlayOpt),
}

fn load_config(opt: &PlayOpt) -> Result<EngineConfig> {
    let mut config = match &opt.config {
        Some(path) => EngineConfig::from_toml(path)?,
        None => EngineConfig::default(),
    };

    if opt.midi_keyboard_channel.is_some() {
        config.keyboard_channel = opt.midi_keyboard_channel;
    }
    if opt.midi_controller_channel.is_some() {
        config.controller_channel = opt.midi_controller_channel;
    }
    if let Some(polyphony) = opt.max_polyphony {
        config.max_polyphony = polyphony;
    }

    config.validate()?;
    Ok(config)
}

fn play(opt: PlayOpt) -> Result<()> {
    let mut engine_config = load_config(&opt)?;
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .context("no output device available")?;

    let mut supported_configs_range = device
        .supported_output_configs()
        .context("error while querying configs")?;

    let supported_config = supported_configs_range
        .next()
        .context("no supported output config")?
        .with_max_sample_rate();

    let sample_format = supported_config.sample_format();
    let period = match *supported_config.buffer_size() {
        SupportedBufferSize::Range { min, max } => {
            Some((engine_config.block_size as u32).max(min).min(max))
        }
        SupportedBufferSize::Unknown => None,
    };

    let mut config: cpal::StreamConfig = supported_config.into();
    match period {
        Some(frames) => {
            config.buffer_size = BufferSize::Fixed(frames);
            engine_config.fit_period(frames as usize);
        }
        None => warn!("device does not report its buffer size, using its default"),
    }
    info!(
        "output: {} channels at {} Hz ({:?}), period {:?}, bridge {} samples",
        config.channels,
        config.sample_rate.0,
        sample_format,
        config.buffer_size,
        engine_config.buffer_capacity
    );

    let (engine, consumer) = Engine::start(&engine_config, config.sample_rate.0 as f32)?;
    let _midi_connections = midi::connect_to_ports(opt.input_midi_ports, engine.event_sender())?;

    let _stream = match sample_format {
        SampleFormat::F32 => audio::run::<f32>(&device, &config, consumer),
        SampleFormat::I16 => audio::run::<i16>(&device, &config, consumer),
        SampleFormat::U16 => audio::run::<u16>(&device, &config, consumer),
    }?;

    let mut reported = 0;
    loop {
        thread::sleep(Duration::from_secs(1));
        let underruns = engine.underruns();
        if underruns > reported {
            warn!("{} audio underruns in the last second", underruns - reported);
            reported = underruns;
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let opt = SynthOpt::from_args();

    match opt {
        SynthOpt::ListMidi => {
            println!("Available devices:");
            for device_name in midi::list_devices()? {
                println!("{}", device_name);
            }
        }

        SynthOpt::Play(playopt) => {
            return play(playopt);
        }
    }

    Ok(())
}
