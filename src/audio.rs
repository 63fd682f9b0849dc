use anyhow::Result;
use cpal::traits::*;
use tracing::error;

use crate::ring_buffer::StreamConsumer;

/// Builds and starts an output stream fed from `consumer`.
///
/// The callback only pops from the bridge; the mono signal is copied to every
/// device channel. The stream stops when the returned handle is dropped.
pub fn run<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut consumer: StreamConsumer,
) -> Result<cpal::Stream>
where
    T: cpal::Sample,
{
    let channels = (config.channels as usize).max(1);
    let err_fn = |err| error!("an error occurred on stream: {}", err);

    let mut mono = vec![0.0f32; consumer.capacity()];

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            fill_interleaved(data, channels, &mut mono, &mut consumer);
        },
        err_fn,
    )?;
    stream.play()?;

    Ok(stream)
}

/// Fills an interleaved device buffer from the bridge, at most `mono.len()`
/// frames per pop so nothing is allocated when the device asks for more
/// than the bridge holds.
pub fn fill_interleaved<T: cpal::Sample>(
    data: &mut [T],
    channels: usize,
    mono: &mut [f32],
    consumer: &mut StreamConsumer,
) {
    let channels = channels.max(1);
    let chunk_frames = mono.len().max(1);

    for chunk in data.chunks_mut(chunk_frames * channels) {
        let frames = (chunk.len() + channels - 1) / channels;
        let mono = &mut mono[..frames];

        // Underruns are already faded and counted by the bridge.
        let _outcome = consumer.pop(mono);

        for (frame, sample) in chunk.chunks_mut(channels).zip(mono.iter()) {
            let value: T = cpal::Sample::from(sample);
            for out in frame.iter_mut() {
                *out = value;
            }
        }
    }
}
