//! Bounded single-producer/single-consumer sample FIFO between the block
//! generator and the audio callback.
//!
//! The producer side may wait; the consumer side never does. When the
//! consumer asks for more than is buffered it gets a fade-out of what it last
//! played instead, and the first block after such an underrun is faded back
//! in.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// How long a full producer sleeps before checking for space again.
const BACKOFF: Duration = Duration::from_micros(250);

pub struct StreamProducer {
    inner: HeapProd<f32>,
}

pub struct StreamConsumer {
    inner: HeapCons<f32>,
    /// Tail of the most recent block handed out, replayed on underrun.
    last_block: Vec<f32>,
    crossfade_len: usize,
    fade_in_pending: bool,
    underruns: Arc<AtomicU64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PopOutcome {
    Filled,
    Underrun,
}

/// Creates a bridge holding up to `capacity` samples.
pub fn stream_bridge(capacity: usize, crossfade_len: usize) -> (StreamProducer, StreamConsumer) {
    let (producer, consumer) = HeapRb::<f32>::new(capacity.max(1)).split();

    (
        StreamProducer { inner: producer },
        StreamConsumer {
            inner: consumer,
            last_block: Vec::with_capacity(capacity.max(1)),
            crossfade_len: crossfade_len.max(1),
            fade_in_pending: false,
            underruns: Arc::new(AtomicU64::new(0)),
        },
    )
}

impl StreamProducer {
    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }

    pub fn vacant(&self) -> usize {
        self.inner.vacant_len()
    }

    pub fn available(&self) -> usize {
        self.inner.occupied_len()
    }

    /// Queues all of `samples`, sleeping while the buffer is full.
    ///
    /// Unread samples are never overwritten. The wait gives up once `running`
    /// is cleared; the return value is how many samples were queued.
    pub fn push(&mut self, samples: &[f32], running: &AtomicBool) -> usize {
        let mut written = self.inner.push_slice(samples);
        while written < samples.len() {
            if !running.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(BACKOFF);
            written += self.inner.push_slice(&samples[written..]);
        }
        written
    }
}

impl StreamConsumer {
    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }

    pub fn available(&self) -> usize {
        self.inner.occupied_len()
    }

    /// Shared count of underruns so far, for reporting off the audio thread.
    pub fn underrun_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.underruns)
    }

    /// Fills `out` completely. Never blocks and never allocates as long as
    /// `out` is no longer than the buffer capacity.
    pub fn pop(&mut self, out: &mut [f32]) -> PopOutcome {
        if out.is_empty() {
            return PopOutcome::Filled;
        }

        if self.inner.occupied_len() < out.len() {
            self.fade_out(out);
            self.underruns.fetch_add(1, Ordering::Relaxed);
            return PopOutcome::Underrun;
        }

        let read = self.inner.pop_slice(out);
        debug_assert_eq!(read, out.len());

        if self.fade_in_pending {
            let len = self.crossfade_len.min(out.len());
            for (i, sample) in out[..len].iter_mut().enumerate() {
                *sample *= (i + 1) as f32 / (len + 1) as f32;
            }
            self.fade_in_pending = false;
        }

        self.remember(out);
        PopOutcome::Filled
    }

    /// Plays the last block backwards from its final sample, so the seam with
    /// what was just played stays continuous, under a linear ramp to zero.
    fn fade_out(&mut self, out: &mut [f32]) {
        let len = self.last_block.len();
        let n = out.len();

        if len == 0 {
            out.fill(0.0);
        } else {
            for (i, sample) in out.iter_mut().enumerate() {
                let gain = 1.0 - (i + 1) as f32 / n as f32;
                *sample = self.last_block[mirror_index(i, len)] * gain;
            }
        }

        // The fade ended in silence; a further underrun stays silent.
        self.last_block.clear();
        self.fade_in_pending = true;
    }

    fn remember(&mut self, block: &[f32]) {
        let keep = block.len().min(self.last_block.capacity());
        self.last_block.clear();
        self.last_block.extend_from_slice(&block[block.len() - keep..]);
    }
}

/// Index into a block of `len` samples read backwards from its end and
/// reflected at both ends: len-1, ..., 0, 0, ..., len-1, len-1, ...
fn mirror_index(i: usize, len: usize) -> usize {
    let m = i % (2 * len);
    if m < len {
        len - 1 - m
    } else {
        m - len
    }
}
