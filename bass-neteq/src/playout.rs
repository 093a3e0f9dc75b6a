//! Bridge from the engine's 10 ms pull model to an audio callback.
//!
//! A [`PlayoutPump`] runs on a worker thread and keeps a lock-free ring
//! buffer topped up with engine frames. The audio callback drains it through
//! a [`PlayoutReader`] in whatever block size the device asks for, and gets
//! silence if the pump falls behind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};

use crate::engine::{NetEq, OutputType};
use crate::error::Result;

/// Counters shared by the pump and the reader.
#[derive(Debug, Default)]
struct PlayoutStats {
    frames_produced: AtomicU64,
    concealed_frames: AtomicU64,
    underruns: AtomicU64,
}

/// Create a pump/reader pair around a ring buffer of `capacity_samples`
/// interleaved samples.
pub fn playout_channel(neteq: Arc<NetEq>, capacity_samples: usize) -> (PlayoutPump, PlayoutReader) {
    let rb = HeapRb::<i16>::new(capacity_samples.max(1));
    let (producer, consumer) = rb.split();
    let stats = Arc::new(PlayoutStats::default());
    (
        PlayoutPump {
            neteq,
            producer,
            frame: Vec::new(),
            stats: stats.clone(),
        },
        PlayoutReader { consumer, stats },
    )
}

/// Producer side: pulls frames from the engine.
pub struct PlayoutPump {
    neteq: Arc<NetEq>,
    producer: ringbuf::HeapProd<i16>,
    frame: Vec<i16>,
    stats: Arc<PlayoutStats>,
}

impl PlayoutPump {
    /// Pull frames until the ring buffer cannot take another whole frame.
    /// Returns the number of frames pushed.
    pub fn fill(&mut self) -> Result<usize> {
        let mut frames = 0;
        loop {
            let frame_len = self.neteq.output_size_samples() * self.neteq.channels();
            if self.producer.vacant_len() < frame_len {
                break;
            }
            self.frame.resize(frame_len, 0);
            let frame = self.neteq.get_audio(&mut self.frame)?;
            let len = frame.samples_per_channel * frame.channels;
            self.producer.push_slice(&self.frame[..len]);
            if matches!(frame.output_type, OutputType::Plc | OutputType::PlcToCng) {
                self.stats.concealed_frames.fetch_add(1, Ordering::Relaxed);
            }
            self.stats.frames_produced.fetch_add(1, Ordering::Relaxed);
            frames += 1;
        }
        if frames > 0 {
            debug!("Pumped {} frames, {} samples buffered", frames, self.producer.occupied_len());
        }
        Ok(frames)
    }

    /// Samples waiting in the ring buffer.
    pub fn buffered(&self) -> usize {
        self.producer.occupied_len()
    }
}

/// Consumer side: read from the audio callback.
pub struct PlayoutReader {
    consumer: ringbuf::HeapCons<i16>,
    stats: Arc<PlayoutStats>,
}

impl PlayoutReader {
    /// Fill `buffer` with audio, padding with silence if the pump is behind.
    /// Returns the number of real samples read.
    pub fn read(&mut self, buffer: &mut [i16]) -> usize {
        let read = self.consumer.pop_slice(buffer);
        if read < buffer.len() {
            buffer[read..].fill(0);
            let count = self.stats.underruns.fetch_add(1, Ordering::Relaxed) + 1;
            if count == 1 || count % 100 == 0 {
                warn!("Playout underrun ({} so far)", count);
            }
        }
        read
    }

    pub fn available(&self) -> usize {
        self.consumer.occupied_len()
    }

    pub fn underruns(&self) -> u64 {
        self.stats.underruns.load(Ordering::Relaxed)
    }

    pub fn frames_produced(&self) -> u64 {
        self.stats.frames_produced.load(Ordering::Relaxed)
    }

    pub fn concealed_frames(&self) -> u64 {
        self.stats.concealed_frames.load(Ordering::Relaxed)
    }
}
