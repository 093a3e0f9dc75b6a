//! Decoded audio waiting to be played out.
//!
//! The buffer has a constant length per channel. Samples before
//! `next_index` have been played and serve as history for concealment;
//! samples from `next_index` to the end are the "future" that the next
//! output frames are read from. Appending at the end pushes the same number
//! of samples out at the front.

use std::collections::VecDeque;

use crate::audio_vector::AudioMultiVector;

#[derive(Debug, Clone)]
pub struct SyncBuffer {
    channels: Vec<VecDeque<i16>>,
    /// Index of the next sample to play.
    next_index: usize,
    /// Timestamp of the sample just after the last one in the buffer.
    end_timestamp: u32,
    /// End of DTMF audio written by a `Dtmf` operation.
    dtmf_index: usize,
}

impl SyncBuffer {
    /// Create a buffer of `length` zero samples per channel, all of them
    /// already played.
    pub fn new(num_channels: usize, length: usize) -> Self {
        Self {
            channels: vec![VecDeque::from(vec![0i16; length]); num_channels.max(1)],
            next_index: length,
            end_timestamp: 0,
            dtmf_index: 0,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel.
    pub fn size(&self) -> usize {
        self.channels[0].len()
    }

    /// Samples per channel not yet played.
    pub fn future_length(&self) -> usize {
        self.size() - self.next_index
    }

    /// Append `block` at the end, dropping as many samples from the front.
    pub fn push_back(&mut self, block: &AudioMultiVector) {
        debug_assert_eq!(block.channels(), self.channels());
        let added = block.size();
        let size = self.size();
        for (dst, src) in self.channels.iter_mut().zip(block.iter_channels()) {
            dst.extend(src.iter().copied());
            let excess = dst.len() - size;
            dst.drain(..excess);
        }
        // Pushing more than the played history drops unplayed audio.
        self.next_index = self.next_index.saturating_sub(added);
        self.dtmf_index = self.dtmf_index.saturating_sub(added);
    }

    /// Insert `length` zeros at the front, dropping samples at the end.
    pub fn push_front_zeros(&mut self, length: usize) {
        self.insert_zeros_at_index(length, 0);
    }

    pub fn insert_zeros_at_index(&mut self, length: usize, position: usize) {
        let size = self.size();
        let position = position.min(size);
        let length = length.min(size - position);
        for ch in &mut self.channels {
            ch.truncate(size - length);
            for _ in 0..length {
                ch.insert(position, 0);
            }
        }
        if self.next_index >= position {
            self.set_next_index(self.next_index + length);
        }
        if self.dtmf_index > 0 && self.dtmf_index >= position {
            self.set_dtmf_index(self.dtmf_index + length);
        }
    }

    /// Overwrite samples starting at `position` with the first `length`
    /// samples of `block`. Writes past the end are dropped.
    pub fn replace_at_index(&mut self, block: &AudioMultiVector, length: usize, position: usize) {
        let size = self.size();
        let position = position.min(size);
        let length = length.min(block.size()).min(size - position);
        for (dst, src) in self.channels.iter_mut().zip(block.iter_channels()) {
            for (i, &sample) in src[..length].iter().enumerate() {
                dst[position + i] = sample;
            }
        }
    }

    /// Read up to `requested` samples per channel of future audio into
    /// `output`, interleaved, and mark them played. Returns the number of
    /// samples per channel read.
    pub fn get_next_audio_interleaved(&mut self, requested: usize, output: &mut [i16]) -> usize {
        let n = self.channels();
        let to_read = requested.min(self.future_length()).min(output.len() / n);
        for i in 0..to_read {
            for (c, ch) in self.channels.iter().enumerate() {
                output[i * n + c] = ch[self.next_index + i];
            }
        }
        self.next_index += to_read;
        to_read
    }

    /// Copy the last `length` samples per channel into `output` interleaved.
    pub fn read_interleaved_from_end(&self, length: usize, output: &mut [i16]) -> usize {
        let n = self.channels();
        let length = length.min(self.size()).min(output.len() / n);
        let start = self.size() - length;
        for i in 0..length {
            for (c, ch) in self.channels.iter().enumerate() {
                output[i * n + c] = ch[start + i];
            }
        }
        length
    }

    /// Last `length` samples of one channel.
    pub fn tail(&self, channel: usize, length: usize) -> Vec<i16> {
        let ch = &self.channels[channel];
        let length = length.min(ch.len());
        ch.range(ch.len() - length..).copied().collect()
    }

    /// Samples of one channel from `start` to the end.
    pub fn channel_from(&self, channel: usize, start: usize) -> Vec<i16> {
        let ch = &self.channels[channel];
        ch.range(start.min(ch.len())..).copied().collect()
    }

    pub fn increase_end_timestamp(&mut self, increment: u32) {
        self.end_timestamp = self.end_timestamp.wrapping_add(increment);
    }

    pub fn end_timestamp(&self) -> u32 {
        self.end_timestamp
    }

    pub fn set_end_timestamp(&mut self, timestamp: u32) {
        self.end_timestamp = timestamp;
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// Clamped to the buffer size.
    pub fn set_next_index(&mut self, value: usize) {
        self.next_index = value.min(self.size());
    }

    pub fn dtmf_index(&self) -> usize {
        self.dtmf_index
    }

    /// Clamped to the buffer size.
    pub fn set_dtmf_index(&mut self, value: usize) {
        self.dtmf_index = value.min(self.size());
    }
}
