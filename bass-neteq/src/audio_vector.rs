//! Multi-channel sample block used between the DSP stages.

/// De-interleaved audio, one `Vec` per channel, all of equal length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioMultiVector {
    channels: Vec<Vec<i16>>,
}

impl AudioMultiVector {
    pub fn new(num_channels: usize) -> Self {
        Self::with_len(num_channels, 0)
    }

    /// Create a block of `len` zero samples per channel.
    pub fn with_len(num_channels: usize, len: usize) -> Self {
        Self {
            channels: vec![vec![0; len]; num_channels.max(1)],
        }
    }

    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel.
    pub fn size(&self) -> usize {
        self.channels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&mut self) {
        for ch in &mut self.channels {
            ch.clear();
        }
    }

    /// Replace the content with `len` zeros per channel.
    pub fn zeros(&mut self, len: usize) {
        for ch in &mut self.channels {
            ch.clear();
            ch.resize(len, 0);
        }
    }

    /// Append interleaved samples. A trailing partial frame is ignored.
    pub fn push_back_interleaved(&mut self, interleaved: &[i16]) {
        let n = self.channels.len();
        for frame in interleaved.chunks_exact(n) {
            for (ch, &sample) in self.channels.iter_mut().zip(frame) {
                ch.push(sample);
            }
        }
    }

    /// Append all samples of `other`, which must have the same channel count.
    pub fn push_back(&mut self, other: &AudioMultiVector) {
        debug_assert_eq!(self.channels(), other.channels());
        for (dst, src) in self.channels.iter_mut().zip(&other.channels) {
            dst.extend_from_slice(src);
        }
    }

    /// Remove `len` samples per channel from the front.
    pub fn pop_front(&mut self, len: usize) {
        for ch in &mut self.channels {
            let n = len.min(ch.len());
            ch.drain(..n);
        }
    }

    /// Write the first `len` samples per channel to `out` interleaved.
    /// Returns the number of samples per channel written.
    pub fn read_interleaved(&self, len: usize, out: &mut [i16]) -> usize {
        let n = self.channels.len();
        let len = len.min(self.size()).min(out.len() / n);
        for i in 0..len {
            for (c, ch) in self.channels.iter().enumerate() {
                out[i * n + c] = ch[i];
            }
        }
        len
    }

    pub fn channel(&self, index: usize) -> &[i16] {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut Vec<i16> {
        &mut self.channels[index]
    }

    pub fn iter_channels(&self) -> impl Iterator<Item = &Vec<i16>> {
        self.channels.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleave_round_trip() {
        let mut block = AudioMultiVector::new(2);
        block.push_back_interleaved(&[1, -1, 2, -2, 3, -3, 99]);
        assert_eq!(block.size(), 3);
        assert_eq!(block.channel(0), &[1, 2, 3]);
        assert_eq!(block.channel(1), &[-1, -2, -3]);

        let mut out = [0i16; 4];
        assert_eq!(block.read_interleaved(3, &mut out), 2);
        assert_eq!(out, [1, -1, 2, -2]);
    }

    #[test]
    fn test_pop_front_and_zeros() {
        let mut block = AudioMultiVector::new(1);
        block.push_back_interleaved(&[1, 2, 3, 4]);
        block.pop_front(3);
        assert_eq!(block.channel(0), &[4]);
        block.pop_front(10);
        assert!(block.is_empty());
        block.zeros(5);
        assert_eq!(block.channel(0), &[0; 5]);
    }
}
