//! Pseudo-random noise source for concealment and comfort noise.

/// Linear congruential generator producing white noise.
#[derive(Debug, Clone)]
pub struct RandomVector {
    seed: u32,
}

const DEFAULT_SEED: u32 = 777;

impl Default for RandomVector {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomVector {
    pub fn new() -> Self {
        Self { seed: DEFAULT_SEED }
    }

    pub fn reset(&mut self) {
        self.seed = DEFAULT_SEED;
    }

    /// Next sample, uniform in [-1, 1).
    #[inline]
    pub fn next_sample(&mut self) -> f32 {
        self.seed = self.seed.wrapping_mul(69069).wrapping_add(1);
        ((self.seed >> 16) as u16 as i16) as f32 / 32768.0
    }

    /// Fill `out` with noise of the given RMS level.
    pub fn generate(&mut self, rms: f32, out: &mut [f32]) {
        // Uniform noise on [-1, 1) has an RMS of 1/sqrt(3).
        let scale = rms * 3.0f32.sqrt();
        for sample in out.iter_mut() {
            *sample = self.next_sample() * scale;
        }
    }
}
