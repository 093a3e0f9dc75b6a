//! Smoothed estimate of how many packets are buffered.
//!
//! The decision logic compares this filtered level, not the instantaneous
//! one, against the delay manager's watermarks so that a single late packet
//! does not trigger time-stretching.

/// Exponential filter over the buffer level, in Q8 packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferLevelFilter {
    /// Filter factor in Q8.
    level_factor: i32,
    /// Filtered level in Q8 packets.
    filtered_current_level: i32,
}

impl Default for BufferLevelFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferLevelFilter {
    pub fn new() -> Self {
        Self {
            level_factor: 253,
            filtered_current_level: 0,
        }
    }

    pub fn reset(&mut self) {
        self.filtered_current_level = 0;
        self.level_factor = 253;
    }

    /// Feed the current buffer size.
    ///
    /// # Arguments
    /// * `buffer_size_packets` - Buffered packets, including sync buffer audio
    /// * `time_stretched_samples` - Samples added (negative) or removed
    ///   (positive) by the previous time-stretch, 0 if none
    /// * `packet_len_samples` - Nominal packet length
    pub fn update(&mut self, buffer_size_packets: i32, time_stretched_samples: i32, packet_len_samples: i32) {
        // filtered = factor * filtered + (1 - factor) * current, all Q8.
        self.filtered_current_level = ((self.level_factor * self.filtered_current_level) >> 8)
            + (256 - self.level_factor) * buffer_size_packets;

        // The stretch changed the level instantly; the filter would lag it.
        if time_stretched_samples != 0 && packet_len_samples > 0 {
            self.filtered_current_level -= (time_stretched_samples << 8) / packet_len_samples;
            self.filtered_current_level = self.filtered_current_level.max(0);
        }
    }

    /// Pick the filter speed from the base target level in packets. Small
    /// targets adapt faster.
    pub fn set_target_buffer_level(&mut self, target_buffer_level: i32) {
        self.level_factor = match target_buffer_level {
            i32::MIN..=1 => 251,
            2..=3 => 252,
            4..=7 => 253,
            _ => 254,
        };
    }

    /// Filtered level in Q8 packets.
    pub fn filtered_current_level(&self) -> i32 {
        self.filtered_current_level
    }

    pub fn level_factor(&self) -> i32 {
        self.level_factor
    }
}
