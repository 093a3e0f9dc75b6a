//! Adaptive policy for voice and streaming playout.

use crate::delay_manager::DelayManager;
use crate::packet::RtpHeader;
use crate::packet_buffer::is_obsolete_timestamp;

use super::{CngState, DecisionInput, DecisionLogic, Mode, Operation, REINIT_AFTER_EXPANDS};

/// Keep expanding while the next packet is more than this many output
/// frames away.
const MAX_WAIT_FOR_PACKET_FRAMES: i32 = 100;
/// Give up waiting for a future packet after this many expands.
const MAX_EXPANDS_BEFORE_MERGE: usize = 10;

impl DecisionLogic {
    pub(super) fn normal_decision(
        &mut self,
        input: &DecisionInput<'_>,
        delay_manager: &DelayManager,
        reset_decoder: &mut bool,
    ) -> Operation {
        if input.prev_mode == Mode::Error {
            // Undefined with a packet at hand asks the engine to resync.
            return match input.next_header {
                None => Operation::Expand,
                Some(_) => Operation::Undefined,
            };
        }

        let header = match input.next_header {
            Some(header) => header,
            None => return self.no_packet(input.play_dtmf),
        };
        if input.next_is_cng {
            return self.cng_operation(input.prev_mode, input.end_timestamp, header.timestamp, delay_manager);
        }

        if self.num_consecutive_expands > REINIT_AFTER_EXPANDS {
            *reset_decoder = true;
            return Operation::Normal;
        }

        let target_timestamp = input.end_timestamp;
        let available_timestamp = header.timestamp;
        // Five seconds of samples.
        let five_seconds_samples = (5 * 8000 * self.fs_mult) as u32;
        if target_timestamp == available_timestamp {
            self.expected_packet_available(input.prev_mode, input.play_dtmf, delay_manager)
        } else if !is_obsolete_timestamp(available_timestamp, target_timestamp, five_seconds_samples) {
            self.future_packet_available(input, header, delay_manager)
        } else {
            // The packet is older than the playout position; only a new
            // stream or codec gets here.
            Operation::Undefined
        }
    }

    fn cng_operation(
        &mut self,
        prev_mode: Mode,
        target_timestamp: u32,
        available_timestamp: u32,
        delay_manager: &DelayManager,
    ) -> Operation {
        let mut timestamp_diff = self
            .generated_noise_samples
            .wrapping_add(target_timestamp)
            .wrapping_sub(available_timestamp) as i32;
        let optimal_level_samples = (delay_manager.target_level() * self.packet_length_samples) >> 8;
        let excess_waiting_time_samples = -timestamp_diff - optimal_level_samples;

        if excess_waiting_time_samples > optimal_level_samples / 2 {
            // The waiting time for this packet will be longer than 1.5 times
            // the wanted buffer delay. Advance the clock to cut the waiting
            // time down to the optimal.
            self.generated_noise_samples = self
                .generated_noise_samples
                .wrapping_add(excess_waiting_time_samples as u32);
            timestamp_diff += excess_waiting_time_samples;
        }

        if timestamp_diff < 0 && prev_mode == Mode::Rfc3389Cng {
            // Not time to play this packet yet; keep the noise going.
            Operation::Rfc3389CngNoPacket
        } else {
            Operation::Rfc3389Cng
        }
    }

    fn no_packet(&self, play_dtmf: bool) -> Operation {
        match self.cng_state {
            CngState::Rfc3389On => Operation::Rfc3389CngNoPacket,
            CngState::InternalOn => Operation::CodecInternalCng,
            CngState::Off if play_dtmf => Operation::Dtmf,
            CngState::Off => Operation::Expand,
        }
    }

    fn expected_packet_available(&self, prev_mode: Mode, play_dtmf: bool, delay_manager: &DelayManager) -> Operation {
        if prev_mode != Mode::Expand && !play_dtmf {
            let (low_limit, high_limit) = delay_manager.buffer_limits();
            let filtered = self.buffer_level_filter.filtered_current_level();
            if filtered >= high_limit << 2 {
                return Operation::FastAccelerate;
            }
            if filtered >= high_limit && self.timescale_allowed() {
                return Operation::Accelerate;
            }
            if filtered < low_limit && self.timescale_allowed() {
                return Operation::PreemptiveExpand;
            }
        }
        Operation::Normal
    }

    fn future_packet_available(
        &self,
        input: &DecisionInput<'_>,
        header: &RtpHeader,
        delay_manager: &DelayManager,
    ) -> Operation {
        let output_size = self.output_size_samples as i64;
        let timestamp_leap = header.timestamp.wrapping_sub(input.end_timestamp) as i64;
        let target_level = delay_manager.target_level();

        // Keep concealing while the packet is far ahead and the buffer is
        // not over its target.
        if input.prev_mode == Mode::Expand
            && timestamp_leap < output_size * MAX_WAIT_FOR_PACKET_FRAMES as i64
            && self.num_consecutive_expands < MAX_EXPANDS_BEFORE_MERGE
            && timestamp_leap > output_size * self.num_consecutive_expands as i64
            && self.buffer_level_filter.filtered_current_level() <= target_level
        {
            return if input.play_dtmf {
                Operation::Dtmf
            } else {
                Operation::Expand
            };
        }

        let samples_left = input.samples_left() as i64;
        let cur_size_samples = samples_left + input.num_packets as i64 * input.decoder_frame_length as i64;

        if input.prev_mode.is_cng() {
            let timestamp_diff = self
                .generated_noise_samples
                .wrapping_add(input.end_timestamp)
                .wrapping_sub(header.timestamp) as i32;
            let optimal_level = ((target_level * self.packet_length_samples) >> 8) as i64;
            if timestamp_diff >= 0 || cur_size_samples > 4 * optimal_level {
                // Time to play the packet, or the buffer is filling up.
                return Operation::Normal;
            }
            return if input.prev_mode == Mode::CodecInternalCng {
                Operation::CodecInternalCng
            } else {
                Operation::Rfc3389CngNoPacket
            };
        }

        let samples_20_ms = (20 * 8 * self.fs_mult) as i64;
        if input.prev_mode == Mode::Expand
            || ((input.decoder_frame_length as i64) < output_size && cur_size_samples > samples_20_ms)
        {
            Operation::Merge
        } else if input.play_dtmf {
            Operation::Dtmf
        } else {
            Operation::Expand
        }
    }
}
