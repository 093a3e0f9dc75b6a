//! Fixed-delay policy for fax and off playout modes.
//!
//! Never time-stretches. Missing audio is replaced by repeating the last
//! frame (fax) or by silence (off), and the timestamp is stepped forward
//! while a future packet waits.

use crate::config::PlayoutMode;

use super::{CngState, DecisionInput, DecisionLogic, Operation};

impl DecisionLogic {
    pub(super) fn fax_decision(&mut self, input: &DecisionInput<'_>) -> Operation {
        let target_timestamp = input.end_timestamp;
        let noise_adjusted = self.generated_noise_samples.wrapping_add(target_timestamp);

        let header = match input.next_header {
            Some(header) => header,
            None => return self.fax_concealment(false),
        };
        let due = noise_adjusted.wrapping_sub(header.timestamp) as i32 >= 0;

        if input.next_is_cng {
            return if due {
                Operation::Rfc3389Cng
            } else {
                Operation::Rfc3389CngNoPacket
            };
        }
        if target_timestamp == header.timestamp || due {
            Operation::Normal
        } else {
            self.fax_concealment(true)
        }
    }

    fn fax_concealment(&self, increase_timestamp: bool) -> Operation {
        match self.cng_state {
            CngState::Rfc3389On => Operation::Rfc3389CngNoPacket,
            CngState::InternalOn => Operation::CodecInternalCng,
            CngState::Off => match (self.playout_mode, increase_timestamp) {
                (PlayoutMode::Off, false) => Operation::AlternativePlc,
                (PlayoutMode::Off, true) => Operation::AlternativePlcIncreaseTimestamp,
                (_, false) => Operation::AudioRepetition,
                (_, true) => Operation::AudioRepetitionIncreaseTimestamp,
            },
        }
    }
}
