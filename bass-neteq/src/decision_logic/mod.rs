//! Per-tick playout decisions.
//!
//! Every 10 ms the engine asks [`DecisionLogic::get_decision`] what to do
//! next: play decoded audio, conceal a missing packet, stretch time to
//! move the buffer level towards its target, or play comfort noise or DTMF.
//! The choice depends on the next buffered packet, the filtered buffer
//! level, and the mode of the previous tick.
//!
//! Two policies exist. The normal one adapts the buffer level; the fax one
//! (used for the fax and off playout modes) never time-stretches.

mod fax;
mod normal;

use std::fmt;

use log::trace;

use crate::buffer_level_filter::BufferLevelFilter;
use crate::config::PlayoutMode;
use crate::delay_manager::DelayManager;
use crate::packet::RtpHeader;

/// Ticks after a time-stretch during which no new stretch is allowed.
const MIN_TIMESCALE_INTERVAL: i32 = 6;
/// Consecutive expands after which the decoder is reset.
const REINIT_AFTER_EXPANDS: usize = 100;

/// What the engine does during one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Normal,
    Merge,
    Expand,
    Accelerate,
    FastAccelerate,
    PreemptiveExpand,
    Rfc3389Cng,
    Rfc3389CngNoPacket,
    CodecInternalCng,
    Dtmf,
    AlternativePlc,
    AlternativePlcIncreaseTimestamp,
    AudioRepetition,
    AudioRepetitionIncreaseTimestamp,
    Undefined,
}

impl Operation {
    pub const ALL: [Operation; 15] = [
        Operation::Normal,
        Operation::Merge,
        Operation::Expand,
        Operation::Accelerate,
        Operation::FastAccelerate,
        Operation::PreemptiveExpand,
        Operation::Rfc3389Cng,
        Operation::Rfc3389CngNoPacket,
        Operation::CodecInternalCng,
        Operation::Dtmf,
        Operation::AlternativePlc,
        Operation::AlternativePlcIncreaseTimestamp,
        Operation::AudioRepetition,
        Operation::AudioRepetitionIncreaseTimestamp,
        Operation::Undefined,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Normal => "normal",
            Operation::Merge => "merge",
            Operation::Expand => "expand",
            Operation::Accelerate => "accelerate",
            Operation::FastAccelerate => "fast_accelerate",
            Operation::PreemptiveExpand => "preemptive_expand",
            Operation::Rfc3389Cng => "rfc3389_cng",
            Operation::Rfc3389CngNoPacket => "rfc3389_cng_no_packet",
            Operation::CodecInternalCng => "codec_internal_cng",
            Operation::Dtmf => "dtmf",
            Operation::AlternativePlc => "alternative_plc",
            Operation::AlternativePlcIncreaseTimestamp => "alternative_plc_increase_timestamp",
            Operation::AudioRepetition => "audio_repetition",
            Operation::AudioRepetitionIncreaseTimestamp => "audio_repetition_increase_timestamp",
            Operation::Undefined => "undefined",
        }
    }

    /// Operations that take packets out of the buffer and decode them.
    pub fn decodes_packets(&self) -> bool {
        !matches!(
            self,
            Operation::AlternativePlc
                | Operation::AlternativePlcIncreaseTimestamp
                | Operation::AudioRepetition
                | Operation::AudioRepetitionIncreaseTimestamp
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the previous tick, as seen by the next decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Expand,
    Merge,
    AccelerateSuccess,
    AccelerateLowEnergy,
    AccelerateFail,
    PreemptiveExpandSuccess,
    PreemptiveExpandLowEnergy,
    PreemptiveExpandFail,
    Rfc3389Cng,
    CodecInternalCng,
    Dtmf,
    Error,
    Undefined,
}

impl Mode {
    /// A time-stretch actually changed the buffer level.
    pub fn is_time_scale(&self) -> bool {
        matches!(
            self,
            Mode::AccelerateSuccess
                | Mode::AccelerateLowEnergy
                | Mode::PreemptiveExpandSuccess
                | Mode::PreemptiveExpandLowEnergy
        )
    }

    pub fn is_cng(&self) -> bool {
        matches!(self, Mode::Rfc3389Cng | Mode::CodecInternalCng)
    }
}

/// Which kind of comfort noise, if any, is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CngState {
    Off,
    Rfc3389On,
    InternalOn,
}

/// Decision policy, selected from the playout mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionVariant {
    Normal,
    Fax,
}

impl From<PlayoutMode> for DecisionVariant {
    fn from(mode: PlayoutMode) -> Self {
        match mode {
            PlayoutMode::On | PlayoutMode::Streaming => DecisionVariant::Normal,
            PlayoutMode::Fax | PlayoutMode::Off => DecisionVariant::Fax,
        }
    }
}

/// Engine state the decision is based on.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    /// Unplayed samples per channel in the sync buffer.
    pub future_length: usize,
    /// Lookahead the concealment keeps in the sync buffer.
    pub overlap_length: usize,
    /// Timestamp just past the end of the sync buffer.
    pub end_timestamp: u32,
    /// Samples per channel of the last decoded frame.
    pub decoder_frame_length: usize,
    /// Header of the next buffered packet.
    pub next_header: Option<&'a RtpHeader>,
    /// The next buffered packet is comfort noise.
    pub next_is_cng: bool,
    /// Packets in the packet buffer.
    pub num_packets: usize,
    /// Estimated samples per channel in the packet buffer.
    pub samples_in_packet_buffer: usize,
    pub prev_mode: Mode,
    /// A DTMF event is due.
    pub play_dtmf: bool,
}

impl DecisionInput<'_> {
    fn samples_left(&self) -> i32 {
        self.future_length as i32 - self.overlap_length as i32
    }
}

/// Result of [`DecisionLogic::get_decision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub operation: Operation,
    /// The decoder has been concealing for too long and should be reset.
    pub reset_decoder: bool,
}

#[derive(Debug, Clone)]
pub struct DecisionLogic {
    playout_mode: PlayoutMode,
    fs_mult: i32,
    output_size_samples: i32,
    cng_state: CngState,
    /// Comfort noise samples played since the last real packet.
    generated_noise_samples: u32,
    packet_length_samples: i32,
    /// Buffered samples when the last time-stretch was decided.
    sample_memory: i32,
    prev_time_scale: bool,
    timescale_hold_off: i32,
    num_consecutive_expands: usize,
    buffer_level_filter: BufferLevelFilter,
}

impl DecisionLogic {
    pub fn new(fs_hz: u32, output_size_samples: usize, playout_mode: PlayoutMode) -> Self {
        let mut logic = Self {
            playout_mode,
            fs_mult: 1,
            output_size_samples: 0,
            cng_state: CngState::Off,
            generated_noise_samples: 0,
            packet_length_samples: 0,
            sample_memory: 0,
            prev_time_scale: false,
            timescale_hold_off: 0,
            num_consecutive_expands: 0,
            buffer_level_filter: BufferLevelFilter::new(),
        };
        logic.set_sample_rate(fs_hz, output_size_samples);
        logic.reset();
        logic
    }

    pub fn reset(&mut self) {
        self.cng_state = CngState::Off;
        self.generated_noise_samples = 0;
        self.packet_length_samples = 0;
        self.sample_memory = 0;
        self.prev_time_scale = false;
        self.timescale_hold_off = 0;
        self.num_consecutive_expands = 0;
    }

    /// Reset after a stream or codec change. CNG state and the expand count
    /// survive; a stretch is held off for a few ticks.
    pub fn soft_reset(&mut self) {
        self.packet_length_samples = 0;
        self.sample_memory = 0;
        self.prev_time_scale = false;
        self.timescale_hold_off = MIN_TIMESCALE_INTERVAL;
    }

    pub fn set_sample_rate(&mut self, fs_hz: u32, output_size_samples: usize) {
        self.fs_mult = (fs_hz / 8000).max(1) as i32;
        self.output_size_samples = output_size_samples as i32;
    }

    pub fn set_playout_mode(&mut self, playout_mode: PlayoutMode) {
        self.playout_mode = playout_mode;
    }

    pub fn playout_mode(&self) -> PlayoutMode {
        self.playout_mode
    }

    pub fn variant(&self) -> DecisionVariant {
        DecisionVariant::from(self.playout_mode)
    }

    /// Choose the operation for this tick.
    ///
    /// Also runs the buffer level filter and advances the delay manager's
    /// counters by one output frame.
    pub fn get_decision(&mut self, input: &DecisionInput<'_>, delay_manager: &mut DelayManager) -> Decision {
        // Expand may be covering for a lost SID, so it counts as noise too.
        if input.prev_mode.is_cng() || input.prev_mode == Mode::Expand {
            self.generated_noise_samples = self
                .generated_noise_samples
                .wrapping_add(self.output_size_samples as u32);
        }
        match input.prev_mode {
            Mode::Rfc3389Cng => self.cng_state = CngState::Rfc3389On,
            Mode::CodecInternalCng => self.cng_state = CngState::InternalOn,
            _ => {}
        }

        let cur_size_samples = input.samples_left() + input.samples_in_packet_buffer as i32;
        self.prev_time_scale = self.prev_time_scale && input.prev_mode.is_time_scale();
        self.filter_buffer_level(cur_size_samples, input.prev_mode, delay_manager);

        let mut reset_decoder = false;
        let operation = match self.variant() {
            DecisionVariant::Normal => self.normal_decision(input, delay_manager, &mut reset_decoder),
            DecisionVariant::Fax => self.fax_decision(input),
        };
        trace!(
            "Decision {} (prev {:?}, filtered level {}, future {})",
            operation,
            input.prev_mode,
            self.buffer_level_filter.filtered_current_level(),
            input.future_length
        );
        Decision {
            operation,
            reset_decoder,
        }
    }

    /// Track consecutive expands.
    pub fn expand_decision(&mut self, operation: Operation) {
        if operation == Operation::Expand {
            self.num_consecutive_expands += 1;
        } else {
            self.num_consecutive_expands = 0;
        }
    }

    fn filter_buffer_level(&mut self, buffer_size_samples: i32, prev_mode: Mode, delay_manager: &mut DelayManager) {
        let elapsed_ms = self.output_size_samples / (8 * self.fs_mult);
        delay_manager.update_counters(elapsed_ms);

        // Comfort noise does not fill the buffer, so its level means nothing.
        if !prev_mode.is_cng() {
            self.buffer_level_filter
                .set_target_buffer_level(delay_manager.base_target_level());

            let buffer_size_packets = if self.packet_length_samples > 0 {
                buffer_size_samples / self.packet_length_samples
            } else {
                0
            };
            let mut time_stretched_samples = 0;
            if self.prev_time_scale {
                time_stretched_samples = self.sample_memory - buffer_size_samples;
                self.timescale_hold_off = MIN_TIMESCALE_INTERVAL;
            }
            self.buffer_level_filter.update(
                buffer_size_packets,
                time_stretched_samples,
                self.packet_length_samples,
            );
            self.prev_time_scale = false;
        }

        self.timescale_hold_off = (self.timescale_hold_off - 1).max(0);
    }

    fn timescale_allowed(&self) -> bool {
        self.timescale_hold_off == 0
    }

    pub fn cng_state(&self) -> CngState {
        self.cng_state
    }

    pub fn cng_off(&self) -> bool {
        self.cng_state == CngState::Off
    }

    pub fn cng_rfc3389_on(&self) -> bool {
        self.cng_state == CngState::Rfc3389On
    }

    pub fn set_cng_off(&mut self) {
        self.cng_state = CngState::Off;
    }

    pub fn generated_noise_samples(&self) -> u32 {
        self.generated_noise_samples
    }

    pub fn set_generated_noise_samples(&mut self, value: u32) {
        self.generated_noise_samples = value;
    }

    pub fn add_generated_noise_samples(&mut self, value: u32) {
        self.generated_noise_samples = self.generated_noise_samples.wrapping_add(value);
    }

    pub fn packet_length_samples(&self) -> i32 {
        self.packet_length_samples
    }

    pub fn set_packet_length_samples(&mut self, value: i32) {
        self.packet_length_samples = value;
    }

    pub fn sample_memory(&self) -> i32 {
        self.sample_memory
    }

    pub fn set_sample_memory(&mut self, value: i32) {
        self.sample_memory = value;
    }

    pub fn add_sample_memory(&mut self, value: i32) {
        self.sample_memory += value;
    }

    pub fn set_prev_time_scale(&mut self, value: bool) {
        self.prev_time_scale = value;
    }

    pub fn num_consecutive_expands(&self) -> usize {
        self.num_consecutive_expands
    }

    pub fn buffer_level_filter(&self) -> &BufferLevelFilter {
        &self.buffer_level_filter
    }

    pub fn reset_buffer_level_filter(&mut self) {
        self.buffer_level_filter.reset();
    }
}
