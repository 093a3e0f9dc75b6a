//! Target buffer level estimation from packet inter-arrival statistics.
//!
//! Inter-arrival times (IATs) are measured in whole packets and collected in
//! a forgetting histogram. The target level is the smallest IAT whose tail
//! probability is below a limit, raised in peak mode and in streaming mode,
//! and finally clamped by the configured delay bounds and buffer capacity.
//!
//! Fixed-point formats:
//! - histogram buckets: Q30 probabilities summing to 1
//! - forgetting factor: Q15
//! - target level and buffer limits: Q8 packets

use log::{debug, warn};

use crate::codec::PayloadKind;
use crate::delay_peak_detector::DelayPeakDetector;
use crate::error::{NetEqError, Result};
use crate::packet::{is_newer_sequence_number, is_newer_timestamp, sequence_diff};

/// Largest trackable inter-arrival time in packets.
pub const MAX_IAT: usize = 64;
/// Steady-state forgetting factor, 0.9993 in Q15.
const IAT_FACTOR: i32 = 32745;
/// Tail probability limit, 1/20 in Q30.
const LIMIT_PROBABILITY: i32 = 53_687_091;
/// Tail probability limit in streaming mode, 1/2000 in Q30.
const LIMIT_PROBABILITY_STREAMING: i32 = 536_871;
/// Drift subtracted from the cumulative IAT sum per packet, Q8.
const CUMULATIVE_SUM_DRIFT: i32 = 2;
/// After this long without a new maximum the streaming maximum decays.
const MAX_STREAMING_PEAK_PERIOD_MS: i32 = 600_000;
/// Base target level after a reset, in packets.
const DEFAULT_BASE_TARGET_LEVEL: i32 = 4;

/// What the most recent packet carried, for IAT bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastPacketKind {
    /// Comfort noise or DTMF; IAT measurement is paused.
    CngOrDtmf,
    /// First speech packet after CNG/DTMF; restarts the IAT clock.
    SpeechAfterCngOrDtmf,
    Speech,
}

/// Delay manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayManager {
    /// IAT probabilities in Q30, one bucket per packet count.
    iat_vector: Vec<i32>,
    /// Forgetting factor in Q15.
    iat_factor: i32,
    /// Time since the last packet in ms.
    packet_iat_count_ms: i32,
    base_target_level: i32,
    /// Target level in Q8 packets.
    target_level: i32,
    packet_len_ms: i32,
    streaming_mode: bool,
    first_packet_received: bool,
    last_seq_no: u16,
    last_timestamp: u32,
    minimum_delay_ms: i32,
    least_required_delay_ms: i32,
    /// 0 means no maximum.
    maximum_delay_ms: i32,
    max_packets_in_buffer: usize,
    iat_cumulative_sum: i32,
    max_iat_cumulative_sum: i32,
    max_timer_ms: i32,
    last_packet_kind: LastPacketKind,
    peak_detector: DelayPeakDetector,
}

impl DelayManager {
    /// Create a delay manager for a packet buffer holding
    /// `max_packets_in_buffer` packets.
    pub fn new(max_packets_in_buffer: usize) -> Self {
        let mut manager = Self {
            iat_vector: vec![0; MAX_IAT + 1],
            iat_factor: 0,
            packet_iat_count_ms: 0,
            base_target_level: DEFAULT_BASE_TARGET_LEVEL,
            target_level: DEFAULT_BASE_TARGET_LEVEL << 8,
            packet_len_ms: 0,
            streaming_mode: false,
            first_packet_received: false,
            last_seq_no: 0,
            last_timestamp: 0,
            minimum_delay_ms: 0,
            least_required_delay_ms: 0,
            maximum_delay_ms: 0,
            max_packets_in_buffer: max_packets_in_buffer.max(1),
            iat_cumulative_sum: 0,
            max_iat_cumulative_sum: 0,
            max_timer_ms: 0,
            last_packet_kind: LastPacketKind::CngOrDtmf,
            peak_detector: DelayPeakDetector::new(),
        };
        manager.reset();
        manager
    }

    /// Back to the post-construction state, keeping configured delay bounds
    /// and the streaming flag.
    pub fn reset(&mut self) {
        self.packet_len_ms = 0;
        self.peak_detector.reset();
        self.reset_histogram();
        // Adapt the histogram faster for the first few packets.
        self.iat_factor = 0;
        self.packet_iat_count_ms = 0;
        self.max_timer_ms = 0;
        self.iat_cumulative_sum = 0;
        self.max_iat_cumulative_sum = 0;
        self.first_packet_received = false;
        self.last_packet_kind = LastPacketKind::CngOrDtmf;
        self.limit_target_level();
    }

    /// Exponentially decaying default distribution: bucket i holds 2^-(i+1).
    fn reset_histogram(&mut self) {
        let mut temp_prob: i32 = 0x4002; // 16384 + 2 = 100000000000010 binary.
        for bucket in self.iat_vector.iter_mut() {
            temp_prob >>= 1;
            *bucket = temp_prob << 16;
        }
        self.base_target_level = DEFAULT_BASE_TARGET_LEVEL;
        self.target_level = DEFAULT_BASE_TARGET_LEVEL << 8;
    }

    /// Register the arrival of a new speech packet.
    ///
    /// # Arguments
    /// * `sequence_number` - RTP sequence number of the packet
    /// * `timestamp` - RTP timestamp of the packet
    /// * `sample_rate_hz` - Clock rate of the timestamp
    pub fn update(&mut self, sequence_number: u16, timestamp: u32, sample_rate_hz: i32) -> Result<()> {
        if sample_rate_hz <= 0 {
            return Err(NetEqError::InvalidSampleRate(sample_rate_hz));
        }

        if !self.first_packet_received {
            // Nothing to measure against yet.
            self.packet_iat_count_ms = 0;
            self.last_seq_no = sequence_number;
            self.last_timestamp = timestamp;
            self.first_packet_received = true;
            return Ok(());
        }

        let packet_len_ms = if is_newer_timestamp(timestamp, self.last_timestamp)
            && is_newer_sequence_number(sequence_number, self.last_seq_no)
        {
            let packet_len_samples = timestamp.wrapping_sub(self.last_timestamp) as i64
                / sequence_number.wrapping_sub(self.last_seq_no) as i64;
            (1000 * packet_len_samples / sample_rate_hz as i64) as i32
        } else {
            // Out of order; use the stored packet length.
            self.packet_len_ms
        };

        if packet_len_ms > 0 {
            let mut iat_packets = self.packet_iat_count_ms / packet_len_ms;

            if self.streaming_mode {
                self.update_cumulative_sums(packet_len_ms, sequence_number);
            }

            if is_newer_sequence_number(sequence_number, self.last_seq_no.wrapping_add(1)) {
                // Lost packets account for part of the gap.
                let lost = sequence_number.wrapping_sub(self.last_seq_no).wrapping_sub(1) as i32;
                iat_packets = (iat_packets - lost).max(0);
            } else if !is_newer_sequence_number(sequence_number, self.last_seq_no) {
                // Reordered packet.
                iat_packets += self.last_seq_no.wrapping_add(1).wrapping_sub(sequence_number) as i32;
            }

            let iat_packets = iat_packets.min(MAX_IAT as i32);
            self.update_histogram(iat_packets as usize);
            self.target_level = self.calculate_target_level(iat_packets);
            if self.streaming_mode {
                self.target_level = self.target_level.max(self.max_iat_cumulative_sum);
            }
            self.limit_target_level();
        }

        self.packet_iat_count_ms = 0;
        self.last_seq_no = sequence_number;
        self.last_timestamp = timestamp;
        Ok(())
    }

    /// Track the cumulative IAT surplus in Q8 to detect clock drift.
    fn update_cumulative_sums(&mut self, packet_len_ms: i32, sequence_number: u16) {
        // IAT in Q8, keeping fractions of a packet.
        let iat_packets_q8 = ((self.packet_iat_count_ms as i64) << 8) / packet_len_ms as i64;
        // Zero on average when sender and receiver clocks agree.
        let sum = self.iat_cumulative_sum as i64 + iat_packets_q8
            - ((sequence_diff(self.last_seq_no, sequence_number) as i64) << 8)
            - CUMULATIVE_SUM_DRIFT as i64;
        self.iat_cumulative_sum = sum.clamp(0, i32::MAX as i64) as i32;
        if self.iat_cumulative_sum > self.max_iat_cumulative_sum {
            self.max_iat_cumulative_sum = self.iat_cumulative_sum;
            self.max_timer_ms = 0;
        }
        if self.max_timer_ms > MAX_STREAMING_PEAK_PERIOD_MS {
            self.max_iat_cumulative_sum -= CUMULATIVE_SUM_DRIFT;
        }
    }

    /// Forget old observations by `iat_factor` and add weight to
    /// `iat_packets`, keeping total mass at exactly 1 in Q30.
    fn update_histogram(&mut self, iat_packets: usize) {
        debug_assert!(iat_packets < self.iat_vector.len());
        let mut vector_sum: i64 = 0;
        for bucket in self.iat_vector.iter_mut() {
            *bucket = ((*bucket as i64 * self.iat_factor as i64) >> 15) as i32;
            vector_sum += *bucket as i64;
        }

        // Factor in Q15, buckets in Q30: shift 15 to get Q30.
        let increase = (32768 - self.iat_factor) << 15;
        self.iat_vector[iat_packets] += increase;
        vector_sum += increase as i64;

        // Correct fixed-point rounding by nudging the first buckets.
        vector_sum -= 1 << 30;
        if vector_sum != 0 {
            let flip_sign: i64 = if vector_sum > 0 { -1 } else { 1 };
            for bucket in self.iat_vector.iter_mut() {
                if vector_sum == 0 {
                    break;
                }
                // Add or subtract 1/16 of the bucket, but not more than the residual.
                let correction = flip_sign * vector_sum.abs().min((*bucket >> 4) as i64);
                *bucket += correction as i32;
                vector_sum += correction;
            }
        }
        debug_assert_eq!(vector_sum, 0);

        // Converges to IAT_FACTOR within the first few updates after a reset.
        self.iat_factor += (IAT_FACTOR - self.iat_factor + 3) >> 2;
    }

    /// Target level in Q8 from the histogram and the peak detector.
    fn calculate_target_level(&mut self, iat_packets: i32) -> i32 {
        let limit_probability = if self.streaming_mode {
            LIMIT_PROBABILITY_STREAMING
        } else {
            LIMIT_PROBABILITY
        };

        // Tail mass of "IAT >= index", computed from the front since the
        // answer is usually a small index. Starting past bucket 0 keeps the
        // result at least 1.
        let mut index = 0;
        let mut sum: i32 = (1 << 30) - self.iat_vector[0];
        loop {
            index += 1;
            sum -= self.iat_vector[index];
            if sum <= limit_probability || index >= self.iat_vector.len() - 1 {
                break;
            }
        }

        let mut target_level = index as i32;
        self.base_target_level = target_level;

        if self.peak_detector.update(iat_packets, target_level) {
            if let Some(height) = self.peak_detector.max_peak_height() {
                target_level = target_level.max(height);
            }
        }

        target_level.max(1) << 8
    }

    /// Clamp the target level by delay bounds and buffer capacity.
    fn limit_target_level(&mut self) {
        self.least_required_delay_ms = (self.target_level * self.packet_len_ms) >> 8;

        if self.packet_len_ms > 0 && self.minimum_delay_ms > 0 {
            let minimum_delay_packets_q8 = (self.minimum_delay_ms << 8) / self.packet_len_ms;
            self.target_level = self.target_level.max(minimum_delay_packets_q8);
        }

        if self.packet_len_ms > 0 && self.maximum_delay_ms > 0 {
            let maximum_delay_packets_q8 = (self.maximum_delay_ms << 8) / self.packet_len_ms;
            self.target_level = self.target_level.min(maximum_delay_packets_q8);
        }

        // 75% of the buffer capacity, Q8.
        let max_buffer_packets_q8 = (3 * ((self.max_packets_in_buffer as i32) << 8)) / 4;
        self.target_level = self.target_level.min(max_buffer_packets_q8);

        self.target_level = self.target_level.max(1 << 8);
    }

    /// Set the nominal packet length.
    pub fn set_packet_audio_length(&mut self, length_ms: i32) -> Result<()> {
        if length_ms <= 0 {
            warn!("Rejecting packet length {} ms", length_ms);
            return Err(NetEqError::InvalidPacketLength(length_ms));
        }
        if self.streaming_mode && self.packet_len_ms != length_ms {
            self.iat_cumulative_sum = 0;
            self.max_iat_cumulative_sum = 0;
        }
        debug!("Packet length set to {} ms", length_ms);
        self.packet_len_ms = length_ms;
        self.peak_detector.set_packet_audio_length(length_ms);
        self.packet_iat_count_ms = 0;
        self.last_packet_kind = LastPacketKind::Speech;
        Ok(())
    }

    /// Advance the IAT clock, peak counter and streaming timer.
    pub fn update_counters(&mut self, elapsed_time_ms: i32) {
        // Saturate instead of wrapping on very long streams.
        self.packet_iat_count_ms = self.packet_iat_count_ms.saturating_add(elapsed_time_ms);
        self.peak_detector.increment_counter(elapsed_time_ms);
        self.max_timer_ms = self.max_timer_ms.saturating_add(elapsed_time_ms);
    }

    /// Restart the IAT clock without registering a packet.
    pub fn reset_packet_iat_count(&mut self) {
        self.packet_iat_count_ms = 0;
    }

    /// Lower and higher buffer watermarks in Q8 packets.
    ///
    /// The higher limit is at least 20 ms above the lower one.
    pub fn buffer_limits(&self) -> (i32, i32) {
        let window_20ms = if self.packet_len_ms > 0 {
            (20 << 8) / self.packet_len_ms
        } else {
            0x7FFF
        };
        let lower_limit = (self.target_level * 3) / 4;
        let higher_limit = self.target_level.max(lower_limit + window_20ms);
        (lower_limit, higher_limit)
    }

    /// Estimated clock drift in parts per million, from the histogram mean
    /// relative to the nominal IAT of one packet.
    pub fn average_iat_ppm(&self) -> i32 {
        let mut sum_q24: i64 = 0;
        for (i, &bucket) in self.iat_vector.iter().enumerate() {
            // Shift 6 to fit the worst case of 2^30 * 64.
            sum_q24 += ((bucket >> 6) as i64) * i as i64;
        }
        sum_q24 -= 1 << 24;
        // 1e6 / 2^24 = 15625 / 2^18.
        (((sum_q24 >> 7) * 15625) >> 11) as i32
    }

    /// Track CNG/DTMF versus speech for IAT measurement.
    pub fn last_decoder_type(&mut self, kind: PayloadKind) {
        self.last_packet_kind = match kind {
            PayloadKind::ComfortNoise | PayloadKind::Dtmf => LastPacketKind::CngOrDtmf,
            PayloadKind::Speech if self.last_packet_kind != LastPacketKind::Speech => {
                LastPacketKind::SpeechAfterCngOrDtmf
            }
            PayloadKind::Speech => LastPacketKind::Speech,
        };
    }

    pub fn last_packet_kind(&self) -> LastPacketKind {
        self.last_packet_kind
    }

    pub fn set_last_packet_kind(&mut self, kind: LastPacketKind) {
        self.last_packet_kind = kind;
    }

    /// Set the minimum delay. Rejected if above the maximum or above 75% of
    /// the buffer capacity.
    pub fn set_minimum_delay(&mut self, delay_ms: i32) -> Result<()> {
        let capacity_limit_ms = 3 * self.max_packets_in_buffer as i32 * self.packet_len_ms / 4;
        if delay_ms < 0
            || (self.maximum_delay_ms > 0 && delay_ms > self.maximum_delay_ms)
            || (self.packet_len_ms > 0 && delay_ms > capacity_limit_ms)
        {
            return Err(NetEqError::InvalidDelay(delay_ms));
        }
        self.minimum_delay_ms = delay_ms;
        Ok(())
    }

    /// Set the maximum delay; 0 removes the maximum. Rejected if below the
    /// minimum or below one packet.
    pub fn set_maximum_delay(&mut self, delay_ms: i32) -> Result<()> {
        if delay_ms == 0 {
            self.maximum_delay_ms = 0;
            return Ok(());
        }
        if delay_ms < 0 || delay_ms < self.minimum_delay_ms || delay_ms < self.packet_len_ms {
            return Err(NetEqError::InvalidDelay(delay_ms));
        }
        self.maximum_delay_ms = delay_ms;
        Ok(())
    }

    pub fn set_streaming_mode(&mut self, streaming: bool) {
        self.streaming_mode = streaming;
    }

    pub fn streaming_mode(&self) -> bool {
        self.streaming_mode
    }

    /// Target level in Q8 packets.
    pub fn target_level(&self) -> i32 {
        self.target_level
    }

    /// Histogram-derived level in whole packets, before peak and delay
    /// adjustments.
    pub fn base_target_level(&self) -> i32 {
        self.base_target_level
    }

    pub fn least_required_delay_ms(&self) -> i32 {
        self.least_required_delay_ms
    }

    pub fn minimum_delay_ms(&self) -> i32 {
        self.minimum_delay_ms
    }

    pub fn maximum_delay_ms(&self) -> i32 {
        self.maximum_delay_ms
    }

    pub fn packet_len_ms(&self) -> i32 {
        self.packet_len_ms
    }

    pub fn peak_found(&self) -> bool {
        self.peak_detector.peak_found()
    }

    pub fn peak_detector(&self) -> &DelayPeakDetector {
        &self.peak_detector
    }

    pub fn iat_histogram(&self) -> &[i32] {
        &self.iat_vector
    }

    pub fn max_packets_in_buffer(&self) -> usize {
        self.max_packets_in_buffer
    }
}
