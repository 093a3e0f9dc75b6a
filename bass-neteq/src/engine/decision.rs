//! Per-tick decision and packet extraction.

use log::{debug, error, trace};

use crate::decision_logic::{DecisionInput, Mode, Operation};
use crate::dtmf::DtmfEvent;
use crate::error::{NetEqError, Result};
use crate::packet::{is_newer_timestamp, sequence_diff, timestamp_diff, Packet};

use super::EngineState;

/// What one tick will do, and the packets it will decode.
pub(super) struct TickPlan {
    pub operation: Operation,
    pub packets: Vec<Packet>,
    pub dtmf_event: Option<DtmfEvent>,
    pub play_dtmf: bool,
}

impl TickPlan {
    fn new(operation: Operation, dtmf_event: Option<DtmfEvent>) -> Self {
        Self {
            operation,
            packets: Vec::new(),
            play_dtmf: dtmf_event.is_some(),
            dtmf_event,
        }
    }
}

impl EngineState {
    pub(super) fn get_decision(&mut self) -> Result<TickPlan> {
        let out = self.output_size_samples;
        self.stats.increase_counter(out, self.fs_hz);
        let mut end_timestamp = self.sync_buffer.end_timestamp();

        if !self.new_codec {
            let dropped = self.packet_buffer.discard_all_old_packets(end_timestamp);
            self.stats.packets_discarded(dropped);
        }

        if self.decision_logic.cng_rfc3389_on() || self.last_mode == Mode::Rfc3389Cng {
            self.discard_stale_sid_packets(end_timestamp);
        }

        let samples_left = self.sync_buffer.future_length() as i32 - self.expand.overlap_length() as i32;
        if self.last_mode.is_time_scale() {
            self.decision_logic.add_sample_memory(-(samples_left + out as i32));
        }

        let generated = self.decision_logic.generated_noise_samples();
        let dtmf_event = self.dtmf_buffer.get_event(end_timestamp.wrapping_add(generated));
        let mut plan = TickPlan::new(Operation::Undefined, dtmf_event);

        let next_header = self.packet_buffer.next_header().copied();
        let input = DecisionInput {
            future_length: self.sync_buffer.future_length(),
            overlap_length: self.expand.overlap_length(),
            end_timestamp,
            decoder_frame_length: self.decoder_frame_length,
            next_header: next_header.as_ref(),
            next_is_cng: next_header.is_some_and(|h| self.decoder_database.is_comfort_noise(h.payload_type)),
            num_packets: self.packet_buffer.len(),
            samples_in_packet_buffer: self
                .packet_buffer
                .num_samples_in_buffer(&self.decoder_database, self.decoder_frame_length),
            prev_mode: self.last_mode,
            play_dtmf: plan.play_dtmf,
        };
        let decision = self.decision_logic.get_decision(&input, &mut self.delay_manager);
        if decision.reset_decoder {
            self.reset_decoder = true;
        }
        plan.operation = decision.operation;

        // Enough audio left; only a stretch or merge needs new data now.
        if samples_left >= out as i32
            && !matches!(
                plan.operation,
                Operation::Merge | Operation::Accelerate | Operation::FastAccelerate | Operation::PreemptiveExpand
            )
        {
            plan.operation = Operation::Normal;
            return Ok(plan);
        }

        self.decision_logic.expand_decision(plan.operation);

        if plan.operation == Operation::Undefined
            || (self.new_codec && (next_header.is_some() || plan.play_dtmf))
        {
            // After an error tick, Undefined asks for a resync.
            if plan.operation == Operation::Undefined && !self.new_codec && self.last_mode != Mode::Error {
                self.report_undefined_decision();
            }
            if let Some(header) = next_header {
                self.timestamp = header.timestamp;
                let next_is_cng = self.decoder_database.is_comfort_noise(header.payload_type);
                if plan.operation == Operation::Rfc3389CngNoPacket && next_is_cng {
                    plan.operation = Operation::Rfc3389Cng;
                } else if plan.operation != Operation::Rfc3389Cng {
                    plan.operation = Operation::Normal;
                }
            } else if let Some(event) = plan.dtmf_event {
                self.timestamp = event.timestamp;
            } else {
                error!("Resync without a packet or DTMF event to sync to");
                return Err(NetEqError::PacketBufferCorruption);
            }
            debug!("Resync to ts={}", self.timestamp);
            self.sync_buffer
                .increase_end_timestamp(self.timestamp.wrapping_sub(end_timestamp));
            end_timestamp = self.timestamp;
            self.new_codec = false;
            self.decision_logic.soft_reset();
            self.decision_logic.reset_buffer_level_filter();
            self.delay_manager.reset();
            self.stats.reset_mcu();
        }

        let ten_ms = 80 * self.fs_mult as i32;
        let twenty_ms = 2 * ten_ms;
        let thirty_ms = 3 * ten_ms;
        let frame_length = self.decoder_frame_length as i32;
        let mut required_samples = out;
        match plan.operation {
            Operation::Expand => {
                self.timestamp = end_timestamp;
                return Ok(plan);
            }
            Operation::Rfc3389CngNoPacket | Operation::CodecInternalCng => {
                return Ok(plan);
            }
            Operation::Dtmf => {
                self.timestamp = end_timestamp;
                let generated = self.decision_logic.generated_noise_samples();
                if generated > 0 && self.last_mode != Mode::Dtmf {
                    // The tone starts after the comfort noise already played.
                    self.sync_buffer.increase_end_timestamp(generated);
                    self.timestamp = self.timestamp.wrapping_add(generated);
                }
                self.decision_logic.set_generated_noise_samples(0);
                return Ok(plan);
            }
            Operation::Accelerate | Operation::FastAccelerate => {
                if samples_left >= thirty_ms {
                    // Stretch what is already in the sync buffer.
                    self.decision_logic.set_sample_memory(samples_left);
                    self.decision_logic.set_prev_time_scale(true);
                    return Ok(plan);
                } else if samples_left >= ten_ms && frame_length >= thirty_ms {
                    plan.operation = Operation::Normal;
                    return Ok(plan);
                } else if samples_left < twenty_ms && frame_length < thirty_ms {
                    // Two packets are needed for a 30 ms window.
                    required_samples = 2 * out;
                    plan.operation = Operation::Normal;
                }
            }
            Operation::PreemptiveExpand => {
                if samples_left >= thirty_ms || (samples_left >= ten_ms && frame_length >= thirty_ms) {
                    self.decision_logic.set_sample_memory(samples_left);
                    self.decision_logic.set_prev_time_scale(true);
                    return Ok(plan);
                }
                if samples_left < twenty_ms && frame_length < thirty_ms {
                    required_samples = 2 * out;
                }
            }
            Operation::Merge => {
                required_samples = required_samples.max(self.merge.required_future_samples());
            }
            _ => {}
        }

        let mut extracted_samples = 0;
        if let Some(header) = next_header {
            if plan.operation.decodes_packets() {
                let gap = header.timestamp.wrapping_sub(end_timestamp);
                self.sync_buffer.increase_end_timestamp(gap);
                if self.decision_logic.cng_off() {
                    self.stats.lost_samples(gap);
                }
                if plan.operation != Operation::Rfc3389Cng {
                    self.decision_logic.set_cng_off();
                }
                self.decision_logic.set_generated_noise_samples(0);
                let (packets, extracted) = self.extract_packets(required_samples);
                plan.packets = packets;
                extracted_samples = extracted;
            }
        }

        match plan.operation {
            Operation::Accelerate | Operation::FastAccelerate | Operation::PreemptiveExpand => {
                self.decision_logic
                    .set_sample_memory(samples_left + extracted_samples as i32);
                self.decision_logic.set_prev_time_scale(true);
            }
            _ => {}
        }
        if matches!(plan.operation, Operation::Accelerate | Operation::FastAccelerate)
            && (extracted_samples as i32 + samples_left) < thirty_ms
        {
            // Not enough audio for a 30 ms analysis window.
            plan.operation = Operation::Normal;
        }

        self.timestamp = end_timestamp;
        Ok(plan)
    }

    /// An Undefined decision outside a stream start is a gap in the decision
    /// coverage. The tick still resyncs; the error stays queryable.
    pub(super) fn report_undefined_decision(&mut self) {
        error!("Undefined decision outside a stream start");
        self.last_error = Some(NetEqError::InvalidOperation("undefined decision outside a stream start"));
        debug_assert!(false, "undefined decision outside a stream start");
    }

    /// Drop SID packets that are already in the past, or that the comfort
    /// noise played so far has overtaken.
    fn discard_stale_sid_packets(&mut self, end_timestamp: u32) {
        let generated = self.decision_logic.generated_noise_samples();
        while let Some(header) = self.packet_buffer.next_header().copied() {
            if !self.decoder_database.is_comfort_noise(header.payload_type) {
                break;
            }
            let stale = !is_newer_timestamp(header.timestamp, end_timestamp)
                || is_newer_timestamp(end_timestamp.wrapping_add(generated), header.timestamp);
            if !stale {
                break;
            }
            trace!("Discarding stale SID ts={}", header.timestamp);
            if self.packet_buffer.discard_next_packet().is_err() {
                break;
            }
            self.stats.packets_discarded(1);
            if !self.new_codec {
                let dropped = self.packet_buffer.discard_all_old_packets(end_timestamp);
                self.stats.packets_discarded(dropped);
            }
        }
    }

    /// Take consecutive packets of one payload type until at least
    /// `required_samples` per channel are covered.
    ///
    /// Returns the packets and the samples per channel they span.
    fn extract_packets(&mut self, required_samples: usize) -> (Vec<Packet>, usize) {
        let mut packets = Vec::new();
        let Some(first) = self.packet_buffer.next_header().copied() else {
            return (packets, 0);
        };
        let first_timestamp = first.timestamp;
        let mut prev_sequence_number = first.sequence_number;
        let mut extracted_samples = 0usize;

        loop {
            let Some((packet, discarded)) = self.packet_buffer.get_next_packet() else {
                break;
            };
            self.timestamp = packet.timestamp();
            self.stats.packets_discarded(discarded);
            if let Some(stopwatch) = &packet.waiting_time {
                self.stats.store_waiting_time(stopwatch.elapsed_ms() as i32);
            }

            let duration = if packet.sync_packet {
                self.decoder_frame_length
            } else {
                self.decoder_database
                    .packet_duration(&packet)
                    .unwrap_or(self.decoder_frame_length)
            };
            extracted_samples = packet
                .timestamp()
                .wrapping_sub(first_timestamp)
                .wrapping_add(duration as u32) as usize;
            packets.push(packet);

            let next_available = match self.packet_buffer.next_header() {
                Some(next) if next.payload_type == first.payload_type => {
                    let seq_step = sequence_diff(prev_sequence_number, next.sequence_number);
                    let ts_step = timestamp_diff(next.timestamp, self.timestamp);
                    seq_step == 1 || (seq_step == 0 && ts_step == self.decoder_frame_length as i32)
                }
                _ => false,
            };
            if let Some(next) = self.packet_buffer.next_header() {
                prev_sequence_number = next.sequence_number;
            }
            if extracted_samples >= required_samples || !next_available {
                break;
            }
        }

        if extracted_samples > 0 {
            let dropped = self.packet_buffer.discard_all_old_packets(self.timestamp);
            self.stats.packets_discarded(dropped);
        }
        (packets, extracted_samples)
    }
}
