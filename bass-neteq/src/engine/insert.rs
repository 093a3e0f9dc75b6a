//! Packet arrival.

use log::{info, trace, warn};

use crate::codec::PayloadKind;
use crate::delay_manager::LastPacketKind;
use crate::dtmf::DtmfEvent;
use crate::error::{NetEqError, Result};
use crate::packet::{timestamp_diff, Packet, RtpHeader};
use crate::packet_buffer::InsertStatus;

use super::EngineState;

impl EngineState {
    pub(super) fn insert_packets(&mut self, mut packets: Vec<Packet>, receive_timestamp: u32) -> Result<()> {
        let Some(first) = packets.first() else {
            return Err(NetEqError::InvalidPacket("empty packet list"));
        };
        if packets.iter().any(|p| p.payload.is_empty()) {
            return Err(NetEqError::InvalidPacket("empty payload"));
        }
        self.decoder_database.check_payload_types(&packets)?;

        let main_header = first.header;
        let main_kind = self.decoder_database.kind(main_header.payload_type);
        // Duration of one packet, taken before the list is consumed.
        let main_duration = self
            .decoder_database
            .packet_duration(first)
            .unwrap_or(self.decoder_frame_length);
        trace!(
            "Insert ts={} seq={} pt={} rx={}",
            main_header.timestamp,
            main_header.sequence_number,
            main_header.payload_type,
            receive_timestamp
        );

        // Telephone events go to their own buffer. Parse them all before
        // touching any state so a bad one rejects the whole list.
        let mut dtmf_events = Vec::new();
        let mut index = 0;
        while index < packets.len() {
            if self.decoder_database.is_dtmf(packets[index].payload_type()) {
                let packet = packets.remove(index);
                dtmf_events.push(DtmfEvent::parse(packet.timestamp(), &packet.payload)?);
            } else {
                index += 1;
            }
        }

        for packet in &mut packets {
            packet.waiting_time = Some(self.tick_timer.new_stopwatch());
        }

        let mut update_sample_rate = false;
        if self.first_packet || main_header.ssrc != self.ssrc {
            if !self.first_packet {
                info!(
                    "SSRC changed {:#010x} -> {:#010x}, restarting stream",
                    self.ssrc, main_header.ssrc
                );
            } else {
                info!("First packet: ssrc={:#010x} pt={}", main_header.ssrc, main_header.payload_type);
            }
            self.packet_buffer.flush();
            self.dtmf_buffer.flush();
            self.ssrc = main_header.ssrc;
            self.sync_buffer
                .increase_end_timestamp(main_header.timestamp.wrapping_sub(self.timestamp));
            self.timestamp = main_header.timestamp;
            if main_kind == Some(PayloadKind::Speech) {
                self.current_rtp_pt = Some(main_header.payload_type);
            }
            self.first_packet = false;
            self.new_codec = true;
            update_sample_rate = true;
        }

        for event in dtmf_events {
            self.dtmf_buffer.insert_event(event)?;
        }

        let before = self.packet_buffer.len();
        let mut flushed = false;
        if !packets.is_empty() {
            let status = self.packet_buffer.insert_packet_list(
                packets,
                &self.decoder_database,
                &mut self.current_rtp_pt,
                &mut self.current_cng_pt,
            )?;
            if status == InsertStatus::Flushed {
                warn!("Packet buffer flushed on insert");
                flushed = true;
                self.new_codec = true;
                update_sample_rate = true;
            }
        }

        if update_sample_rate {
            self.follow_next_packet_format();
        }

        let Some(kind) = main_kind else {
            return Ok(());
        };
        self.delay_manager.last_decoder_type(kind);
        match self.delay_manager.last_packet_kind() {
            LastPacketKind::Speech => {
                let after = self.packet_buffer.len();
                let inserted = if flushed { after } else { after.saturating_sub(before) };
                let packet_length = (inserted * main_duration) as i32;
                if packet_length > 0 && packet_length != self.decision_logic.packet_length_samples() {
                    self.decision_logic.set_packet_length_samples(packet_length);
                    let length_ms = 1000 * packet_length / self.fs_hz as i32;
                    if let Err(e) = self.delay_manager.set_packet_audio_length(length_ms) {
                        warn!("Packet length {} ms rejected: {}", length_ms, e);
                    }
                }
                if timestamp_diff(main_header.timestamp, self.timestamp) >= 0 && !self.new_codec {
                    self.delay_manager.update(
                        main_header.sequence_number,
                        main_header.timestamp,
                        self.fs_hz as i32,
                    )?;
                }
            }
            LastPacketKind::SpeechAfterCngOrDtmf => {
                // No inter-arrival statistics across a silence period.
                self.delay_manager.set_last_packet_kind(LastPacketKind::Speech);
                self.delay_manager.reset_packet_iat_count();
            }
            LastPacketKind::CngOrDtmf => {}
        }
        Ok(())
    }

    /// Reconfigure output if the next buffered packet is a speech payload
    /// with a different rate or channel count. Comfort noise and telephone
    /// events keep the current channel count.
    fn follow_next_packet_format(&mut self) {
        let Some(header) = self.packet_buffer.next_header() else {
            return;
        };
        let Some(info) = self.decoder_database.info(header.payload_type) else {
            return;
        };
        let fs_hz = info.sample_rate_hz;
        let channels = if info.kind == PayloadKind::Speech {
            info.channels()
        } else {
            self.sync_buffer.channels()
        };
        if fs_hz != self.fs_hz || channels != self.sync_buffer.channels() {
            info!("Stream format {} Hz, {} channel(s)", fs_hz, channels);
            self.set_sample_rate_and_channels(fs_hz, channels);
        }
    }

    /// Insert a placeholder for a packet of the current stream.
    pub(super) fn insert_sync_packet(&mut self, header: RtpHeader, receive_timestamp: u32) -> Result<()> {
        if !self.decoder_database.is_speech(header.payload_type) {
            return Err(NetEqError::InvalidPacket("sync packet needs a speech payload type"));
        }
        if self.first_packet
            || self.current_rtp_pt != Some(header.payload_type)
            || header.ssrc != self.ssrc
        {
            return Err(NetEqError::InvalidPacket("sync packet does not match the current stream"));
        }
        let mut packet = Packet::new(header, vec![0]);
        packet.sync_packet = true;
        self.insert_packets(vec![packet], receive_timestamp)
    }
}
