//! Ordered, bounded holding area for packets that have not been decoded yet.
//!
//! Packets are kept sorted by [`Packet::playout_order`]. When the buffer is
//! full the whole content is flushed before the new packet goes in; callers
//! see this as [`InsertStatus::Flushed`] and treat it like a codec change.

use std::cmp::Ordering;
use std::collections::VecDeque;

use log::{trace, warn};

use crate::codec::DecoderDatabase;
use crate::error::{NetEqError, Result};
use crate::packet::{is_newer_timestamp, Packet, RtpHeader};

/// Outcome of a successful insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStatus {
    Ok,
    /// The buffer was emptied before the packet was stored.
    Flushed,
}

/// Returns true if `timestamp` is older than `limit` but at most `horizon`
/// samples behind it. A horizon of 0 means half the timestamp range.
pub fn is_obsolete_timestamp(timestamp: u32, limit: u32, horizon: u32) -> bool {
    is_newer_timestamp(limit, timestamp)
        && (horizon == 0 || !is_newer_timestamp(limit.wrapping_sub(horizon), timestamp))
}

/// Packet buffer.
#[derive(Debug)]
pub struct PacketBuffer {
    /// Packets sorted in playout order
    buffer: VecDeque<Packet>,
    /// Maximum number of packets held
    max_packets: usize,
}

impl PacketBuffer {
    pub fn new(max_packets: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(max_packets),
            max_packets: max_packets.max(1),
        }
    }

    pub fn flush(&mut self) {
        self.buffer.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn max_packets(&self) -> usize {
        self.max_packets
    }

    /// Insert one packet in playout order.
    ///
    /// The list is searched from the back, since new packets usually belong
    /// near the end.
    pub fn insert_packet(&mut self, packet: Packet) -> Result<InsertStatus> {
        if packet.payload.is_empty() {
            return Err(NetEqError::InvalidPacket("empty payload"));
        }

        let mut status = InsertStatus::Ok;
        if self.buffer.len() >= self.max_packets {
            warn!("Packet buffer full ({} packets), flushing", self.buffer.len());
            self.flush();
            status = InsertStatus::Flushed;
        }

        let pos = self
            .buffer
            .iter()
            .rposition(|existing| packet.playout_order(existing) != Ordering::Less)
            .map_or(0, |i| i + 1);
        trace!(
            "Insert ts={} seq={} at {} of {}",
            packet.timestamp(),
            packet.sequence_number(),
            pos,
            self.buffer.len()
        );
        self.buffer.insert(pos, packet);
        Ok(status)
    }

    /// Insert a list of packets, flushing first if the payload types imply a
    /// codec change.
    ///
    /// `current_rtp_pt` and `current_cng_pt` track the speech and
    /// comfort-noise payload types last seen; a change in either flushes the
    /// buffer and forgets the other. DTMF packets never cause a flush.
    pub fn insert_packet_list(
        &mut self,
        packets: Vec<Packet>,
        decoder_database: &DecoderDatabase,
        current_rtp_pt: &mut Option<u8>,
        current_cng_pt: &mut Option<u8>,
    ) -> Result<InsertStatus> {
        let mut flushed = false;
        for packet in packets {
            let pt = packet.payload_type();
            if decoder_database.is_comfort_noise(pt) {
                if current_cng_pt.is_some_and(|cng| cng != pt) {
                    // New CNG payload type implies new codec type.
                    *current_rtp_pt = None;
                    self.flush();
                    flushed = true;
                }
                *current_cng_pt = Some(pt);
            } else if !decoder_database.is_dtmf(pt) {
                if current_rtp_pt.is_some_and(|rtp| rtp != pt) {
                    *current_cng_pt = None;
                    self.flush();
                    flushed = true;
                }
                *current_rtp_pt = Some(pt);
            }

            if self.insert_packet(packet)? == InsertStatus::Flushed {
                flushed = true;
            }
        }
        Ok(if flushed { InsertStatus::Flushed } else { InsertStatus::Ok })
    }

    /// Timestamp of the earliest packet.
    pub fn next_timestamp(&self) -> Result<u32> {
        self.buffer
            .front()
            .map(|p| p.timestamp())
            .ok_or(NetEqError::BufferEmpty)
    }

    /// Earliest timestamp at or after `timestamp`.
    pub fn next_higher_timestamp(&self, timestamp: u32) -> Result<u32> {
        if self.buffer.is_empty() {
            return Err(NetEqError::BufferEmpty);
        }
        self.buffer
            .iter()
            .map(|p| p.timestamp())
            .find(|&ts| ts == timestamp || is_newer_timestamp(ts, timestamp))
            .ok_or(NetEqError::BufferEmpty)
    }

    /// Header of the earliest packet, without removing it.
    pub fn next_header(&self) -> Option<&RtpHeader> {
        self.buffer.front().map(|p| &p.header)
    }

    /// Earliest packet, without removing it.
    pub fn peek_next_packet(&self) -> Option<&Packet> {
        self.buffer.front()
    }

    /// Remove and return the earliest packet.
    ///
    /// Following packets with the same timestamp are surplus copies of the
    /// same audio and are discarded; their count is returned alongside.
    pub fn get_next_packet(&mut self) -> Option<(Packet, usize)> {
        let packet = self.buffer.pop_front()?;
        let mut discarded = 0;
        while self
            .buffer
            .front()
            .is_some_and(|next| next.timestamp() == packet.timestamp())
        {
            self.buffer.pop_front();
            discarded += 1;
        }
        Some((packet, discarded))
    }

    /// Drop the earliest packet.
    pub fn discard_next_packet(&mut self) -> Result<()> {
        self.buffer.pop_front().map(|_| ()).ok_or(NetEqError::BufferEmpty)
    }

    /// Drop every packet older than `timestamp_limit` and at most `horizon`
    /// samples behind it. Returns the number of packets dropped.
    pub fn discard_old_packets(&mut self, timestamp_limit: u32, horizon: u32) -> usize {
        let before = self.buffer.len();
        self.buffer
            .retain(|p| !is_obsolete_timestamp(p.timestamp(), timestamp_limit, horizon));
        before - self.buffer.len()
    }

    /// Drop every packet of one payload type. Returns the number dropped.
    pub fn discard_packets_with_payload_type(&mut self, payload_type: u8) -> usize {
        let before = self.buffer.len();
        self.buffer.retain(|p| p.payload_type() != payload_type);
        before - self.buffer.len()
    }

    /// Drop everything in the past half of the timestamp circle.
    pub fn discard_all_old_packets(&mut self, timestamp_limit: u32) -> usize {
        self.discard_old_packets(timestamp_limit, 0)
    }

    /// Estimated buffered audio in samples per channel.
    ///
    /// Each packet contributes its decoder-reported duration. Sync packets and
    /// packets whose duration cannot be determined contribute the last known
    /// duration; redundant copies are skipped.
    pub fn num_samples_in_buffer(&self, decoder_database: &DecoderDatabase, last_duration: usize) -> usize {
        let mut last_duration = last_duration;
        let mut num_samples = 0;
        for packet in &self.buffer {
            if !packet.sync_packet {
                if !packet.primary {
                    continue;
                }
                if let Some(duration) = decoder_database.packet_duration(packet) {
                    last_duration = duration;
                }
            }
            num_samples += last_duration;
        }
        num_samples
    }

    /// Iterate over buffered packets in playout order.
    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.buffer.iter()
    }
}
