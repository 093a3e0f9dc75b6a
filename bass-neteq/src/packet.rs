//! Packet representation and wraparound-aware RTP comparisons.

use std::cmp::Ordering;

use crate::tick_timer::Stopwatch;

/// RTP metadata the engine needs for every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RtpHeader {
    /// Payload type (0-127)
    pub payload_type: u8,
    /// Sequence number (wraps at 65535)
    pub sequence_number: u16,
    /// Media timestamp, in samples of the payload's clock rate
    pub timestamp: u32,
    /// Synchronization source identifier
    pub ssrc: u32,
    /// Marker bit
    pub marker: bool,
}

/// Returns true if `a` is newer than `b` modulo 2^32.
///
/// Exactly half the range apart is broken by plain magnitude so that the
/// relation stays antisymmetric.
#[inline]
pub fn is_newer_timestamp(a: u32, b: u32) -> bool {
    let diff = a.wrapping_sub(b);
    if diff == 0x8000_0000 {
        return a > b;
    }
    a != b && diff < 0x8000_0000
}

/// Returns true if `a` is newer than `b` modulo 2^16.
#[inline]
pub fn is_newer_sequence_number(a: u16, b: u16) -> bool {
    let diff = a.wrapping_sub(b);
    if diff == 0x8000 {
        return a > b;
    }
    a != b && diff < 0x8000
}

/// The later of two timestamps.
#[inline]
pub fn latest_timestamp(a: u32, b: u32) -> u32 {
    if is_newer_timestamp(a, b) {
        a
    } else {
        b
    }
}

/// Signed distance from `b` to `a` in samples.
#[inline]
pub fn timestamp_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Signed sequence distance from `a` to `b`.
///
/// Positive when `b` comes after `a`.
#[inline]
pub fn sequence_diff(a: u16, b: u16) -> i32 {
    b.wrapping_sub(a) as i16 as i32
}

/// One encoded frame waiting to be decoded.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: RtpHeader,
    pub payload: Vec<u8>,
    /// False for redundant (FEC) copies.
    pub primary: bool,
    /// Synthetic placeholder that decodes to silence.
    pub sync_packet: bool,
    /// Started when the packet entered the engine.
    pub waiting_time: Option<Stopwatch>,
}

impl Packet {
    pub fn new(header: RtpHeader, payload: Vec<u8>) -> Self {
        Self {
            header,
            payload,
            primary: true,
            sync_packet: false,
            waiting_time: None,
        }
    }

    /// A redundant copy carried alongside another packet.
    pub fn redundant(header: RtpHeader, payload: Vec<u8>) -> Self {
        Self {
            primary: false,
            ..Self::new(header, payload)
        }
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn sequence_number(&self) -> u16 {
        self.header.sequence_number
    }

    pub fn payload_type(&self) -> u8 {
        self.header.payload_type
    }

    /// Buffer ordering: timestamp, then sequence number, then redundant
    /// before primary. Both fields wrap.
    pub fn playout_order(&self, other: &Packet) -> Ordering {
        let (a, b) = (&self.header, &other.header);
        if a.timestamp != b.timestamp {
            return if is_newer_timestamp(a.timestamp, b.timestamp) {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }
        if a.sequence_number != b.sequence_number {
            return if is_newer_sequence_number(a.sequence_number, b.sequence_number) {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }
        self.primary.cmp(&other.primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(ts: u32, seq: u16) -> RtpHeader {
        RtpHeader {
            payload_type: 0,
            sequence_number: seq,
            timestamp: ts,
            ssrc: 1,
            marker: false,
        }
    }

    #[test]
    fn test_newer_timestamp() {
        assert!(is_newer_timestamp(1, 0));
        assert!(!is_newer_timestamp(0, 1));
        assert!(!is_newer_timestamp(5, 5));
        assert!(is_newer_timestamp(3, 0xFFFF_FFFE));
        assert!(!is_newer_timestamp(0xFFFF_FFFE, 3));
        // Half-range tie goes to the larger value.
        assert!(is_newer_timestamp(0x8000_0000, 0));
        assert!(!is_newer_timestamp(0, 0x8000_0000));
    }

    #[test]
    fn test_newer_sequence_number() {
        assert!(is_newer_sequence_number(2, 1));
        assert!(is_newer_sequence_number(0, 0xFFFF));
        assert!(!is_newer_sequence_number(0xFFFF, 0));
        assert!(is_newer_sequence_number(0x8000, 0));
        assert!(!is_newer_sequence_number(0, 0x8000));
    }

    #[test]
    fn test_sequence_diff() {
        assert_eq!(sequence_diff(100, 101), 1);
        assert_eq!(sequence_diff(100, 99), -1);
        assert_eq!(sequence_diff(65535, 0), 1);
        assert_eq!(sequence_diff(0, 65535), -1);
    }

    #[test]
    fn test_timestamp_helpers() {
        assert_eq!(timestamp_diff(3, 0xFFFF_FFFE), 5);
        assert_eq!(timestamp_diff(0xFFFF_FFFE, 3), -5);
        assert_eq!(latest_timestamp(3, 0xFFFF_FFFE), 3);
        assert_eq!(latest_timestamp(10, 20), 20);
    }

    #[test]
    fn test_playout_order() {
        let a = Packet::new(header(160, 1), vec![1]);
        let b = Packet::new(header(320, 2), vec![1]);
        assert_eq!(a.playout_order(&b), Ordering::Less);
        assert_eq!(b.playout_order(&a), Ordering::Greater);

        // Same timestamp, sequence decides.
        let c = Packet::new(header(160, 2), vec![1]);
        assert_eq!(a.playout_order(&c), Ordering::Less);

        // Same timestamp and sequence: redundant first.
        let red = Packet::redundant(header(160, 1), vec![1]);
        assert_eq!(red.playout_order(&a), Ordering::Less);
        assert_eq!(a.playout_order(&a.clone()), Ordering::Equal);
    }

    #[test]
    fn test_playout_order_wraps() {
        let old = Packet::new(header(0xFFFF_FFFE, 0xFFFF), vec![1]);
        let new = Packet::new(header(3, 0), vec![1]);
        assert_eq!(old.playout_order(&new), Ordering::Less);
    }
}
