//! Telephone events (RFC 4733) waiting to be played.
//!
//! Payload layout:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     event     |E|R| volume    |          duration             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use log::{debug, warn};

use crate::error::{NetEqError, Result};
use crate::packet::is_newer_timestamp;

/// Highest DTMF event number (digits, *, #, A-D).
const MAX_EVENT_NO: u8 = 15;
/// Lowest tone level accepted, in -dBm0.
const MAX_VOLUME: u8 = 36;
/// Pending events kept at most.
const MAX_EVENTS: usize = 32;

/// One telephone event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfEvent {
    /// RTP timestamp where the event starts.
    pub timestamp: u32,
    pub event_no: u8,
    /// Level in -dBm0.
    pub volume: u8,
    /// Duration so far in timestamp units.
    pub duration: u16,
    /// Set on the final packet of the event.
    pub end_bit: bool,
}

impl DtmfEvent {
    /// Parse a telephone-event payload.
    pub fn parse(rtp_timestamp: u32, payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(NetEqError::InvalidDtmfEvent("payload shorter than 4 bytes"));
        }
        Ok(Self {
            timestamp: rtp_timestamp,
            event_no: payload[0],
            end_bit: payload[1] & 0x80 != 0,
            volume: payload[1] & 0x3F,
            duration: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.event_no > MAX_EVENT_NO {
            return Err(NetEqError::InvalidDtmfEvent("event number out of range"));
        }
        if self.volume > MAX_VOLUME {
            return Err(NetEqError::InvalidDtmfEvent("volume out of range"));
        }
        if self.duration == 0 {
            return Err(NetEqError::InvalidDtmfEvent("zero duration"));
        }
        Ok(())
    }

    fn end_timestamp(&self) -> u32 {
        self.timestamp.wrapping_add(self.duration as u32)
    }
}

/// Pending telephone events sorted by start timestamp.
#[derive(Debug, Clone)]
pub struct DtmfBuffer {
    events: Vec<DtmfEvent>,
    /// How long an event without end bit keeps playing past its duration.
    max_extrapolation_samples: u32,
    /// One output frame in samples.
    frame_len_samples: u32,
}

impl DtmfBuffer {
    pub fn new(sample_rate_hz: u32) -> Self {
        let mut buffer = Self {
            events: Vec::new(),
            max_extrapolation_samples: 0,
            frame_len_samples: 0,
        };
        buffer.set_sample_rate(sample_rate_hz);
        buffer
    }

    pub fn set_sample_rate(&mut self, sample_rate_hz: u32) {
        // 70 ms of extrapolation, 10 ms frames.
        self.max_extrapolation_samples = 7 * sample_rate_hz / 100;
        self.frame_len_samples = sample_rate_hz / 100;
    }

    pub fn flush(&mut self) {
        self.events.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Add an event, or merge it into a pending event with the same
    /// timestamp and number.
    pub fn insert_event(&mut self, event: DtmfEvent) -> Result<()> {
        event.validate()?;

        if let Some(existing) = self
            .events
            .iter_mut()
            .find(|e| e.timestamp == event.timestamp && e.event_no == event.event_no)
        {
            existing.duration = existing.duration.max(event.duration);
            existing.end_bit |= event.end_bit;
            return Ok(());
        }

        // Keep order by timestamp; ended events sort first on a tie.
        let pos = self
            .events
            .iter()
            .position(|e| {
                is_newer_timestamp(e.timestamp, event.timestamp)
                    || (e.timestamp == event.timestamp && event.end_bit && !e.end_bit)
            })
            .unwrap_or(self.events.len());
        self.events.insert(pos, event);
        debug!("DTMF event {} at ts={} queued", event.event_no, event.timestamp);

        if self.events.len() > MAX_EVENTS {
            warn!("DTMF buffer full, dropping oldest event");
            self.events.remove(0);
        }
        Ok(())
    }

    /// The event that should be playing at `current_timestamp`, if any.
    ///
    /// Events that are entirely in the past are dropped. An ended event is
    /// removed once its last frame has been handed out.
    pub fn get_event(&mut self, current_timestamp: u32) -> Option<DtmfEvent> {
        let mut i = 0;
        while i < self.events.len() {
            let event = self.events[i];
            let mut event_end = event.end_timestamp();
            let mut next_available = false;
            if !event.end_bit {
                event_end = event_end.wrapping_add(self.max_extrapolation_samples);
                if let Some(next) = self.events.get(i + 1) {
                    // Never extrapolate over the start of the next event.
                    if is_newer_timestamp(event_end, next.timestamp) {
                        event_end = next.timestamp;
                    }
                    next_available = true;
                }
            }

            let started = !is_newer_timestamp(event.timestamp, current_timestamp);
            let ended = is_newer_timestamp(current_timestamp, event_end);
            if started && !ended {
                let frame_end = current_timestamp.wrapping_add(self.frame_len_samples);
                if event.end_bit && !is_newer_timestamp(event_end, frame_end) {
                    self.events.remove(i);
                }
                return Some(event);
            } else if ended {
                self.events.remove(i);
                if !next_available {
                    // Play the tail of an event that ended between ticks.
                    return Some(event);
                }
            } else {
                i += 1;
            }
        }
        None
    }
}
