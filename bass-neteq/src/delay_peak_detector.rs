//! Detection of recurring delay peaks.
//!
//! A peak is an inter-arrival time well above the current target level. Once
//! at least two peaks have been recorded and they keep coming at roughly the
//! cadence they were observed at, the detector reports peak mode and the
//! delay manager raises its target to the largest recent peak.

use std::collections::VecDeque;

use log::debug;

/// Number of (period, height) records kept.
const MAX_NUM_PEAKS: usize = 8;
/// Peaks needed before peak mode can trigger.
const MIN_PEAKS_TO_TRIGGER: usize = 2;
/// Peak height threshold in ms, converted to packets by the packet length.
const PEAK_HEIGHT_MS: i32 = 78;
/// Longest inter-peak period that is still recorded.
const MAX_PEAK_PERIOD_MS: i32 = 10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Peak {
    period_ms: i32,
    peak_height_packets: i32,
}

/// Delay peak detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayPeakDetector {
    peak_history: VecDeque<Peak>,
    peak_found: bool,
    /// Time since the last peak in ms, or None before the first peak.
    peak_period_counter_ms: Option<i32>,
    peak_detection_threshold: i32,
}

impl Default for DelayPeakDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayPeakDetector {
    pub fn new() -> Self {
        Self {
            peak_history: VecDeque::with_capacity(MAX_NUM_PEAKS + 1),
            peak_found: false,
            peak_period_counter_ms: None,
            peak_detection_threshold: 0,
        }
    }

    /// Forget all peaks. The threshold is kept.
    pub fn reset(&mut self) {
        self.peak_period_counter_ms = None;
        self.peak_found = false;
        self.peak_history.clear();
    }

    /// Derive the peak threshold from the packet length.
    pub fn set_packet_audio_length(&mut self, length_ms: i32) {
        if length_ms > 0 {
            self.peak_detection_threshold = PEAK_HEIGHT_MS / length_ms;
        }
    }

    /// Current threshold in packets.
    pub fn threshold(&self) -> i32 {
        self.peak_detection_threshold
    }

    /// Whether peak mode is active.
    pub fn peak_found(&self) -> bool {
        self.peak_found
    }

    /// Number of recorded peaks.
    pub fn num_peaks(&self) -> usize {
        self.peak_history.len()
    }

    /// Largest recorded peak height in packets.
    pub fn max_peak_height(&self) -> Option<i32> {
        self.peak_history.iter().map(|p| p.peak_height_packets).max()
    }

    /// Longest recorded inter-peak period in ms.
    pub fn max_peak_period(&self) -> Option<i32> {
        self.peak_history.iter().map(|p| p.period_ms).max()
    }

    /// Feed one inter-arrival time. Returns whether peak mode is active.
    ///
    /// # Arguments
    /// * `inter_arrival_time` - IAT of the new packet in packets
    /// * `target_level` - Current base target level in packets
    pub fn update(&mut self, inter_arrival_time: i32, target_level: i32) -> bool {
        if inter_arrival_time > target_level + self.peak_detection_threshold
            || inter_arrival_time > 2 * target_level
        {
            match self.peak_period_counter_ms {
                None => {
                    // First peak. Start the period counter.
                    self.peak_period_counter_ms = Some(0);
                }
                Some(period) if period <= MAX_PEAK_PERIOD_MS => {
                    self.peak_history.push_back(Peak {
                        period_ms: period,
                        peak_height_packets: inter_arrival_time,
                    });
                    while self.peak_history.len() > MAX_NUM_PEAKS {
                        self.peak_history.pop_front();
                    }
                    self.peak_period_counter_ms = Some(0);
                }
                Some(period) if period <= 2 * MAX_PEAK_PERIOD_MS => {
                    // Too long since the last peak to record a period, but not
                    // long enough to give up on the history.
                    self.peak_period_counter_ms = Some(0);
                }
                Some(period) => {
                    debug!("No delay peak for {} ms, clearing peak history", period);
                    self.reset();
                }
            }
        }
        self.check_peak_conditions()
    }

    /// Advance the time since the last peak. Does nothing before the first
    /// peak.
    pub fn increment_counter(&mut self, inc_ms: i32) {
        if let Some(counter) = self.peak_period_counter_ms.as_mut() {
            *counter = counter.saturating_add(inc_ms);
        }
    }

    fn check_peak_conditions(&mut self) -> bool {
        let was_found = self.peak_found;
        self.peak_found = match (self.peak_period_counter_ms, self.max_peak_period()) {
            (Some(counter), Some(max_period)) => {
                self.peak_history.len() >= MIN_PEAKS_TO_TRIGGER && counter <= 2 * max_period
            }
            _ => false,
        };
        if self.peak_found != was_found {
            debug!("Delay peak mode {}", if self.peak_found { "on" } else { "off" });
        }
        self.peak_found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_destroy() {
        let detector = DelayPeakDetector::new();
        assert!(!detector.peak_found());
        assert_eq!(detector.max_peak_height(), None);
        assert_eq!(detector.max_peak_period(), None);
    }

    #[test]
    fn test_threshold_follows_packet_length() {
        let mut detector = DelayPeakDetector::new();
        detector.set_packet_audio_length(20);
        assert_eq!(detector.threshold(), 3);
        detector.set_packet_audio_length(10);
        assert_eq!(detector.threshold(), 7);
        // Invalid lengths keep the previous threshold.
        detector.set_packet_audio_length(0);
        assert_eq!(detector.threshold(), 7);
    }

    #[test]
    fn test_empty_history() {
        let mut detector = DelayPeakDetector::new();
        detector.set_packet_audio_length(20);
        // Counter does not run before the first peak.
        detector.increment_counter(100);
        assert!(!detector.update(1, 1));
        assert_eq!(detector.num_peaks(), 0);
    }

    /// Three well separated peaks, then silence. Peak mode starts with the
    /// third peak and ends once twice the worst period has passed.
    #[test]
    fn test_trigger_and_release() {
        const PACKET_LEN_MS: i32 = 20;
        const TARGET: i32 = 1;
        const PEAK_IAT: i32 = 10;
        const PEAK_PERIOD_MS: i32 = 1000;

        let mut detector = DelayPeakDetector::new();
        detector.set_packet_audio_length(PACKET_LEN_MS);

        let mut peaks_seen = 0;
        let mut time_ms = 0;
        while peaks_seen < 3 {
            detector.increment_counter(PACKET_LEN_MS);
            time_ms += PACKET_LEN_MS;
            let iat = if time_ms % PEAK_PERIOD_MS == 0 {
                peaks_seen += 1;
                PEAK_IAT
            } else {
                1
            };
            let found = detector.update(iat, TARGET);
            if peaks_seen < 3 {
                assert!(!found, "peak mode too early at {} ms", time_ms);
            } else {
                assert!(found, "peak mode should start at the third peak");
            }
        }
        assert_eq!(detector.num_peaks(), 2);
        assert_eq!(detector.max_peak_height(), Some(PEAK_IAT));
        assert_eq!(detector.max_peak_period(), Some(PEAK_PERIOD_MS));

        // Quiet period: mode holds until the counter passes twice the period.
        let mut quiet_ms = 0;
        loop {
            detector.increment_counter(PACKET_LEN_MS);
            quiet_ms += PACKET_LEN_MS;
            let found = detector.update(1, TARGET);
            if quiet_ms <= 2 * PEAK_PERIOD_MS {
                assert!(found, "released too early after {} ms", quiet_ms);
            } else {
                assert!(!found);
                break;
            }
        }
    }

    #[test]
    fn test_height_rule_twice_target() {
        let mut detector = DelayPeakDetector::new();
        detector.set_packet_audio_length(20);
        // Threshold is 3. IAT 7 with target 4 is neither above target + 3
        // nor above twice the target.
        detector.update(7, 4);
        assert_eq!(detector.num_peaks(), 0);
        // IAT 9 with target 4 exceeds 2 * target.
        detector.update(9, 4);
        detector.increment_counter(500);
        detector.update(9, 4);
        assert_eq!(detector.num_peaks(), 1);
        assert_eq!(detector.max_peak_period(), Some(500));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut detector = DelayPeakDetector::new();
        detector.set_packet_audio_length(20);
        detector.update(20, 1);
        for i in 0..12 {
            detector.increment_counter(100 + i);
            detector.update(20 + i, 1);
        }
        assert_eq!(detector.num_peaks(), MAX_NUM_PEAKS);
        // Oldest records were evicted.
        assert_eq!(detector.max_peak_period(), Some(111));
        assert_eq!(detector.max_peak_height(), Some(31));
    }

    #[test]
    fn test_stale_peak_restarts_counter() {
        let mut detector = DelayPeakDetector::new();
        detector.set_packet_audio_length(20);
        detector.update(20, 1);
        detector.increment_counter(MAX_PEAK_PERIOD_MS + 1);
        detector.update(20, 1);
        // Too late to record, not late enough to reset.
        assert_eq!(detector.num_peaks(), 0);
        detector.increment_counter(100);
        detector.update(20, 1);
        assert_eq!(detector.num_peaks(), 1);
        assert_eq!(detector.max_peak_period(), Some(100));
    }

    #[test]
    fn test_very_old_peak_resets_history() {
        let mut detector = DelayPeakDetector::new();
        detector.set_packet_audio_length(20);
        detector.update(20, 1);
        detector.increment_counter(100);
        detector.update(20, 1);
        assert_eq!(detector.num_peaks(), 1);

        detector.increment_counter(2 * MAX_PEAK_PERIOD_MS + 1);
        assert!(!detector.update(20, 1));
        assert_eq!(detector.num_peaks(), 0);
        // Counter is stopped again until the next peak.
        detector.increment_counter(100);
        detector.update(20, 1);
        assert_eq!(detector.num_peaks(), 0);
    }

    #[test]
    fn test_period_counter_saturates() {
        let mut detector = DelayPeakDetector::new();
        detector.set_packet_audio_length(20);
        detector.update(20, 1);
        detector.increment_counter(i32::MAX);
        detector.increment_counter(i32::MAX);
        assert_eq!(detector.peak_period_counter_ms, Some(i32::MAX));
        // Still far past twice the longest period, so the history is cleared.
        assert!(!detector.update(20, 1));
        assert_eq!(detector.num_peaks(), 0);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut detector = DelayPeakDetector::new();
        detector.set_packet_audio_length(20);
        detector.update(20, 1);
        detector.increment_counter(100);
        detector.update(20, 1);

        detector.reset();
        let once = format!("{:?}", detector);
        detector.reset();
        assert_eq!(format!("{:?}", detector), once);
        assert_eq!(detector.threshold(), 3);
    }
}
