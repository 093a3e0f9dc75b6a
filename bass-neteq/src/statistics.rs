//! Network and playout statistics.
//!
//! Rates are reported in Q14 (16384 = 100%) over the period since the last
//! report. Reading the statistics starts a new period.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

use crate::decision_logic::Operation;
use crate::delay_manager::DelayManager;
use crate::error::{NetEqError, Result};

/// Waiting times kept for reporting.
const MAX_WAITING_TIMES: usize = 100;
/// Loss and discard counters restart after this long without a report.
const MAX_REPORT_PERIOD_S: u32 = 60;

/// Snapshot returned by [`NetEq::network_statistics`](crate::NetEq::network_statistics).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStatistics {
    /// Audio in the packet and sync buffers.
    pub current_buffer_size_ms: u32,
    /// Target buffer size.
    pub preferred_buffer_size_ms: u32,
    /// Peak mode is active.
    pub jitter_peaks_found: bool,
    /// Q14 fractions of the report period.
    pub packet_loss_rate: u16,
    pub packet_discard_rate: u16,
    pub expand_rate: u16,
    /// Expansion of voiced audio only.
    pub speech_expand_rate: u16,
    pub preemptive_rate: u16,
    pub accelerate_rate: u16,
    pub clockdrift_ppm: i32,
    /// Zero samples inserted by the off playout mode.
    pub added_zero_samples: u32,
    /// Packet waiting times in the buffer; -1 when no packet was played.
    pub mean_waiting_time_ms: i32,
    pub median_waiting_time_ms: i32,
    pub min_waiting_time_ms: i32,
    pub max_waiting_time_ms: i32,
}

fn q14_percent(rate: u16) -> f64 {
    rate as f64 * 100.0 / 16384.0
}

impl NetworkStatistics {
    /// One-line summary for logs and status displays.
    pub fn format_display(&self) -> String {
        let peak_indicator = if self.jitter_peaks_found { " [PEAKS]" } else { "" };
        format!(
            "Buffer: {}ms (pref {}ms), Loss: {:.1}%, Expand: {:.1}%, Accel: {:.1}%, Preempt: {:.1}%, Drift: {:+}ppm{}",
            self.current_buffer_size_ms,
            self.preferred_buffer_size_ms,
            q14_percent(self.packet_loss_rate),
            q14_percent(self.expand_rate),
            q14_percent(self.accelerate_rate),
            q14_percent(self.preemptive_rate),
            self.clockdrift_ppm,
            peak_indicator
        )
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| NetEqError::InvalidConfig(e.to_string()))
    }
}

/// `numerator / denominator` in Q14, saturating at 1.
fn q14_ratio(numerator: u32, denominator: u32) -> u16 {
    if numerator == 0 {
        0
    } else if numerator < denominator {
        (((numerator as u64) << 14) / denominator as u64) as u16
    } else {
        1 << 14
    }
}

/// Collects the counters behind [`NetworkStatistics`].
#[derive(Debug, Clone, Default)]
pub struct StatisticsCalculator {
    preemptive_samples: u32,
    accelerate_samples: u32,
    added_zero_samples: u32,
    expanded_voice_samples: u32,
    expanded_noise_samples: u32,
    discarded_packets: u32,
    lost_timestamps: u32,
    timestamps_since_last_report: u32,
    waiting_times: VecDeque<i32>,
    operation_counts: BTreeMap<Operation, u64>,
}

impl StatisticsCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the time-stretch and concealment counters.
    pub fn reset(&mut self) {
        self.preemptive_samples = 0;
        self.accelerate_samples = 0;
        self.added_zero_samples = 0;
        self.expanded_voice_samples = 0;
        self.expanded_noise_samples = 0;
    }

    /// Clear the loss and discard counters and restart the report period.
    pub fn reset_mcu(&mut self) {
        self.discarded_packets = 0;
        self.lost_timestamps = 0;
        self.timestamps_since_last_report = 0;
    }

    pub fn expanded_voice_samples(&mut self, num_samples: usize) {
        self.expanded_voice_samples = self.expanded_voice_samples.saturating_add(num_samples as u32);
    }

    pub fn expanded_noise_samples(&mut self, num_samples: usize) {
        self.expanded_noise_samples = self.expanded_noise_samples.saturating_add(num_samples as u32);
    }

    pub fn preemptive_expanded_samples(&mut self, num_samples: usize) {
        self.preemptive_samples = self.preemptive_samples.saturating_add(num_samples as u32);
    }

    pub fn accelerated_samples(&mut self, num_samples: usize) {
        self.accelerate_samples = self.accelerate_samples.saturating_add(num_samples as u32);
    }

    pub fn add_zeros(&mut self, num_samples: usize) {
        self.added_zero_samples = self.added_zero_samples.saturating_add(num_samples as u32);
    }

    pub fn packets_discarded(&mut self, num_packets: usize) {
        self.discarded_packets = self.discarded_packets.saturating_add(num_packets as u32);
    }

    pub fn lost_samples(&mut self, num_samples: u32) {
        self.lost_timestamps = self.lost_timestamps.saturating_add(num_samples);
    }

    /// Advance the report period by one output frame.
    pub fn increase_counter(&mut self, num_samples: usize, fs_hz: u32) {
        self.timestamps_since_last_report = self.timestamps_since_last_report.saturating_add(num_samples as u32);
        if self.timestamps_since_last_report > fs_hz * MAX_REPORT_PERIOD_S {
            self.lost_timestamps = 0;
            self.discarded_packets = 0;
            self.timestamps_since_last_report = 0;
        }
    }

    pub fn store_waiting_time(&mut self, waiting_time_ms: i32) {
        self.waiting_times.push_back(waiting_time_ms);
        if self.waiting_times.len() > MAX_WAITING_TIMES {
            self.waiting_times.pop_front();
        }
    }

    /// Stored waiting times, oldest first.
    pub fn waiting_times(&self) -> Vec<i32> {
        self.waiting_times.iter().copied().collect()
    }

    pub fn reset_waiting_times(&mut self) {
        self.waiting_times.clear();
    }

    pub fn count_operation(&mut self, operation: Operation) {
        *self.operation_counts.entry(operation).or_insert(0) += 1;
    }

    /// Ticks spent in each operation since the engine was created.
    pub fn operation_counts(&self) -> &BTreeMap<Operation, u64> {
        &self.operation_counts
    }

    pub fn operation_count(&self, operation: Operation) -> u64 {
        self.operation_counts.get(&operation).copied().unwrap_or(0)
    }

    /// Build the report and start a new period.
    ///
    /// # Arguments
    /// * `num_samples_in_buffers` - Samples per channel in the packet and sync buffers
    /// * `samples_per_packet` - Last decoded frame length, for the discard rate
    /// * `packet_length_samples` - Packet length used by the decision logic
    pub fn get_network_statistics(
        &mut self,
        fs_hz: u32,
        num_samples_in_buffers: usize,
        samples_per_packet: usize,
        packet_length_samples: i32,
        delay_manager: &DelayManager,
    ) -> NetworkStatistics {
        if fs_hz == 0 {
            return NetworkStatistics::default();
        }
        let ms_per_packet = packet_length_samples.max(0) as u32 / (fs_hz / 1000);
        let period = self.timestamps_since_last_report;
        let discarded_samples = self.discarded_packets.saturating_mul(samples_per_packet as u32);

        let mut sorted: Vec<i32> = self.waiting_times.iter().copied().collect();
        sorted.sort_unstable();
        let (mean, median, min, max) = match (sorted.first(), sorted.last()) {
            (Some(&min), Some(&max)) => {
                let n = sorted.len();
                let mean = (sorted.iter().map(|&t| t as i64).sum::<i64>() / n as i64) as i32;
                let median = if n % 2 == 0 {
                    (sorted[n / 2 - 1] + sorted[n / 2]) / 2
                } else {
                    sorted[n / 2]
                };
                (mean, median, min, max)
            }
            _ => (-1, -1, -1, -1),
        };

        let stats = NetworkStatistics {
            current_buffer_size_ms: (num_samples_in_buffers as u64 * 1000 / fs_hz as u64) as u32,
            preferred_buffer_size_ms: (delay_manager.target_level() >> 8).max(0) as u32 * ms_per_packet,
            jitter_peaks_found: delay_manager.peak_found(),
            packet_loss_rate: q14_ratio(self.lost_timestamps, period),
            packet_discard_rate: q14_ratio(discarded_samples, period),
            expand_rate: q14_ratio(self.expanded_voice_samples + self.expanded_noise_samples, period),
            speech_expand_rate: q14_ratio(self.expanded_voice_samples, period),
            preemptive_rate: q14_ratio(self.preemptive_samples, period),
            accelerate_rate: q14_ratio(self.accelerate_samples, period),
            clockdrift_ppm: delay_manager.average_iat_ppm(),
            added_zero_samples: self.added_zero_samples,
            mean_waiting_time_ms: mean,
            median_waiting_time_ms: median,
            min_waiting_time_ms: min,
            max_waiting_time_ms: max,
        };

        self.reset();
        self.reset_mcu();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_q14_ratio() {
        assert_eq!(q14_ratio(0, 0), 0);
        assert_eq!(q14_ratio(0, 100), 0);
        assert_eq!(q14_ratio(50, 100), 8192);
        assert_eq!(q14_ratio(100, 100), 16384);
        assert_eq!(q14_ratio(500, 100), 16384);
    }

    #[test]
    fn test_rates_and_reset() {
        let mut stats = StatisticsCalculator::new();
        let dm = DelayManager::new(50);
        for _ in 0..10 {
            stats.increase_counter(80, 8000);
        }
        stats.expanded_voice_samples(80);
        stats.expanded_noise_samples(80);
        stats.accelerated_samples(40);
        stats.lost_samples(160);
        stats.packets_discarded(1);

        let report = stats.get_network_statistics(8000, 800, 160, 160, &dm);
        assert_eq!(report.current_buffer_size_ms, 100);
        assert_eq!(report.expand_rate, (160 << 14) / 800);
        assert_eq!(report.speech_expand_rate, (80 << 14) / 800);
        assert_eq!(report.accelerate_rate, (40 << 14) / 800);
        assert_eq!(report.packet_loss_rate, (160 << 14) / 800);
        assert_eq!(report.packet_discard_rate, (160 << 14) / 800);
        // Default target of 4 packets of 20 ms.
        assert_eq!(report.preferred_buffer_size_ms, 80);

        let second = stats.get_network_statistics(8000, 0, 160, 160, &dm);
        assert_eq!(second.expand_rate, 0);
        assert_eq!(second.packet_loss_rate, 0);
    }

    #[test]
    fn test_report_period_expires() {
        let mut stats = StatisticsCalculator::new();
        stats.lost_samples(1000);
        // 60 s plus one frame at 8 kHz.
        for _ in 0..6001 {
            stats.increase_counter(80, 8000);
        }
        let dm = DelayManager::new(50);
        assert_eq!(stats.get_network_statistics(8000, 0, 80, 80, &dm).packet_loss_rate, 0);
    }

    #[test]
    fn test_waiting_times() {
        let mut stats = StatisticsCalculator::new();
        let dm = DelayManager::new(50);
        let empty = stats.get_network_statistics(16000, 0, 320, 320, &dm);
        assert_eq!(empty.mean_waiting_time_ms, -1);

        for t in [10, 40, 20, 30] {
            stats.store_waiting_time(t);
        }
        let report = stats.get_network_statistics(16000, 0, 320, 320, &dm);
        assert_eq!(report.mean_waiting_time_ms, 25);
        assert_eq!(report.median_waiting_time_ms, 25);
        assert_eq!(report.min_waiting_time_ms, 10);
        assert_eq!(report.max_waiting_time_ms, 40);

        for t in 0..150 {
            stats.store_waiting_time(t);
        }
        let times = stats.waiting_times();
        assert_eq!(times.len(), MAX_WAITING_TIMES);
        assert_eq!(times[0], 50);
        stats.reset_waiting_times();
        assert!(stats.waiting_times().is_empty());
    }

    #[test]
    fn test_operation_counts() {
        let mut stats = StatisticsCalculator::new();
        stats.count_operation(Operation::Normal);
        stats.count_operation(Operation::Normal);
        stats.count_operation(Operation::Expand);
        assert_eq!(stats.operation_count(Operation::Normal), 2);
        assert_eq!(stats.operation_count(Operation::Merge), 0);
        assert_eq!(stats.operation_counts().len(), 2);
    }

    #[test]
    fn test_display_and_json() {
        let stats = NetworkStatistics {
            current_buffer_size_ms: 60,
            preferred_buffer_size_ms: 40,
            packet_loss_rate: 1638,
            clockdrift_ppm: 12,
            ..Default::default()
        };
        let line = stats.format_display();
        assert!(line.starts_with("Buffer: 60ms (pref 40ms), Loss: 10.0%"));
        assert!(line.contains("Drift: +12ppm"));

        let json = stats.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["preferred_buffer_size_ms"], 40);
        assert_eq!(value["jitter_peaks_found"], false);
    }
}
