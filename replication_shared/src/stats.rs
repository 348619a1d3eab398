//! Replication statistics.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Accumulated counters. Written by the scheduler only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationStatistics {
    pub total_entities_replicated: u64,
    pub bytes_written: u64,
    pub packets_sent: u64,
    pub budget_rejections: u64,
    pub ticks_processed: u64,
    /// Running mean over processed ticks.
    pub average_replication_duration: Duration,
    /// Running mean of payload bytes / state block bytes over accepted sends.
    pub average_compression_ratio: f64,
    /// Reset at the start of every processed tick.
    pub entities_replicated_this_tick: u32,
}

impl ReplicationStatistics {
    pub(crate) fn begin_tick(&mut self) {
        self.entities_replicated_this_tick = 0;
    }

    pub(crate) fn record_send(&mut self, raw_bytes: usize, payload_bytes: usize) {
        self.total_entities_replicated += 1;
        self.entities_replicated_this_tick += 1;
        self.packets_sent += 1;
        self.bytes_written += payload_bytes as u64;

        let ratio = if raw_bytes == 0 {
            1.0
        } else {
            payload_bytes as f64 / raw_bytes as f64
        };
        let n = self.packets_sent as f64;
        self.average_compression_ratio += (ratio - self.average_compression_ratio) / n;
    }

    pub(crate) fn record_rejection(&mut self) {
        self.budget_rejections += 1;
    }

    pub(crate) fn end_tick(&mut self, elapsed: Duration) {
        self.ticks_processed += 1;
        let n = self.ticks_processed as f64;
        let mean = self.average_replication_duration.as_secs_f64();
        let next = mean + (elapsed.as_secs_f64() - mean) / n;
        self.average_replication_duration = Duration::from_secs_f64(next.max(0.0));
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_means() {
        let mut s = ReplicationStatistics::default();
        s.begin_tick();
        s.record_send(36, 36);
        s.record_send(36, 18);
        s.end_tick(Duration::from_millis(2));
        s.begin_tick();
        s.end_tick(Duration::from_millis(4));

        assert_eq!(s.packets_sent, 2);
        assert_eq!(s.bytes_written, 54);
        assert!((s.average_compression_ratio - 0.75).abs() < 1e-9);
        let avg = s.average_replication_duration.as_secs_f64();
        assert!((avg - 0.003).abs() < 1e-6);
        assert_eq!(s.entities_replicated_this_tick, 0);
    }
}
