// Copyright (C) 2023 the airstream authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rolling per-packet observations and windowed reception statistics.

use crate::rtp::media_timestamp_to_micros;

/// Fixed capacity of the ring. At typical full-rate streaming (~1,500
/// packets/sec) this covers a bit over a second of lookback.
pub(crate) const MONITORING_MAX_POINTS: usize = 2048;

#[derive(Copy, Clone, Default)]
struct MonitoringPoint {
    /// Reception time, microseconds on the reader's monotonic clock.
    recv_timestamp: u64,

    /// Media timestamp from the wire, 90 kHz units.
    timestamp: u32,

    seq_num: u16,
    marker: bool,
    bytes: u32,
}

/// Aggregate reception statistics over a lookback window.
///
/// Produced by [`crate::stream::StreamReader::monitoring`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MonitoringStats {
    /// Reception time actually covered by the walk. May exceed the requested
    /// interval by up to one inter-packet spacing, or fall short when the
    /// ring holds less history than requested.
    pub real_interval_us: u64,

    /// Standard deviation of per-packet reception delay (reception time
    /// minus media time), microseconds.
    pub reception_time_jitter_us: u32,

    pub bytes_received: u32,
    pub mean_packet_size: u32,
    pub packet_size_std_dev: u32,
    pub packets_received: u32,

    /// Sequence-number gaps observed within the window. Can go negative if
    /// reordered packets were recorded.
    pub packets_missed: i64,
}

/// The ring itself. No interior locking; the owning reader serializes access
/// under its monitoring mutex.
pub(crate) struct MonitoringRing {
    /// Media timestamp of the first packet ever recorded, the anchor for
    /// converting wire timestamps to relative microseconds.
    first_timestamp: Option<u32>,

    /// Number of valid points, saturating at [`MONITORING_MAX_POINTS`].
    count: usize,

    /// Most recently written slot.
    index: usize,

    points: Box<[MonitoringPoint]>,
}

impl MonitoringRing {
    pub(crate) fn new() -> Self {
        Self {
            first_timestamp: None,
            count: 0,
            index: 0,
            points: vec![MonitoringPoint::default(); MONITORING_MAX_POINTS].into_boxed_slice(),
        }
    }

    pub(crate) fn record(
        &mut self,
        recv_timestamp: u64,
        timestamp: u32,
        seq_num: u16,
        marker: bool,
        bytes: u32,
    ) {
        if self.first_timestamp.is_none() {
            self.first_timestamp = Some(timestamp);
        }
        if self.count < MONITORING_MAX_POINTS {
            self.count += 1;
        }
        self.index = (self.index + 1) % MONITORING_MAX_POINTS;
        self.points[self.index] = MonitoringPoint {
            recv_timestamp,
            timestamp,
            seq_num,
            marker,
            bytes,
        };
    }

    /// Media time of `p` relative to the first recorded packet, microseconds.
    fn media_rel_micros(&self, p: &MonitoringPoint) -> u64 {
        let first = self.first_timestamp.unwrap_or(0);
        media_timestamp_to_micros(p.timestamp.wrapping_sub(first))
    }

    /// Walks backward from the most recent point until `interval_us` of
    /// reception time or the whole ring, whichever comes first. Returns
    /// `None` if nothing has been recorded yet.
    pub(crate) fn query(&self, interval_us: u64) -> Option<MonitoringStats> {
        if self.count == 0 {
            return None;
        }

        let mut idx = self.index;
        let p = &self.points[idx];
        let start_time = p.recv_timestamp;
        let mut cur_time = start_time;
        let mut bytes_sum = u64::from(p.bytes);
        let mut delay_sum = p.recv_timestamp as i64 - self.media_rel_micros(p) as i64;
        let mut previous_seq = p.seq_num;
        let mut gaps = 0i64;
        let mut points = 1usize;

        while start_time - cur_time < interval_us && points < self.count {
            idx = idx.checked_sub(1).unwrap_or(MONITORING_MAX_POINTS - 1);
            let p = &self.points[idx];
            cur_time = p.recv_timestamp;
            bytes_sum += u64::from(p.bytes);
            delay_sum += p.recv_timestamp as i64 - self.media_rel_micros(p) as i64;
            let delta = i64::from(previous_seq.wrapping_sub(p.seq_num) as i16);
            gaps += delta - 1;
            previous_seq = p.seq_num;
            points += 1;
        }
        let end_time = cur_time;

        let mean_packet_size = (bytes_sum / points as u64) as u32;
        let mean_delay = delay_sum / points as i64;

        // Second pass over the same window for the variances.
        let mut size_var_sum = 0f64;
        let mut delay_var_sum = 0f64;
        let mut idx = self.index;
        for i in 0..points {
            let p = &self.points[idx];
            let size_diff = f64::from(p.bytes) - f64::from(mean_packet_size);
            size_var_sum += size_diff * size_diff;
            let delay = p.recv_timestamp as i64 - self.media_rel_micros(p) as i64;
            let delay_diff = (delay - mean_delay) as f64;
            delay_var_sum += delay_diff * delay_diff;
            if i + 1 < points {
                idx = idx.checked_sub(1).unwrap_or(MONITORING_MAX_POINTS - 1);
            }
        }

        Some(MonitoringStats {
            real_interval_us: start_time - end_time,
            reception_time_jitter_us: (delay_var_sum / points as f64).sqrt() as u32,
            bytes_received: bytes_sum as u32,
            mean_packet_size,
            packet_size_std_dev: (size_var_sum / points as f64).sqrt() as u32,
            packets_received: points as u32,
            packets_missed: gaps,
        })
    }
}
