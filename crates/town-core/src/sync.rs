//! Client-side playback of server time. The engine commits steps on its own
//! cadence; a client replays the covered intervals against its monotonic
//! clock, speeding up or slowing down to keep a healthy buffer, and never
//! extrapolates past received data.

use std::fmt;

use contracts::constants::{
    FAST_PLAYBACK_RATE, MAX_SERVER_BUFFER, SLOW_PLAYBACK_RATE, SOFT_MAX_SERVER_BUFFER,
    SOFT_MIN_SERVER_BUFFER,
};
use contracts::ServerTimeInterval;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// A status arrived whose interval starts before already-received time.
    OutOfOrderStatus,
    /// No status has been received yet.
    NoServerTime,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfOrderStatus => write!(f, "engine status arrived out of order"),
            Self::NoServerTime => write!(f, "no engine status received yet"),
        }
    }
}

impl std::error::Error for SyncError {}

#[derive(Debug, Default)]
pub struct HistoricalTime {
    intervals: Vec<ServerTimeInterval>,
    prev_client_ts: Option<f64>,
    prev_server_ts: Option<f64>,
}

impl HistoricalTime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one engine status. Contiguous statuses extend the newest
    /// interval; a gap (engine restart) opens a new one; anything moving
    /// backwards is fatal to this feed.
    pub fn receive(&mut self, interval: ServerTimeInterval) -> Result<(), SyncError> {
        if interval.end_ts < interval.start_ts {
            return Err(SyncError::OutOfOrderStatus);
        }
        let Some(last) = self.intervals.last_mut() else {
            self.intervals.push(interval);
            return Ok(());
        };

        if interval.start_ts < last.end_ts {
            return Err(SyncError::OutOfOrderStatus);
        }
        if interval.start_ts == last.end_ts {
            last.end_ts = last.end_ts.max(interval.end_ts);
        } else {
            self.intervals.push(interval);
        }
        Ok(())
    }

    /// Amount of received server time ahead of the playback cursor.
    pub fn buffer_health(&self) -> f64 {
        match (self.intervals.last(), self.prev_server_ts) {
            (Some(last), Some(prev)) => last.end_ts - prev,
            (Some(last), None) => last.end_ts - self.intervals[0].start_ts,
            _ => 0.0,
        }
    }

    /// Advance the playback cursor for a frame at client wallclock
    /// `client_now` and return the historical server timestamp to render.
    pub fn server_time(&mut self, client_now: f64) -> Result<f64, SyncError> {
        let first = *self.intervals.first().ok_or(SyncError::NoServerTime)?;
        let last_server = self
            .intervals
            .last()
            .map(|interval| interval.end_ts)
            .unwrap_or(first.end_ts);

        let prev_client = self.prev_client_ts.unwrap_or(client_now);
        let prev_server = self.prev_server_ts.unwrap_or(first.start_ts);

        let buffer = last_server - prev_server;
        let rate = if buffer < SOFT_MIN_SERVER_BUFFER {
            SLOW_PLAYBACK_RATE
        } else if buffer > SOFT_MAX_SERVER_BUFFER {
            FAST_PLAYBACK_RATE
        } else {
            1.0
        };

        let mut server_ts = (prev_server + (client_now - prev_client) * rate)
            .max(last_server - MAX_SERVER_BUFFER)
            .min(last_server);

        // Snap forward over gaps between intervals.
        let mut enclosing = 0;
        for (index, interval) in self.intervals.iter().enumerate() {
            if server_ts <= interval.end_ts {
                if server_ts < interval.start_ts {
                    server_ts = interval.start_ts;
                }
                enclosing = index;
                break;
            }
            enclosing = index;
        }

        // Keep the enclosing interval and its predecessor; older ones are
        // no longer addressable by a monotone cursor.
        if enclosing > 1 {
            self.intervals.drain(..enclosing - 1);
        }

        self.prev_client_ts = Some(client_now);
        self.prev_server_ts = Some(server_ts);
        Ok(server_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval(start_ts: f64, end_ts: f64) -> ServerTimeInterval {
        ServerTimeInterval { start_ts, end_ts }
    }

    #[test]
    fn contiguous_statuses_extend_the_newest_interval() {
        let mut sync = HistoricalTime::new();
        sync.receive(interval(0.0, 1000.0)).expect("first");
        sync.receive(interval(1000.0, 2000.0)).expect("extension");
        assert_eq!(sync.intervals.len(), 1);
        assert_eq!(sync.intervals[0].end_ts, 2000.0);

        sync.receive(interval(5000.0, 6000.0)).expect("gap");
        assert_eq!(sync.intervals.len(), 2);
    }

    #[test]
    fn regressing_status_is_fatal() {
        let mut sync = HistoricalTime::new();
        sync.receive(interval(0.0, 1000.0)).expect("first");
        assert_eq!(
            sync.receive(interval(500.0, 1500.0)),
            Err(SyncError::OutOfOrderStatus)
        );
        assert_eq!(
            sync.receive(interval(3000.0, 2500.0)),
            Err(SyncError::OutOfOrderStatus)
        );
    }

    #[test]
    fn deep_buffer_plays_back_at_the_fast_rate() {
        let mut sync = HistoricalTime::new();
        sync.receive(interval(0.0, 1000.0)).expect("a");
        sync.receive(interval(1000.0, 2000.0)).expect("b");

        // Prime the cursor at client time 0 / server time 0.
        let first = sync.server_time(0.0).expect("prime");
        assert_eq!(first, 750.0); // clamped up to last_server - 1250

        sync.prev_server_ts = Some(0.0);
        sync.prev_client_ts = Some(0.0);
        let ts = sync.server_time(1000.0).expect("frame");
        assert_eq!(ts, 1200.0);
    }

    #[test]
    fn cursor_never_passes_received_server_time() {
        let mut sync = HistoricalTime::new();
        sync.receive(interval(0.0, 400.0)).expect("short");
        let mut last = 0.0;
        for frame in 0..100 {
            let ts = sync.server_time(frame as f64 * 100.0).expect("frame");
            assert!(ts <= 400.0);
            assert!(ts >= last);
            last = ts;
        }
        assert_eq!(last, 400.0);
    }

    #[test]
    fn cursor_is_monotone_for_a_fixed_interval_list() {
        let mut sync = HistoricalTime::new();
        sync.receive(interval(0.0, 3000.0)).expect("span");
        let mut last = f64::MIN;
        for frame in 0..50 {
            let ts = sync.server_time(frame as f64 * 33.0).expect("frame");
            assert!(ts >= last, "cursor moved backwards at frame {frame}");
            last = ts;
        }
    }

    #[test]
    fn gaps_snap_forward_to_the_next_interval() {
        let mut sync = HistoricalTime::new();
        sync.receive(interval(0.0, 100.0)).expect("old");
        sync.receive(interval(10_000.0, 11_000.0)).expect("fresh");

        let ts = sync.server_time(0.0).expect("frame");
        // Inside the gap the cursor lands on the fresh interval's start or
        // beyond, never between intervals.
        assert!(ts >= 10_000.0 - MAX_SERVER_BUFFER);
        assert!((10_000.0..=11_000.0).contains(&ts));
    }

    #[test]
    fn stale_intervals_are_trimmed() {
        let mut sync = HistoricalTime::new();
        sync.receive(interval(0.0, 10.0)).expect("a");
        sync.receive(interval(100.0, 110.0)).expect("b");
        sync.receive(interval(200.0, 210.0)).expect("c");
        sync.receive(interval(300.0, 10_000.0)).expect("d");

        sync.server_time(0.0).expect("frame");
        assert!(sync.intervals.len() <= 2);
    }

    #[test]
    fn buffer_health_tracks_the_cursor() {
        let mut sync = HistoricalTime::new();
        sync.receive(interval(0.0, 2000.0)).expect("span");
        sync.server_time(0.0).expect("frame");
        let health = sync.buffer_health();
        assert!(health >= 0.0);
        assert!(health <= 2000.0);
    }

    #[test]
    fn empty_feed_reports_no_server_time() {
        let mut sync = HistoricalTime::new();
        assert_eq!(sync.server_time(0.0), Err(SyncError::NoServerTime));
    }
}
