//! Heartbeat monitor
//!
//! Decides, on each heartbeat tick, whether to send another `ping` or to
//! declare the peer dead. Without a pong timeout the peer is never declared
//! dead; a silent connection is left to the transport to notice.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// What the session should do on a heartbeat tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a `ping`
    SendPing,
    /// No `pong` for too long; force the connection closed
    PeerDead { silent_for: Duration },
}

/// Per-connection heartbeat bookkeeping
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    pong_timeout: Option<Duration>,
    /// Oldest ping not yet answered
    awaiting_since: Option<Instant>,
    last_pong: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, pong_timeout: Option<Duration>) -> Self {
        Self {
            interval,
            pong_timeout: pong_timeout.filter(|t| !t.is_zero()),
            awaiting_since: None,
            last_pong: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Timer for this monitor; the first tick fires one interval from now.
    pub fn ticker(&self) -> Interval {
        let period = self.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    pub fn on_tick(&mut self, now: Instant) -> HeartbeatAction {
        if let (Some(timeout), Some(since)) = (self.pong_timeout, self.awaiting_since) {
            let silent_for = now.saturating_duration_since(since);
            if silent_for >= timeout {
                return HeartbeatAction::PeerDead { silent_for };
            }
        }

        if self.awaiting_since.is_none() {
            self.awaiting_since = Some(now);
        }
        HeartbeatAction::SendPing
    }

    pub fn on_pong(&mut self, now: Instant) {
        self.awaiting_since = None;
        self.last_pong = Some(now);
    }

    pub fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }

    pub fn is_awaiting_pong(&self) -> bool {
        self.awaiting_since.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn test_never_dead_without_timeout() {
        let mut monitor = HeartbeatMonitor::new(30 * SECOND, None);
        let start = Instant::now();
        for n in 0..100 {
            assert_eq!(monitor.on_tick(start + n * 30 * SECOND), HeartbeatAction::SendPing);
        }
    }

    #[test]
    fn test_zero_timeout_means_disabled() {
        let mut monitor = HeartbeatMonitor::new(SECOND, Some(Duration::ZERO));
        let start = Instant::now();
        monitor.on_tick(start);
        assert_eq!(monitor.on_tick(start + 3600 * SECOND), HeartbeatAction::SendPing);
    }

    #[test]
    fn test_dead_after_unanswered_pings() {
        let mut monitor = HeartbeatMonitor::new(30 * SECOND, Some(60 * SECOND));
        let start = Instant::now();

        assert_eq!(monitor.on_tick(start), HeartbeatAction::SendPing);
        assert!(monitor.is_awaiting_pong());
        assert_eq!(monitor.on_tick(start + 30 * SECOND), HeartbeatAction::SendPing);
        assert_eq!(
            monitor.on_tick(start + 60 * SECOND),
            HeartbeatAction::PeerDead { silent_for: 60 * SECOND }
        );
    }

    #[test]
    fn test_pong_clears_pending_ping() {
        let mut monitor = HeartbeatMonitor::new(30 * SECOND, Some(45 * SECOND));
        let start = Instant::now();

        monitor.on_tick(start);
        monitor.on_pong(start + SECOND);
        assert!(!monitor.is_awaiting_pong());
        assert_eq!(monitor.last_pong(), Some(start + SECOND));

        assert_eq!(monitor.on_tick(start + 30 * SECOND), HeartbeatAction::SendPing);
        assert_eq!(monitor.on_tick(start + 60 * SECOND), HeartbeatAction::SendPing);
    }
}
