//! Reconnect backoff policy
//!
//! Consumer-side: the scheduler that owns `request_connect` decides when a
//! failed server may be retried. Only failed connection attempts advance the
//! counter; a later disconnect of an established link does not, unless the
//! notice flags it as a connect failure. A successful connection clears the
//! recorded error immediately but leaves the failure counter in place until
//! the caller explicitly clears it.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::broker::LinkNotice;
use crate::config::BackoffConfig;
use crate::server_id::ServerId;

/// Per-server backoff bookkeeping
#[derive(Debug, Clone, Default)]
pub struct BackoffState {
    /// Failed connection attempts since the last explicit clear
    pub consecutive_failures: u32,
    /// When the most recent attempt failed
    pub last_error_at: Option<Instant>,
    /// Cause of the most recent failure; cleared on success
    pub last_error: Option<String>,
}

impl BackoffState {
    /// Earliest instant a reconnect may be attempted, if a failure is on
    /// record.
    ///
    /// `last_error + base_delay * factor^min(max(n,1)-1, max_steps)`; with
    /// the default configuration the delays for 1..=6 failures are 60, 240,
    /// 960, 3840, 15360, and 61440 seconds, plateauing thereafter.
    pub fn reconnect_deadline(&self, config: &BackoffConfig) -> Option<Instant> {
        let at = self.last_error_at?;
        let exponent = self
            .consecutive_failures
            .max(1)
            .saturating_sub(1)
            .min(config.max_steps);
        let multiplier = (config.factor as u64).pow(exponent);
        Some(at + config.base_delay * multiplier as u32)
    }
}

/// Tracks backoff state for every server the scheduler cares about
pub struct ReconnectTracker {
    config: BackoffConfig,
    servers: BTreeMap<ServerId, BackoffState>,
}

impl ReconnectTracker {
    /// Create a tracker with the given policy parameters
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            servers: BTreeMap::new(),
        }
    }

    /// Record a failed connection attempt at the current time.
    pub fn record_failure(&mut self, server: &ServerId, error: Option<String>) {
        self.record_failure_at(server, error, Instant::now());
    }

    /// Record a failed connection attempt at an explicit time.
    pub fn record_failure_at(
        &mut self,
        server: &ServerId,
        error: Option<String>,
        at: Instant,
    ) {
        let state = self.servers.entry(server.clone()).or_default();
        state.consecutive_failures += 1;
        state.last_error_at = Some(at);
        state.last_error = error;
    }

    /// Record a successful connection: clears the error immediately, keeps
    /// the failure counter until [`clear_failures`](Self::clear_failures).
    pub fn record_success(&mut self, server: &ServerId) {
        if let Some(state) = self.servers.get_mut(server) {
            state.last_error = None;
        }
    }

    /// Reset the failure counter, e.g. after a period of stable operation.
    pub fn clear_failures(&mut self, server: &ServerId) {
        if let Some(state) = self.servers.get_mut(server) {
            state.consecutive_failures = 0;
            state.last_error_at = None;
        }
    }

    /// Forget the server entirely.
    pub fn remove(&mut self, server: &ServerId) {
        self.servers.remove(server);
    }

    /// Current failure count for the server.
    pub fn consecutive_failures(&self, server: &ServerId) -> u32 {
        self.servers
            .get(server)
            .map_or(0, |s| s.consecutive_failures)
    }

    /// Backoff state for the server, if any is on record.
    pub fn state(&self, server: &ServerId) -> Option<&BackoffState> {
        self.servers.get(server)
    }

    /// Earliest instant a reconnect may be attempted.
    pub fn reconnect_deadline(&self, server: &ServerId) -> Option<Instant> {
        self.servers
            .get(server)?
            .reconnect_deadline(&self.config)
    }

    /// Whether the scheduler may issue a connect request at `now`.
    pub fn ready_at(&self, server: &ServerId, now: Instant) -> bool {
        match self.reconnect_deadline(server) {
            Some(deadline) => now >= deadline,
            None => true,
        }
    }

    /// Fold a worker notice into the policy: failed connection attempts
    /// advance the counter, successful connections clear the error.
    pub fn observe(&mut self, notice: &LinkNotice) {
        match notice {
            LinkNotice::Connected { server, .. } => self.record_success(server),
            LinkNotice::Disconnected {
                server,
                error: Some(err),
                during_connect: true,
            } => self.record_failure(server, Some(err.to_string())),
            LinkNotice::Disconnected { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn server() -> ServerId {
        ServerId::new("kas.example.com", 8471)
    }

    #[test]
    fn test_deadline_table_and_plateau() {
        let config = BackoffConfig::default();
        let mut tracker = ReconnectTracker::new(config);
        let t0 = Instant::now();

        let expected = [60u64, 240, 960, 3840, 15360, 61440, 61440, 61440];
        for delay in expected {
            tracker.record_failure_at(&server(), None, t0);
            let deadline = tracker.reconnect_deadline(&server()).unwrap();
            assert_eq!(deadline - t0, Duration::from_secs(delay));
        }
    }

    #[test]
    fn test_three_failures_give_960s() {
        let mut tracker = ReconnectTracker::new(BackoffConfig::default());
        let t0 = Instant::now();

        for _ in 0..3 {
            tracker.record_failure_at(&server(), Some("connection refused".into()), t0);
        }

        assert_eq!(tracker.consecutive_failures(&server()), 3);
        let deadline = tracker.reconnect_deadline(&server()).unwrap();
        assert_eq!(deadline, t0 + Duration::from_secs(960));
        assert!(!tracker.ready_at(&server(), t0));
        assert!(tracker.ready_at(&server(), t0 + Duration::from_secs(960)));
    }

    #[test]
    fn test_success_clears_error_but_not_counter() {
        let mut tracker = ReconnectTracker::new(BackoffConfig::default());
        tracker.record_failure(&server(), Some("refused".into()));
        tracker.record_failure(&server(), Some("refused".into()));

        tracker.record_success(&server());

        let state = tracker.state(&server()).unwrap();
        assert_eq!(state.consecutive_failures, 2);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_clear_failures_resets() {
        let mut tracker = ReconnectTracker::new(BackoffConfig::default());
        tracker.record_failure(&server(), None);
        tracker.record_failure(&server(), None);

        tracker.clear_failures(&server());

        assert_eq!(tracker.consecutive_failures(&server()), 0);
        assert!(tracker.reconnect_deadline(&server()).is_none());
        assert!(tracker.ready_at(&server(), Instant::now()));
    }

    #[test]
    fn test_unknown_server_is_ready() {
        let tracker = ReconnectTracker::new(BackoffConfig::default());
        assert!(tracker.ready_at(&server(), Instant::now()));
        assert_eq!(tracker.consecutive_failures(&server()), 0);
    }
}
