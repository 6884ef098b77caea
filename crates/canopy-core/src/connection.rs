//! Connection state tracking for the client side of the transport.
//!
//! The tracker is fed status events by the transport layer and derives the
//! signals the UI and backoff logic care about: whether the client has ever
//! been connected, how many reconnect attempts have happened since the last
//! successful connect, and whether it is currently reconnecting.

use serde::{Deserialize, Serialize};

/// Transport status as reported by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the tracker, published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub was_connected: bool,
    pub reconnect_counter: u32,
    pub is_reconnecting: bool,
}

/// Owns the client's [`ConnectionStatus`]. Only [`ConnectionTracker::apply`]
/// mutates it.
///
/// | from         | event      | to         | side effect                         |
/// |--------------|------------|------------|-------------------------------------|
/// | any          | connected  | connected  | `was_connected = true`, counter = 0 |
/// | connected    | connecting | connecting | counter += 1                        |
/// | disconnected | connecting | connecting | none                                |
/// | any          | disconnected | disconnected | none                            |
///
/// A repeated `connecting` while already connecting after a prior connect is
/// a further retry attempt and also bumps the counter.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    status: ConnectionStatus,
    was_connected: bool,
    reconnect_counter: u32,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a status event. Returns the new snapshot when anything
    /// observable changed, `None` for ignored events.
    pub fn apply(&mut self, next: ConnectionStatus) -> Option<ConnectionSnapshot> {
        use ConnectionStatus::*;

        let before = self.snapshot();

        match (self.status, next) {
            (_, Connected) => {
                self.was_connected = true;
                self.reconnect_counter = 0;
            }
            (Connected, Connecting) => {
                self.reconnect_counter = self.reconnect_counter.saturating_add(1);
            }
            (Connecting, Connecting) if self.was_connected => {
                self.reconnect_counter = self.reconnect_counter.saturating_add(1);
            }
            (Disconnected, Connecting) | (Connecting, Connecting) | (_, Disconnected) => {}
        }
        self.status = next;

        let after = self.snapshot();
        if after == before {
            None
        } else {
            tracing::debug!(
                from = %before.status,
                to = %after.status,
                reconnect_counter = after.reconnect_counter,
                "Connection status changed"
            );
            Some(after)
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn was_connected(&self) -> bool {
        self.was_connected
    }

    pub fn reconnect_counter(&self) -> u32 {
        self.reconnect_counter
    }

    /// Derived: reconnecting means we lost a connection we once had and are
    /// trying to get it back.
    pub fn is_reconnecting(&self) -> bool {
        self.was_connected && self.status == ConnectionStatus::Connecting
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            status: self.status,
            was_connected: self.was_connected,
            reconnect_counter: self.reconnect_counter,
            is_reconnecting: self.is_reconnecting(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    const ALL: [ConnectionStatus; 3] = [Disconnected, Connecting, Connected];

    fn tracker_in(status: ConnectionStatus, was_connected: bool) -> ConnectionTracker {
        let mut tracker = ConnectionTracker::new();
        if was_connected {
            tracker.apply(Connected);
        }
        tracker.apply(status);
        assert_eq!(tracker.status(), status);
        assert_eq!(tracker.was_connected(), was_connected);
        tracker
    }

    #[test]
    fn test_initial_state() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.status(), Disconnected);
        assert!(!tracker.was_connected());
        assert_eq!(tracker.reconnect_counter(), 0);
        assert!(!tracker.is_reconnecting());
    }

    #[test]
    fn test_is_reconnecting_truth_table() {
        for status in ALL {
            for was_connected in [false, true] {
                let tracker = tracker_in(status, was_connected);
                let expected = was_connected && status == Connecting;
                assert_eq!(
                    tracker.is_reconnecting(),
                    expected,
                    "status={status} was_connected={was_connected}"
                );
            }
        }
    }

    #[test]
    fn test_counter_follows_transition_table() {
        let mut tracker = ConnectionTracker::new();

        tracker.apply(Connecting);
        assert_eq!(tracker.reconnect_counter(), 0);

        tracker.apply(Connected);
        tracker.apply(Connecting);
        assert_eq!(tracker.reconnect_counter(), 1);

        tracker.apply(Connecting);
        tracker.apply(Connecting);
        assert_eq!(tracker.reconnect_counter(), 3);

        tracker.apply(Disconnected);
        assert_eq!(tracker.reconnect_counter(), 3);

        tracker.apply(Connecting);
        assert_eq!(tracker.reconnect_counter(), 3);

        tracker.apply(Connected);
        assert_eq!(tracker.reconnect_counter(), 0);
    }

    #[test]
    fn test_counter_rules_over_all_short_sequences() {
        // Every sequence of up to 6 events.
        let mut level: Vec<Vec<ConnectionStatus>> = vec![vec![]];
        let mut sequences = Vec::new();
        for _ in 0..6 {
            level = level
                .iter()
                .flat_map(|seq| {
                    ALL.into_iter().map(move |s| {
                        let mut seq = seq.clone();
                        seq.push(s);
                        seq
                    })
                })
                .collect();
            sequences.extend(level.iter().cloned());
        }

        for seq in sequences {
            let mut tracker = ConnectionTracker::new();
            let mut ever_connected = false;
            for status in &seq {
                let prev = tracker.reconnect_counter();
                tracker.apply(*status);
                ever_connected |= *status == Connected;

                if *status == Connected {
                    assert_eq!(tracker.reconnect_counter(), 0, "{seq:?}");
                }
                if !ever_connected {
                    assert_eq!(tracker.reconnect_counter(), 0, "{seq:?}");
                }
                assert!(tracker.reconnect_counter() <= prev + 1, "{seq:?}");
                assert_eq!(tracker.was_connected(), ever_connected, "{seq:?}");
            }
        }
    }

    #[test]
    fn test_apply_reports_only_real_changes() {
        let mut tracker = ConnectionTracker::new();
        assert!(tracker.apply(Disconnected).is_none());

        let snapshot = tracker.apply(Connecting).unwrap();
        assert_eq!(snapshot.status, Connecting);
        assert!(!snapshot.is_reconnecting);

        assert!(tracker.apply(Connecting).is_none());

        let snapshot = tracker.apply(Connected).unwrap();
        assert!(snapshot.was_connected);
        assert!(tracker.apply(Connected).is_none());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&Connecting).unwrap();
        assert_eq!(json, "\"connecting\"");
        let status: ConnectionStatus = serde_json::from_str("\"connected\"").unwrap();
        assert_eq!(status, Connected);
    }
}
