use std::time::Duration;

/// The configuration of the lobby's timers
#[derive(Debug, Clone)]
pub struct Config {
    /// How often the local player's presence row is refreshed
    pub heartbeat_interval: Duration,
    /// How long a presence row stays credible without a refresh.
    /// Records older than this are classified offline at read time.
    pub presence_freshness: Duration,
    /// The first delay before resubscribing to a lost change feed
    pub feed_retry_min: Duration,
    /// The cap on the resubscribe delay as it backs off
    pub feed_retry_max: Duration,
}

impl Config {
    /// The delay to use after a failed resubscribe attempt
    pub fn next_feed_retry(&self, current: Duration) -> Duration {
        (current * 2).min(self.feed_retry_max)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            // Three missed beats before a player reads as gone
            presence_freshness: Duration::from_secs(90),
            feed_retry_min: Duration::from_secs(1),
            feed_retry_max: Duration::from_secs(30),
        }
    }
}
