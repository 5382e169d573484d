//! Configuration for the sync engine.

use std::time::Duration;

/// How far the pull cursor moves after a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorPolicy {
    /// Advance to the newest `remoteModifiedAt` fetched, even if some items
    /// failed. A failed item is only seen again if it changes remotely.
    #[default]
    BatchMax,
    /// Advance only through the leading run of items that did not fail.
    ContiguousSuccess,
}

/// What an import does when a business key matches several local records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateKeyPolicy {
    /// Log and create a new local record; never merge.
    #[default]
    CreateNew,
    /// Pair with the oldest candidate.
    MatchOldest,
    /// Fail the item with a validation error.
    Reject,
}

/// Configuration for sync behavior.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Attempts per queue entry before it is parked in `error`.
    pub max_retries: u32,
    /// Locks older than this are presumed abandoned.
    pub stale_lock_timeout: Duration,
    /// Sleep between queue entries, to respect the remote request budget.
    pub call_delay: Duration,
    /// Queue entries claimed per drain.
    pub batch_size: usize,
    /// Upper bound on remote pages fetched by one pull.
    pub max_pull_pages: usize,
    pub cursor_policy: CursorPolicy,
    pub duplicate_key_policy: DuplicateKeyPolicy,
    /// Slack allowed between our push stamp and the remote modification
    /// time before a remote change counts as someone else's edit.
    pub push_stamp_tolerance: Duration,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self {
            max_retries: 5,
            stale_lock_timeout: Duration::from_secs(15 * 60),
            call_delay: Duration::from_millis(500),
            batch_size: 50,
            max_pull_pages: 20,
            cursor_policy: CursorPolicy::default(),
            duplicate_key_policy: DuplicateKeyPolicy::default(),
            push_stamp_tolerance: Duration::ZERO,
        }
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the stale lock timeout.
    pub fn with_stale_lock_timeout(mut self, timeout: Duration) -> Self {
        self.stale_lock_timeout = timeout;
        self
    }

    /// Sets the delay between outbound entries.
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    /// Sets the drain batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the page limit of a single pull.
    pub fn with_max_pull_pages(mut self, pages: usize) -> Self {
        self.max_pull_pages = pages;
        self
    }

    pub fn with_cursor_policy(mut self, policy: CursorPolicy) -> Self {
        self.cursor_policy = policy;
        self
    }

    pub fn with_duplicate_key_policy(mut self, policy: DuplicateKeyPolicy) -> Self {
        self.duplicate_key_policy = policy;
        self
    }

    pub fn with_push_stamp_tolerance(mut self, tolerance: Duration) -> Self {
        self.push_stamp_tolerance = tolerance;
        self
    }

    pub(crate) fn stale_lock_timeout_ms(&self) -> i64 {
        self.stale_lock_timeout.as_millis() as i64
    }

    pub(crate) fn push_stamp_tolerance_ms(&self) -> i64 {
        self.push_stamp_tolerance.as_millis() as i64
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.stale_lock_timeout_ms(), 900_000);
        assert_eq!(config.cursor_policy, CursorPolicy::BatchMax);
        assert_eq!(config.duplicate_key_policy, DuplicateKeyPolicy::CreateNew);
        assert_eq!(config.push_stamp_tolerance_ms(), 0);
    }

    #[test]
    fn test_builders() {
        let config = SyncConfig::new()
            .with_max_retries(2)
            .with_call_delay(Duration::ZERO)
            .with_cursor_policy(CursorPolicy::ContiguousSuccess)
            .with_push_stamp_tolerance(Duration::from_secs(2));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.call_delay, Duration::ZERO);
        assert_eq!(config.cursor_policy, CursorPolicy::ContiguousSuccess);
        assert_eq!(config.push_stamp_tolerance_ms(), 2_000);
    }
}
