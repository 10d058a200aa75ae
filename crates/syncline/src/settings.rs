//! Settings for the sync layer.
//!
//! The suspend/reap thresholds are policy constants, not behavior: the
//! defaults below mirror what the product ships with, and every value is
//! overridable at construction.

use std::time::Duration;

/// Activity tracking configuration
#[derive(Clone, Debug)]
pub struct ActivitySettings {
	/// Inactivity period after which a resource's channel is suspended
	pub active_threshold: Duration,
	/// Reaper period; stale records are dropped every tick
	pub cleanup_interval: Duration,
	/// Record count above which the oldest 30% are evicted
	pub memory_threshold: usize,
}

impl Default for ActivitySettings {
	fn default() -> Self {
		Self {
			active_threshold: Duration::from_secs(30),
			cleanup_interval: Duration::from_secs(60),
			memory_threshold: 500,
		}
	}
}

/// Retry policy with exponential back-off
#[derive(Clone, Debug)]
pub struct RetryPolicy {
	wait_min_max: (Duration, Duration),
	times: u16,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self { wait_min_max: (Duration::from_millis(500), Duration::from_secs(30)), times: 5 }
	}
}

impl RetryPolicy {
	/// Create a new RetryPolicy with custom min/max back-off and number of retries
	pub fn new(wait_min_max: (Duration, Duration), times: u16) -> Self {
		Self { wait_min_max, times }
	}

	/// Calculate exponential back-off: min * (2^attempt), capped at max
	pub fn calculate_backoff(&self, attempt_count: u16) -> Duration {
		let (min, max) = self.wait_min_max;
		let backoff = min.saturating_mul(1u32 << u32::from(attempt_count.min(16)));
		backoff.min(max)
	}

	/// Check if we should continue retrying
	pub fn should_retry(&self, attempt_count: u16) -> bool {
		attempt_count < self.times
	}

	/// Maximum number of retry attempts
	pub fn times(&self) -> u16 {
		self.times
	}
}

/// Write coalescing configuration
#[derive(Clone, Debug)]
pub struct BatchSettings {
	/// How long a group accumulates items before its timer flushes it
	pub batch_delay: Duration,
	/// Item count that triggers an immediate flush, preempting the timer
	pub batch_size_threshold: usize,
	/// Retry policy for failed flushes
	pub retry: RetryPolicy,
}

impl Default for BatchSettings {
	fn default() -> Self {
		Self {
			batch_delay: Duration::from_secs(2),
			batch_size_threshold: 8,
			retry: RetryPolicy::default(),
		}
	}
}

/// Orphan detection / cascading cleanup configuration
#[derive(Clone, Debug)]
pub struct CleanupSettings {
	/// Collection holding parent records (conversations)
	pub parent_collection: Box<str>,
	/// Collection holding child records (messages)
	pub child_collection: Box<str>,
	/// Child field referencing the parent document id
	pub parent_ref_field: Box<str>,
	/// Child field holding object-store attachment references
	pub attachment_field: Box<str>,
	/// Parent field holding the creation timestamp (epoch seconds)
	pub created_at_field: Box<str>,
	/// Age beyond which `reap` deletes a parent
	pub reap_age: Duration,
	/// Minimum spacing between two reap sweeps
	pub min_reap_interval: Duration,
}

impl Default for CleanupSettings {
	fn default() -> Self {
		Self {
			parent_collection: "conversations".into(),
			child_collection: "messages".into(),
			parent_ref_field: "conversationId".into(),
			attachment_field: "attachments".into(),
			created_at_field: "createdAt".into(),
			reap_age: Duration::from_secs(24 * 60 * 60),
			min_reap_interval: Duration::from_secs(60),
		}
	}
}

/// Aggregate settings consumed by `SyncManager::new`
#[derive(Clone, Debug, Default)]
pub struct SyncSettings {
	pub activity: ActivitySettings,
	pub batch: BatchSettings,
	pub cleanup: CleanupSettings,
}


// vim: ts=4
