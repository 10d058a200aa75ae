//! Activity Tracker
//!
//! Per-resource activity state machine driving channel suspension:
//!
//! `Unknown -> Active <-> PendingSuspend -> Suspended -> Active`
//!
//! `mark_inactive` arms a suspend timer; any activity before it fires cancels
//! the transition. New data counts as activity (`update_activity` implicitly
//! reactivates), so reactivation is data-driven, not only UI-driven. A
//! periodic reaper drops records idle beyond twice the suspend threshold and
//! bounds memory by evicting the least-recently-active records under load.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::channel_registry::ChannelRegistry;
use crate::prelude::*;
use crate::settings::ActivitySettings;

/// Listener status of one tracked resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerStatus {
	Active,
	PendingSuspend,
	Suspended,
}

/// Tracked liveness state for one resource
struct ActivityRecord {
	last_activity: Instant,
	is_active: bool,
	status: ListenerStatus,
	message_count: u64,
	last_message_time: Option<Timestamp>,
	/// Pending suspend timer; aborted on reactivation
	timer: Option<tokio::task::JoinHandle<()>>,
	/// Fences timers that fire after cancellation raced completion
	generation: u64,
}

impl ActivityRecord {
	fn new() -> Self {
		Self {
			last_activity: Instant::now(),
			is_active: true,
			status: ListenerStatus::Active,
			message_count: 0,
			last_message_time: None,
			timer: None,
			generation: 0,
		}
	}

	fn cancel_timer(&mut self) {
		if let Some(timer) = self.timer.take() {
			timer.abort();
		}
		self.generation += 1;
	}
}

/// Read-only view of a tracked record, for callers and tests
#[derive(Clone, Debug)]
pub struct ActivitySnapshot {
	pub is_active: bool,
	pub status: ListenerStatus,
	pub message_count: u64,
	pub last_message_time: Option<Timestamp>,
}

/// Tracks resource liveness and drives registry suspend/resume
#[derive(Clone)]
pub struct ActivityTracker {
	records: Arc<Mutex<HashMap<Box<str>, ActivityRecord>>>,
	registry: ChannelRegistry,
	settings: ActivitySettings,
	reaper: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl ActivityTracker {
	pub fn new(registry: ChannelRegistry, settings: ActivitySettings) -> Self {
		Self {
			records: Arc::new(Mutex::new(HashMap::new())),
			registry,
			settings,
			reaper: Arc::new(Mutex::new(None)),
		}
	}

	/// Record activity for `resource_id`, resuming its channel if suspended.
	/// Cancels any pending suspend timer.
	pub async fn mark_active(&self, resource_id: &str) -> SlResult<()> {
		let was_suspended = {
			let mut records = self.records.lock();
			let record =
				records.entry(resource_id.into()).or_insert_with(ActivityRecord::new);
			record.cancel_timer();
			record.is_active = true;
			record.last_activity = Instant::now();
			let was_suspended = record.status == ListenerStatus::Suspended;
			record.status = ListenerStatus::Active;
			was_suspended
		};

		if was_suspended {
			debug!("Reactivating {}", resource_id);
			self.registry.resume(resource_id).await?;
		}
		Ok(())
	}

	/// Mark `resource_id` inactive and arm the suspend timer.
	///
	/// If the timer fires with no intervening activity the resource's channel
	/// is suspended. Re-marking an already pending resource re-arms the timer.
	pub fn mark_inactive(&self, resource_id: &str) {
		let generation = {
			let mut records = self.records.lock();
			let record =
				records.entry(resource_id.into()).or_insert_with(ActivityRecord::new);
			record.is_active = false;
			if record.status == ListenerStatus::Suspended {
				return;
			}
			record.cancel_timer();
			record.status = ListenerStatus::PendingSuspend;
			record.generation
		};

		debug!("Armed suspend timer for {}", resource_id);
		let tracker = self.clone();
		let id: Box<str> = resource_id.into();
		let handle = tokio::spawn(async move {
			tokio::time::sleep(tracker.settings.active_threshold).await;
			tracker.fire_suspend(&id, generation).await;
		});

		let mut records = self.records.lock();
		if let Some(record) = records.get_mut(resource_id) {
			if record.generation == generation && record.status == ListenerStatus::PendingSuspend {
				record.timer = Some(handle);
				return;
			}
		}
		// Activity raced the spawn; the timer is already stale
		handle.abort();
	}

	/// Update domain metadata. New data is evidence of relevance: an inactive
	/// record is implicitly reactivated, preempting any pending suspend.
	pub async fn update_activity(
		&self,
		resource_id: &str,
		message_count: u64,
		last_message_time: Timestamp,
	) -> SlResult<()> {
		let was_inactive = {
			let mut records = self.records.lock();
			let record =
				records.entry(resource_id.into()).or_insert_with(ActivityRecord::new);
			record.message_count = message_count;
			record.last_message_time = Some(last_message_time);
			if record.is_active {
				record.last_activity = Instant::now();
			}
			!record.is_active
		};

		if was_inactive {
			self.mark_active(resource_id).await?;
		}
		Ok(())
	}

	/// Start the periodic reaper
	pub fn start(&self) {
		let tracker = self.clone();
		let handle = tokio::spawn(async move {
			let mut interval = tokio::time::interval(tracker.settings.cleanup_interval);
			// The first tick completes immediately
			interval.tick().await;
			loop {
				interval.tick().await;
				tracker.reap().await;
			}
		});

		let mut reaper = self.reaper.lock();
		if let Some(old) = reaper.replace(handle) {
			old.abort();
		}
	}

	/// Drop records idle beyond twice the suspend threshold, then evict the
	/// oldest 30% when the map exceeds the memory threshold.
	pub async fn reap(&self) {
		let stale_cutoff = self.settings.active_threshold * 2;

		let mut to_remove: Vec<Box<str>> = {
			let records = self.records.lock();
			records
				.iter()
				.filter(|(_, r)| r.last_activity.elapsed() > stale_cutoff)
				.map(|(id, _)| id.clone())
				.collect()
		};

		{
			let records = self.records.lock();
			let survivors = records.len().saturating_sub(to_remove.len());
			if survivors > self.settings.memory_threshold {
				let mut by_age: Vec<(Box<str>, Instant)> = records
					.iter()
					.filter(|(id, _)| !to_remove.contains(id))
					.map(|(id, r)| (id.clone(), r.last_activity))
					.collect();
				by_age.sort_by_key(|(_, at)| *at);
				let evict_count = (survivors * 3 / 10).max(1);
				warn!(
					"Activity registry over threshold ({} records), evicting {}",
					survivors, evict_count
				);
				to_remove.extend(by_age.into_iter().take(evict_count).map(|(id, _)| id));
			}
		}

		if to_remove.is_empty() {
			return;
		}

		info!("Reaping {} stale activity records", to_remove.len());
		for id in to_remove {
			{
				let mut records = self.records.lock();
				if let Some(mut record) = records.remove(&id) {
					record.cancel_timer();
				}
			}
			// Entries with live listeners survive; only truly abandoned
			// subscriptions are torn down with their tracking state.
			self.registry.remove_if_idle(&id).await;
		}
	}

	/// Abort the reaper and all pending timers
	pub fn close(&self) {
		if let Some(handle) = self.reaper.lock().take() {
			handle.abort();
		}
		let mut records = self.records.lock();
		for record in records.values_mut() {
			record.cancel_timer();
		}
	}

	pub fn snapshot(&self, resource_id: &str) -> Option<ActivitySnapshot> {
		self.records.lock().get(resource_id).map(|r| ActivitySnapshot {
			is_active: r.is_active,
			status: r.status,
			message_count: r.message_count,
			last_message_time: r.last_message_time,
		})
	}

	pub fn len(&self) -> usize {
		self.records.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.lock().is_empty()
	}

	async fn fire_suspend(&self, resource_id: &str, generation: u64) {
		let should_suspend = {
			let mut records = self.records.lock();
			match records.get_mut(resource_id) {
				Some(record)
					if record.generation == generation
						&& !record.is_active
						&& record.status == ListenerStatus::PendingSuspend =>
				{
					record.status = ListenerStatus::Suspended;
					record.timer = None;
					true
				}
				_ => false,
			}
		};

		if should_suspend {
			if let Err(e) = self.registry.suspend(resource_id).await {
				warn!("Failed to suspend channel for {}: {}", resource_id, e);
			}
		}
	}
}


// vim: ts=4
