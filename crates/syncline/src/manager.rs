//! Sync Manager
//!
//! Composition root for the sync layer. One explicitly constructed,
//! dependency-injected instance owns the channel registry, activity tracker,
//! batch coalescer, reconciler, and cleaner, and wires them together:
//! listener churn feeds the tracker, the tracker drives registry
//! suspend/resume, mutations go through the coalescer, and the reconciler's
//! output feeds the cleaner. "One instance per process" is a composition-root
//! decision, not a language feature.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::activity::{ActivitySnapshot, ActivityTracker};
use crate::batch::{BatchCoalescer, BatchFailure};
use crate::channel_registry::{
	ChannelOpener, ChannelRegistry, DataCallback, ListenerGuard, LiveChannel, RegistryStats,
};
use crate::cleanup::{CascadingCleaner, CleanupResult};
use crate::prelude::*;
use crate::reconciler::{IntegrityReport, OrphanReconciler};
use crate::settings::SyncSettings;
use syncline_types::doc_adapter::{DocAdapter, Query, WriteOp};
use syncline_types::object_adapter::ObjectAdapter;

/// Aggregate operational statistics
#[derive(Debug, Clone)]
pub struct SyncStats {
	pub registry: RegistryStats,
	pub tracked_resources: usize,
}

/// The sync layer's single caller-facing service instance
pub struct SyncManager {
	registry: ChannelRegistry,
	activity: ActivityTracker,
	batch: BatchCoalescer,
	reconciler: OrphanReconciler,
	cleaner: CascadingCleaner,
	doc_adapter: Arc<dyn DocAdapter>,
	settings: SyncSettings,
}

impl SyncManager {
	/// Build and wire a manager. Starts the activity reaper.
	pub fn new(
		doc_adapter: Arc<dyn DocAdapter>,
		object_adapter: Arc<dyn ObjectAdapter>,
		settings: SyncSettings,
	) -> Arc<Self> {
		let registry = ChannelRegistry::new();
		let activity = ActivityTracker::new(registry.clone(), settings.activity.clone());

		// Losing the last listener hands suspend timing to the tracker
		{
			let activity = activity.clone();
			registry.set_idle_hook(Arc::new(move |key: &str| activity.mark_inactive(key)));
		}
		activity.start();

		let batch = BatchCoalescer::new(doc_adapter.clone(), settings.batch.clone());
		let reconciler = OrphanReconciler::new(doc_adapter.clone(), settings.cleanup.clone());
		let cleaner =
			CascadingCleaner::new(doc_adapter.clone(), object_adapter, settings.cleanup.clone());

		info!("Sync manager initialized");
		Arc::new(Self { registry, activity, batch, reconciler, cleaner, doc_adapter, settings })
	}

	/// Subscribe to live changes for `query`.
	///
	/// Queries with the same channel key share one underlying store channel;
	/// the returned guard detaches only this listener. Subscribing marks the
	/// resource active (resuming a suspended channel if needed).
	pub async fn subscribe(&self, query: &Query, on_data: DataCallback) -> SlResult<ListenerGuard> {
		let key = query.channel_key();
		let opener = self.make_opener(query.clone(), key.clone());
		let guard = self.registry.subscribe(&key, opener, on_data).await?;
		if let Err(e) = self.activity.mark_active(&key).await {
			guard.release();
			return Err(e);
		}
		Ok(guard)
	}

	/// Route a mutation through the batch coalescer
	pub fn enqueue_write(&self, group_key: &str, op: WriteOp) {
		self.batch.enqueue(group_key, op);
	}

	/// Flushes that exhausted their retry budget
	pub fn batch_failures(&self) -> flume::Receiver<BatchFailure> {
		self.batch.failures()
	}

	pub async fn mark_active(&self, resource_id: &str) -> SlResult<()> {
		self.activity.mark_active(resource_id).await
	}

	pub fn mark_inactive(&self, resource_id: &str) {
		self.activity.mark_inactive(resource_id);
	}

	pub async fn update_activity(
		&self,
		resource_id: &str,
		message_count: u64,
		last_message_time: Timestamp,
	) -> SlResult<()> {
		self.activity.update_activity(resource_id, message_count, last_message_time).await
	}

	pub fn activity_snapshot(&self, resource_id: &str) -> Option<ActivitySnapshot> {
		self.activity.snapshot(resource_id)
	}

	/// Read-only cross-store integrity report
	pub async fn run_integrity_scan(&self) -> SlResult<IntegrityReport> {
		self.reconciler.validate_integrity().await
	}

	/// Scan for orphans and remove them
	pub async fn cleanup_orphans(&self) -> SlResult<CleanupResult> {
		let mut orphans = self.reconciler.find_ghost_parents().await?;
		orphans.extend(self.reconciler.find_orphan_children().await?);
		if orphans.is_empty() {
			debug!("No orphans found, nothing to clean");
			return Ok(CleanupResult::default());
		}
		self.cleaner.cleanup_batch(&orphans).await
	}

	/// Delete parents older than `threshold`
	pub async fn reap_by_age(&self, threshold: Duration) -> SlResult<CleanupResult> {
		self.cleaner.reap_by_age(threshold).await
	}

	/// Delete parents older than the configured reap age
	pub async fn reap(&self) -> SlResult<CleanupResult> {
		self.cleaner.reap_by_age(self.settings.cleanup.reap_age).await
	}

	/// Cancel a running sweep between per-parent iterations
	pub fn request_cleanup_cancel(&self) {
		self.cleaner.request_cancel();
	}

	pub fn stats(&self) -> SyncStats {
		SyncStats { registry: self.registry.stats(), tracked_resources: self.activity.len() }
	}

	/// Flush pending batches, stop timers, and close every channel
	pub async fn close(&self) {
		info!("Sync manager shutting down");
		self.batch.force_flush_all().await;
		self.activity.close();
		self.registry.clear_idle_hook();
		self.registry.close_all().await;
	}

	/// Build the opener retained by the registry for this query: it opens
	/// the adapter channel and pumps its feed into the registry's broadcast.
	fn make_opener(&self, query: Query, key: String) -> ChannelOpener {
		let doc_adapter = self.doc_adapter.clone();
		let registry = self.registry.clone();
		Arc::new(move || {
			let doc_adapter = doc_adapter.clone();
			let registry = registry.clone();
			let query = query.clone();
			let key = key.clone();
			Box::pin(async move {
				let (tx, rx) = flume::unbounded::<Value>();
				let closer = doc_adapter.open_channel(&query, tx).await?;
				let forward = tokio::spawn(async move {
					while let Ok(snapshot) = rx.recv_async().await {
						registry.broadcast(&key, &snapshot);
					}
					debug!("Change feed for {} ended", key);
				});
				Ok(LiveChannel::new(closer, Some(forward)))
			})
		})
	}
}

// vim: ts=4
