//! Cascading Cleaner
//!
//! Removes a parent record together with its dependent children and their
//! externally-stored attachments, across two independently-consistent stores.
//! Ordering is a correctness requirement, not a preference: attachments are
//! deleted from the object store before any document, so a failure later in
//! the sequence leaves a dangling reference to a missing blob (about to be
//! deleted anyway) rather than a permanently leaked blob.
//!
//! Attachment deletion is best-effort; referential correctness in the
//! document store is mandatory. A document-batch failure aborts that parent
//! only — other parents in a sweep continue independently.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::prelude::*;
use crate::reconciler::{OrphanReason, OrphanRecord};
use crate::settings::CleanupSettings;
use syncline_types::doc_adapter::{DocAdapter, Document, Query, WriteOp};
use syncline_types::object_adapter::ObjectAdapter;
use syncline_types::utils::public_id_from_url;

/// Outcome of one cleanup operation.
///
/// Cleanup never throws partial failures at the caller: "5 succeeded, 2
/// failed" is representable and actionable.
#[derive(Clone, Debug, Default)]
pub struct CleanupResult {
	/// Documents deleted (children + parents)
	pub deleted_count: usize,
	/// Ids (documents or attachments) that could not be processed
	pub failed_ids: Vec<Box<str>>,
	/// Attachments removed from the object store
	pub attachment_delete_count: usize,
	/// True when the operation declined to run (overlap / min interval)
	pub skipped: bool,
	/// Explanation for a skipped run
	pub detail: Option<Box<str>>,
}

impl CleanupResult {
	fn skipped(detail: impl Into<Box<str>>) -> Self {
		Self { skipped: true, detail: Some(detail.into()), ..Self::default() }
	}

	fn merge(&mut self, other: CleanupResult) {
		self.deleted_count += other.deleted_count;
		self.failed_ids.extend(other.failed_ids);
		self.attachment_delete_count += other.attachment_delete_count;
	}

	pub fn is_clean(&self) -> bool {
		self.failed_ids.is_empty() && !self.skipped
	}
}

/// Deletes parents, their children, and referenced attachments in order
#[derive(Clone)]
pub struct CascadingCleaner {
	doc_adapter: Arc<dyn DocAdapter>,
	object_adapter: Arc<dyn ObjectAdapter>,
	settings: CleanupSettings,
	reap_running: Arc<AtomicBool>,
	last_reap: Arc<Mutex<Option<Instant>>>,
	cancel: Arc<AtomicBool>,
}

impl CascadingCleaner {
	pub fn new(
		doc_adapter: Arc<dyn DocAdapter>,
		object_adapter: Arc<dyn ObjectAdapter>,
		settings: CleanupSettings,
	) -> Self {
		Self {
			doc_adapter,
			object_adapter,
			settings,
			reap_running: Arc::new(AtomicBool::new(false)),
			last_reap: Arc::new(Mutex::new(None)),
			cancel: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Request cancellation of a running sweep. Takes effect between
	/// per-parent iterations, never mid-parent.
	pub fn request_cancel(&self) {
		self.cancel.store(true, Ordering::SeqCst);
	}

	/// Delete `parent_id` with all dependent children and attachments.
	///
	/// Sequence: attachments → child batch → parent → verification re-query.
	pub async fn delete_parent_and_dependents(&self, parent_id: &str) -> SlResult<CleanupResult> {
		let mut result = CleanupResult::default();

		let child_query = Query::filtered(
			self.settings.child_collection.clone(),
			self.settings.parent_ref_field.clone(),
			parent_id,
		);
		let children = self.doc_adapter.run_query(&child_query).await?;
		info!("Cleaning up parent {} with {} children", parent_id, children.len());

		// 1. Attachments first (best-effort)
		for child in &children {
			for reference in self.attachment_refs(child) {
				let public_id = public_id_from_url(&reference);
				match self.object_adapter.delete_object(public_id).await {
					Ok(()) => result.attachment_delete_count += 1,
					Err(e) => {
						warn!("Failed to delete attachment {}: {}", public_id, e);
						result.failed_ids.push(public_id.into());
					}
				}
			}
		}

		// 2. All children in one atomic batch
		if !children.is_empty() {
			let ops: Vec<WriteOp> = children
				.iter()
				.map(|child| WriteOp::Delete {
					collection: self.settings.child_collection.clone(),
					doc_id: child.id.clone(),
				})
				.collect();
			if let Err(e) = self.doc_adapter.atomic_batch_write(&ops).await {
				error!("Child batch delete for parent {} failed: {}", parent_id, e);
				result.failed_ids.push(parent_id.into());
				return Ok(result);
			}
			result.deleted_count += children.len();
		}

		// 3. The parent itself
		if let Err(e) =
			self.doc_adapter.delete_document(&self.settings.parent_collection, parent_id).await
		{
			error!("Parent delete for {} failed: {}", parent_id, e);
			result.failed_ids.push(parent_id.into());
			return Ok(result);
		}
		result.deleted_count += 1;

		// 4. Verify: report leftovers instead of silently succeeding
		let remaining = self.doc_adapter.run_query(&child_query).await?;
		if !remaining.is_empty() {
			warn!(
				"{} children still reference parent {} after cleanup",
				remaining.len(),
				parent_id
			);
			result.failed_ids.push(parent_id.into());
		}

		Ok(result)
	}

	/// Apply the cascading procedure to a reconciler-produced orphan set,
	/// continuing past individual failures.
	pub async fn cleanup_batch(&self, orphans: &[OrphanRecord]) -> SlResult<CleanupResult> {
		self.cancel.store(false, Ordering::SeqCst);
		let mut result = CleanupResult::default();

		// Ghost children grouped by their missing parent: one cascading pass
		// per dangling parent id removes every child referencing it.
		let ghost_parents: BTreeSet<Box<str>> = orphans
			.iter()
			.filter(|o| o.reason == OrphanReason::GhostParent)
			.filter_map(|o| o.related_id.clone())
			.collect();

		for parent_id in ghost_parents {
			if self.cancelled() {
				info!("Cleanup batch cancelled before parent {}", parent_id);
				break;
			}
			match self.delete_parent_and_dependents(&parent_id).await {
				Ok(r) => result.merge(r),
				Err(e) => {
					warn!("Cleanup for ghost parent {} failed: {}", parent_id, e);
					result.failed_ids.push(parent_id);
				}
			}
		}

		// Orphan children have no parent to cascade from: delete them (and
		// their attachments) directly.
		let orphan_ids: Vec<&str> = orphans
			.iter()
			.filter(|o| o.reason == OrphanReason::OrphanChild)
			.map(|o| o.id.as_ref())
			.collect();
		if !orphan_ids.is_empty() && !self.cancelled() {
			let r = self.delete_children(&orphan_ids).await?;
			result.merge(r);
		}

		info!(
			"Cleanup batch done: {} deleted, {} attachments, {} failures",
			result.deleted_count,
			result.attachment_delete_count,
			result.failed_ids.len()
		);
		Ok(result)
	}

	/// Delete all parents older than `threshold`.
	///
	/// Guarded against overlap: a call while another sweep is in flight, or
	/// within the minimum interval of the previous one, returns immediately
	/// with an explanatory no-op result.
	pub async fn reap_by_age(&self, threshold: Duration) -> SlResult<CleanupResult> {
		if self.reap_running.swap(true, Ordering::SeqCst) {
			info!("Reap requested while another sweep is running, skipping");
			return Ok(CleanupResult::skipped("cleanup already running"));
		}

		let recent = {
			let last_reap = self.last_reap.lock();
			last_reap.is_some_and(|at| at.elapsed() < self.settings.min_reap_interval)
		};
		if recent {
			self.reap_running.store(false, Ordering::SeqCst);
			info!("Reap requested within the minimum interval, skipping");
			return Ok(CleanupResult::skipped("cleanup ran recently"));
		}

		self.cancel.store(false, Ordering::SeqCst);
		let result = self.reap_inner(threshold).await;

		*self.last_reap.lock() = Some(Instant::now());
		self.reap_running.store(false, Ordering::SeqCst);
		result
	}

	async fn reap_inner(&self, threshold: Duration) -> SlResult<CleanupResult> {
		let mut result = CleanupResult::default();

		let parents = self
			.doc_adapter
			.run_query(&Query::collection(self.settings.parent_collection.clone()))
			.await?;

		#[allow(clippy::cast_possible_wrap)]
		let cutoff = Timestamp::from_now(-(threshold.as_secs() as i64));
		let aged: Vec<Document> = parents
			.into_iter()
			.filter(|p| {
				p.data
					.get(self.settings.created_at_field.as_ref())
					.and_then(Value::as_i64)
					.is_some_and(|created_at| Timestamp(created_at) <= cutoff)
			})
			.collect();

		info!("Reaping {} parents older than {:?}", aged.len(), threshold);
		for parent in aged {
			if self.cancelled() {
				info!("Reap cancelled before parent {}", parent.id);
				break;
			}
			match self.delete_parent_and_dependents(&parent.id).await {
				Ok(r) => result.merge(r),
				Err(e) => {
					warn!("Reap of parent {} failed: {}", parent.id, e);
					result.failed_ids.push(parent.id);
				}
			}
		}
		Ok(result)
	}

	/// Delete specific children (attachments first), one atomic batch
	async fn delete_children(&self, child_ids: &[&str]) -> SlResult<CleanupResult> {
		let mut result = CleanupResult::default();

		let all_children = self
			.doc_adapter
			.run_query(&Query::collection(self.settings.child_collection.clone()))
			.await?;
		let targets: Vec<&Document> =
			all_children.iter().filter(|c| child_ids.contains(&c.id.as_ref())).collect();

		for child in &targets {
			for reference in self.attachment_refs(child) {
				let public_id = public_id_from_url(&reference);
				match self.object_adapter.delete_object(public_id).await {
					Ok(()) => result.attachment_delete_count += 1,
					Err(e) => {
						warn!("Failed to delete attachment {}: {}", public_id, e);
						result.failed_ids.push(public_id.into());
					}
				}
			}
		}

		if targets.is_empty() {
			return Ok(result);
		}
		let ops: Vec<WriteOp> = targets
			.iter()
			.map(|child| WriteOp::Delete {
				collection: self.settings.child_collection.clone(),
				doc_id: child.id.clone(),
			})
			.collect();
		match self.doc_adapter.atomic_batch_write(&ops).await {
			Ok(()) => result.deleted_count += targets.len(),
			Err(e) => {
				error!("Orphan child batch delete failed: {}", e);
				result.failed_ids.extend(targets.iter().map(|c| c.id.clone()));
			}
		}
		Ok(result)
	}

	fn attachment_refs(&self, child: &Document) -> Vec<String> {
		child
			.data
			.get(self.settings.attachment_field.as_ref())
			.and_then(Value::as_array)
			.map(|refs| {
				refs.iter().filter_map(Value::as_str).map(str::to_string).collect()
			})
			.unwrap_or_default()
	}

	fn cancelled(&self) -> bool {
		self.cancel.load(Ordering::SeqCst)
	}
}


// vim: ts=4
