//! Orphan Reconciler
//!
//! Read-only scanner that cross-references the parent and child collections
//! to find records whose linkage is broken. It reports and never mutates:
//! fixing anything requires an explicit call into the cascading cleaner.

use std::collections::HashSet;
use std::sync::Arc;

use crate::prelude::*;
use crate::settings::CleanupSettings;
use syncline_types::doc_adapter::{DocAdapter, Query};

/// Why a record was flagged
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrphanReason {
	/// Child references a parent id that no longer exists
	GhostParent,
	/// Child lacks a valid, resolvable parent reference
	OrphanChild,
}

/// One flagged record
#[derive(Clone, Debug)]
pub struct OrphanRecord {
	/// Id of the flagged child document
	pub id: Box<str>,
	pub reason: OrphanReason,
	/// The dangling parent id for ghost-parent records
	pub related_id: Option<Box<str>>,
}

/// Read-only aggregate report for operator visibility
#[derive(Clone, Debug)]
pub struct IntegrityReport {
	pub total_parents: usize,
	/// Parents whose payload is a well-formed object
	pub valid_parents: usize,
	pub ghost_count: usize,
	pub orphan_count: usize,
	pub details: Vec<OrphanRecord>,
}

/// Cross-references parent and child collections without mutating either
#[derive(Clone)]
pub struct OrphanReconciler {
	doc_adapter: Arc<dyn DocAdapter>,
	settings: CleanupSettings,
}

impl OrphanReconciler {
	pub fn new(doc_adapter: Arc<dyn DocAdapter>, settings: CleanupSettings) -> Self {
		Self { doc_adapter, settings }
	}

	/// Children referencing a parent id that resolves to no parent document
	pub async fn find_ghost_parents(&self) -> SlResult<Vec<OrphanRecord>> {
		let parent_ids = self.parent_ids().await?;
		let children =
			self.doc_adapter.run_query(&Query::collection(self.settings.child_collection.clone())).await?;

		let mut ghosts = Vec::new();
		for child in children {
			if let Some(parent_id) = child.str_field(&self.settings.parent_ref_field) {
				if !parent_id.is_empty() && !parent_ids.contains(parent_id) {
					let related_id: Box<str> = parent_id.into();
					ghosts.push(OrphanRecord {
						id: child.id,
						reason: OrphanReason::GhostParent,
						related_id: Some(related_id),
					});
				}
			}
		}

		if !ghosts.is_empty() {
			warn!("Found {} children referencing missing parents", ghosts.len());
		}
		Ok(ghosts)
	}

	/// Children with an absent, empty, or non-string parent reference
	pub async fn find_orphan_children(&self) -> SlResult<Vec<OrphanRecord>> {
		let children =
			self.doc_adapter.run_query(&Query::collection(self.settings.child_collection.clone())).await?;

		let mut orphans = Vec::new();
		for child in children {
			let valid_link = child
				.str_field(&self.settings.parent_ref_field)
				.is_some_and(|parent_id| !parent_id.is_empty());
			if !valid_link {
				orphans.push(OrphanRecord {
					id: child.id,
					reason: OrphanReason::OrphanChild,
					related_id: None,
				});
			}
		}

		if !orphans.is_empty() {
			warn!("Found {} children without a parent link", orphans.len());
		}
		Ok(orphans)
	}

	/// Combined read-only report. Performs no cleanup.
	pub async fn validate_integrity(&self) -> SlResult<IntegrityReport> {
		let parents = self
			.doc_adapter
			.run_query(&Query::collection(self.settings.parent_collection.clone()))
			.await?;
		let total_parents = parents.len();
		let valid_parents = parents.iter().filter(|p| p.data.is_object()).count();

		let mut details = self.find_ghost_parents().await?;
		let ghost_count = details.len();
		let orphans = self.find_orphan_children().await?;
		let orphan_count = orphans.len();
		details.extend(orphans);

		info!(
			"Integrity scan: {}/{} valid parents, {} ghosts, {} orphans",
			valid_parents, total_parents, ghost_count, orphan_count
		);
		Ok(IntegrityReport { total_parents, valid_parents, ghost_count, orphan_count, details })
	}

	async fn parent_ids(&self) -> SlResult<HashSet<Box<str>>> {
		let parents = self
			.doc_adapter
			.run_query(&Query::collection(self.settings.parent_collection.clone()))
			.await?;
		Ok(parents.into_iter().map(|p| p.id).collect())
	}
}


// vim: ts=4
