//! Batch Write Coalescer
//!
//! Accumulates small, frequent mutations (read receipts, status pings) per
//! logical group and flushes them as one atomic batch on a size or time
//! trigger, whichever fires first. Failed flushes re-merge their items ahead
//! of newer arrivals and retry with exponential back-off; exhausted retries
//! surface the items on the failure channel, never dropping them silently.
//!
//! Items within one group reach the store in enqueue order. Groups are
//! independent: there is no cross-group ordering guarantee.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::prelude::*;
use crate::settings::BatchSettings;
use syncline_types::doc_adapter::{DocAdapter, WriteOp};

/// A flush that exhausted its retry budget, with the items that never landed
#[derive(Debug)]
pub struct BatchFailure {
	pub group_key: Box<str>,
	pub items: Vec<WriteOp>,
	pub error: Error,
}

struct BatchGroup {
	items: Vec<WriteOp>,
	timer: Option<tokio::task::JoinHandle<()>>,
	/// Fences timers that fire after they were superseded
	generation: u64,
	/// Failed flush attempts for the items currently at the head of the group
	retry_count: u16,
}

impl BatchGroup {
	fn new() -> Self {
		Self { items: Vec::new(), timer: None, generation: 0, retry_count: 0 }
	}

	fn cancel_timer(&mut self) {
		if let Some(timer) = self.timer.take() {
			timer.abort();
		}
		self.generation += 1;
	}
}

enum EnqueueAction {
	FlushNow(Vec<WriteOp>),
	ArmTimer(u64),
	Nothing,
}

/// Coalesces mutations into batched writes
#[derive(Clone)]
pub struct BatchCoalescer {
	doc_adapter: Arc<dyn DocAdapter>,
	groups: Arc<Mutex<HashMap<Box<str>, BatchGroup>>>,
	settings: BatchSettings,
	tx_failure: flume::Sender<BatchFailure>,
	rx_failure: flume::Receiver<BatchFailure>,
}

impl BatchCoalescer {
	pub fn new(doc_adapter: Arc<dyn DocAdapter>, settings: BatchSettings) -> Self {
		let (tx_failure, rx_failure) = flume::unbounded();
		Self {
			doc_adapter,
			groups: Arc::new(Mutex::new(HashMap::new())),
			settings,
			tx_failure,
			rx_failure,
		}
	}

	/// Receiver for flushes that exhausted their retry budget
	pub fn failures(&self) -> flume::Receiver<BatchFailure> {
		self.rx_failure.clone()
	}

	/// Append `op` to the group's pending items.
	///
	/// The first item arms the group's flush timer; reaching the size
	/// threshold cancels it and flushes immediately.
	pub fn enqueue(&self, group_key: &str, op: WriteOp) {
		let action = {
			let mut groups = self.groups.lock();
			let group = groups.entry(group_key.into()).or_insert_with(BatchGroup::new);
			group.items.push(op);

			if group.items.len() >= self.settings.batch_size_threshold {
				group.cancel_timer();
				EnqueueAction::FlushNow(std::mem::take(&mut group.items))
			} else if group.timer.is_none() {
				group.generation += 1;
				EnqueueAction::ArmTimer(group.generation)
			} else {
				EnqueueAction::Nothing
			}
		};

		match action {
			EnqueueAction::FlushNow(items) => {
				debug!("Group {} reached size threshold, flushing {} items", group_key, items.len());
				self.spawn_flush(group_key, items);
			}
			EnqueueAction::ArmTimer(generation) => {
				self.arm_timer(group_key, generation, self.settings.batch_delay);
			}
			EnqueueAction::Nothing => {}
		}
	}

	/// Pending item count for one group
	pub fn pending_len(&self, group_key: &str) -> usize {
		self.groups.lock().get(group_key).map_or(0, |g| g.items.len())
	}

	/// Flush every pending group before returning (shutdown path).
	///
	/// Failures are surfaced on the failure channel without retry. Returns
	/// the number of groups that flushed successfully.
	pub async fn force_flush_all(&self) -> usize {
		let keys: Vec<Box<str>> = self.groups.lock().keys().cloned().collect();
		let mut flushed = 0;

		for key in keys {
			let items = {
				let mut groups = self.groups.lock();
				match groups.get_mut(&key) {
					Some(group) => {
						group.cancel_timer();
						std::mem::take(&mut group.items)
					}
					None => continue,
				}
			};
			if items.is_empty() {
				self.drop_group_if_empty(&key);
				continue;
			}

			match self.doc_adapter.atomic_batch_write(&items).await {
				Ok(()) => {
					flushed += 1;
					self.drop_group_if_empty(&key);
				}
				Err(e) => {
					error!("Final flush for group {} failed: {}", key, e);
					let _ignore = self.tx_failure.send(BatchFailure {
						group_key: key.clone(),
						items,
						error: e,
					});
					self.drop_group_if_empty(&key);
				}
			}
		}
		flushed
	}

	fn arm_timer(&self, group_key: &str, generation: u64, delay: std::time::Duration) {
		let coalescer = self.clone();
		let key: Box<str> = group_key.into();
		let handle = tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			coalescer.fire_timer(&key, generation).await;
		});

		let mut groups = self.groups.lock();
		if let Some(group) = groups.get_mut(group_key) {
			if group.generation == generation && group.timer.is_none() {
				group.timer = Some(handle);
				return;
			}
		}
		// A size-threshold flush superseded this timer while it was spawned
		handle.abort();
	}

	async fn fire_timer(&self, group_key: &str, generation: u64) {
		let items = {
			let mut groups = self.groups.lock();
			match groups.get_mut(group_key) {
				Some(group) if group.generation == generation => {
					group.timer = None;
					group.generation += 1;
					std::mem::take(&mut group.items)
				}
				_ => return,
			}
		};

		if items.is_empty() {
			self.drop_group_if_empty(group_key);
			return;
		}
		self.flush_items(group_key, items).await;
	}

	fn spawn_flush(&self, group_key: &str, items: Vec<WriteOp>) {
		let coalescer = self.clone();
		let key: Box<str> = group_key.into();
		tokio::spawn(async move {
			coalescer.flush_items(&key, items).await;
		});
	}

	async fn flush_items(&self, group_key: &str, items: Vec<WriteOp>) {
		match self.doc_adapter.atomic_batch_write(&items).await {
			Ok(()) => {
				debug!("Flushed {} items for group {}", items.len(), group_key);
				let mut groups = self.groups.lock();
				if let Some(group) = groups.get_mut(group_key) {
					group.retry_count = 0;
					if group.items.is_empty() && group.timer.is_none() {
						groups.remove(group_key);
					}
				}
			}
			Err(e) => self.handle_flush_failure(group_key, items, e),
		}
	}

	fn handle_flush_failure(&self, group_key: &str, items: Vec<WriteOp>, error: Error) {
		let attempt = self.groups.lock().get(group_key).map_or(0, |g| g.retry_count);

		if self.settings.retry.should_retry(attempt) {
			let backoff = self.settings.retry.calculate_backoff(attempt);
			warn!(
				"Flush for group {} failed (attempt {}/{}), retrying in {:?}: {}",
				group_key,
				attempt + 1,
				self.settings.retry.times(),
				backoff,
				error
			);

			let generation = {
				let mut groups = self.groups.lock();
				let group = groups.entry(group_key.into()).or_insert_with(BatchGroup::new);
				// Failed items go back in front of anything that arrived since
				let mut merged = items;
				merged.append(&mut group.items);
				group.items = merged;
				group.retry_count = attempt + 1;
				if group.timer.is_none() {
					group.generation += 1;
					Some(group.generation)
				} else {
					// An armed timer will pick the re-merged items up
					None
				}
			};
			if let Some(generation) = generation {
				self.arm_timer(group_key, generation, backoff);
			}
		} else {
			error!(
				"Flush for group {} failed after {} attempts, surfacing {} items: {}",
				group_key,
				attempt,
				items.len(),
				error
			);
			{
				let mut groups = self.groups.lock();
				if let Some(group) = groups.get_mut(group_key) {
					group.retry_count = 0;
					if group.items.is_empty() && group.timer.is_none() {
						groups.remove(group_key);
					}
				}
			}
			let _ignore = self.tx_failure.send(BatchFailure {
				group_key: group_key.into(),
				items,
				error,
			});
		}
	}

	fn drop_group_if_empty(&self, group_key: &str) {
		let mut groups = self.groups.lock();
		if let Some(group) = groups.get(group_key) {
			if group.items.is_empty() && group.timer.is_none() {
				groups.remove(group_key);
			}
		}
	}
}


// vim: ts=4
