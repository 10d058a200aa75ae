//! In-memory implementations of the Syncline store adapter traits.
//!
//! `MemDocAdapter` keeps collections in process memory, answers equality
//! queries, applies batches all-or-nothing, and fans change events out to
//! open channels. `MemObjectAdapter` is a map of public ids to blobs.
//!
//! Both adapters can share a [`CallLog`] so tests can assert cross-store
//! call ordering, and both support fault injection (fail the next N batch
//! writes, fail deletes for specific object ids).

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use syncline_types::doc_adapter::{
	ChannelClose, DocAdapter, Document, Query, SnapshotSender, WriteOp,
};
use syncline_types::object_adapter::ObjectAdapter;
use syncline_types::prelude::*;

/// Shared operation log for cross-adapter call ordering assertions
#[derive(Debug, Default)]
pub struct CallLog {
	entries: Mutex<Vec<String>>,
}

impl CallLog {
	pub fn record(&self, entry: impl Into<String>) {
		self.entries.lock().push(entry.into());
	}

	pub fn entries(&self) -> Vec<String> {
		self.entries.lock().clone()
	}

	pub fn clear(&self) {
		self.entries.lock().clear();
	}

	/// Index of the first entry starting with `prefix`, if any
	pub fn first_index_of(&self, prefix: &str) -> Option<usize> {
		self.entries.lock().iter().position(|e| e.starts_with(prefix))
	}

	/// Index of the last entry starting with `prefix`, if any
	pub fn last_index_of(&self, prefix: &str) -> Option<usize> {
		self.entries.lock().iter().rposition(|e| e.starts_with(prefix))
	}
}

type CollectionMap = HashMap<Box<str>, BTreeMap<Box<str>, Value>>;

struct MemChannel {
	query: Query,
	tx: SnapshotSender,
	open: Arc<AtomicBool>,
}

struct MemChannelClose {
	open: Arc<AtomicBool>,
}

impl ChannelClose for MemChannelClose {
	fn close(&self) {
		self.open.store(false, Ordering::SeqCst);
	}
}

/// In-memory document store with change fan-out
pub struct MemDocAdapter {
	collections: RwLock<CollectionMap>,
	channels: Mutex<Vec<MemChannel>>,
	opened_channels: AtomicU64,
	fail_batch_writes: AtomicU32,
	op_delay: Mutex<Option<Duration>>,
	log: Arc<CallLog>,
}

impl std::fmt::Debug for MemDocAdapter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "MemDocAdapter")
	}
}

impl MemDocAdapter {
	pub fn new() -> Arc<Self> {
		Self::with_log(Arc::new(CallLog::default()))
	}

	pub fn with_log(log: Arc<CallLog>) -> Arc<Self> {
		Arc::new(Self {
			collections: RwLock::new(HashMap::new()),
			channels: Mutex::new(Vec::new()),
			opened_channels: AtomicU64::new(0),
			fail_batch_writes: AtomicU32::new(0),
			op_delay: Mutex::new(None),
			log,
		})
	}

	pub fn log(&self) -> Arc<CallLog> {
		self.log.clone()
	}

	/// Seed a document directly, bypassing the batch path and change fan-out
	pub fn insert(&self, collection: &str, doc_id: &str, data: Value) {
		self.collections
			.write()
			.entry(collection.into())
			.or_default()
			.insert(doc_id.into(), data);
	}

	pub fn get(&self, collection: &str, doc_id: &str) -> Option<Value> {
		self.collections.read().get(collection).and_then(|c| c.get(doc_id)).cloned()
	}

	pub fn len(&self, collection: &str) -> usize {
		self.collections.read().get(collection).map_or(0, BTreeMap::len)
	}

	pub fn is_empty(&self, collection: &str) -> bool {
		self.len(collection) == 0
	}

	/// Deep copy of the whole store, for mutation (purity) assertions
	pub fn snapshot(&self) -> CollectionMap {
		self.collections.read().clone()
	}

	/// Fail the next `n` batch writes with a transient error
	pub fn fail_next_batch_writes(&self, n: u32) {
		self.fail_batch_writes.store(n, Ordering::SeqCst);
	}

	/// Add an artificial delay to every store operation
	pub fn set_op_delay(&self, delay: Duration) {
		*self.op_delay.lock() = Some(delay);
	}

	/// Number of channels opened over the adapter's lifetime
	pub fn opened_channel_count(&self) -> u64 {
		self.opened_channels.load(Ordering::SeqCst)
	}

	/// Number of currently open channels
	pub fn open_channel_count(&self) -> usize {
		let mut channels = self.channels.lock();
		channels.retain(|ch| ch.open.load(Ordering::SeqCst));
		channels.len()
	}

	async fn delay(&self) {
		let delay = *self.op_delay.lock();
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
	}

	fn matches(query: &Query, data: &Value) -> bool {
		match &query.filter {
			Some(filter) => data.get(filter.field.as_ref()) == Some(&filter.value),
			None => true,
		}
	}

	/// Fan a change event out to every open channel watching the collection
	fn notify(&self, operation: &str, collection: &str, doc_id: &str, data: &Value) {
		let event = json!({
			"operation": operation,
			"collection": collection,
			"docId": doc_id,
			"data": data,
		});

		let mut channels = self.channels.lock();
		channels.retain(|ch| {
			if !ch.open.load(Ordering::SeqCst) {
				return false;
			}
			if ch.query.collection.as_ref() != collection || !Self::matches(&ch.query, data) {
				return true;
			}
			ch.tx.send(event.clone()).is_ok()
		});
	}

	fn apply(&self, op: &WriteOp) {
		match op {
			WriteOp::Set { collection, doc_id, data } => {
				self.collections
					.write()
					.entry(collection.clone())
					.or_default()
					.insert(doc_id.clone(), data.clone());
				self.log.record(format!("doc.batch_set {}/{}", collection, doc_id));
				self.notify("set", collection, doc_id, data);
			}
			WriteOp::Update { collection, doc_id, data } => {
				let mut collections = self.collections.write();
				let entry = collections.entry(collection.clone()).or_default();
				let merged = match (entry.get(doc_id.as_ref()), data) {
					(Some(Value::Object(old)), Value::Object(new)) => {
						let mut merged = old.clone();
						for (k, v) in new {
							merged.insert(k.clone(), v.clone());
						}
						Value::Object(merged)
					}
					_ => data.clone(),
				};
				entry.insert(doc_id.clone(), merged.clone());
				drop(collections);
				self.log.record(format!("doc.batch_update {}/{}", collection, doc_id));
				self.notify("update", collection, doc_id, &merged);
			}
			WriteOp::Delete { collection, doc_id } => {
				let removed = self
					.collections
					.write()
					.get_mut(collection.as_ref())
					.and_then(|c| c.remove(doc_id.as_ref()));
				self.log.record(format!("doc.batch_delete {}/{}", collection, doc_id));
				if let Some(old) = removed {
					self.notify("delete", collection, doc_id, &old);
				}
			}
		}
	}
}

#[async_trait]
impl DocAdapter for MemDocAdapter {
	async fn open_channel(
		&self,
		query: &Query,
		tx: SnapshotSender,
	) -> SlResult<Box<dyn ChannelClose>> {
		self.delay().await;
		self.log.record(format!("doc.open_channel {}", query.channel_key()));
		self.opened_channels.fetch_add(1, Ordering::SeqCst);
		debug!("Opened channel for {}", query.channel_key());

		let open = Arc::new(AtomicBool::new(true));
		self.channels.lock().push(MemChannel { query: query.clone(), tx, open: open.clone() });
		Ok(Box::new(MemChannelClose { open }))
	}

	async fn run_query(&self, query: &Query) -> SlResult<Vec<Document>> {
		self.delay().await;
		self.log.record(format!("doc.query {}", query.channel_key()));

		let collections = self.collections.read();
		let Some(collection) = collections.get(query.collection.as_ref()) else {
			return Ok(Vec::new());
		};
		Ok(collection
			.iter()
			.filter(|(_, data)| Self::matches(query, data))
			.map(|(id, data)| Document { id: id.clone(), data: data.clone() })
			.collect())
	}

	async fn atomic_batch_write(&self, ops: &[WriteOp]) -> SlResult<()> {
		self.delay().await;

		// Fault injection: fail the whole batch, mutating nothing
		let pending = self.fail_batch_writes.load(Ordering::SeqCst);
		if pending > 0 {
			self.fail_batch_writes.store(pending - 1, Ordering::SeqCst);
			self.log.record(format!("doc.batch_write!fail [{}]", ops.len()));
			return Err(Error::ServiceUnavailable("injected batch write failure".into()));
		}

		self.log.record(format!("doc.batch_write [{}]", ops.len()));
		for op in ops {
			self.apply(op);
		}
		Ok(())
	}

	async fn delete_document(&self, collection: &str, doc_id: &str) -> SlResult<()> {
		self.delay().await;
		self.log.record(format!("doc.delete {}/{}", collection, doc_id));

		let removed =
			self.collections.write().get_mut(collection).and_then(|c| c.remove(doc_id));
		if let Some(old) = removed {
			self.notify("delete", collection, doc_id, &old);
		}
		Ok(())
	}
}

/// In-memory object store
pub struct MemObjectAdapter {
	objects: RwLock<HashMap<Box<str>, Box<[u8]>>>,
	deleted: Mutex<Vec<Box<str>>>,
	fail_ids: Mutex<HashSet<Box<str>>>,
	next_id: AtomicU64,
	log: Arc<CallLog>,
}

impl std::fmt::Debug for MemObjectAdapter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "MemObjectAdapter")
	}
}

impl MemObjectAdapter {
	pub fn new() -> Arc<Self> {
		Self::with_log(Arc::new(CallLog::default()))
	}

	pub fn with_log(log: Arc<CallLog>) -> Arc<Self> {
		Arc::new(Self {
			objects: RwLock::new(HashMap::new()),
			deleted: Mutex::new(Vec::new()),
			fail_ids: Mutex::new(HashSet::new()),
			next_id: AtomicU64::new(1),
			log,
		})
	}

	/// Seed an object directly
	pub fn put(&self, public_id: &str, bytes: &[u8]) {
		self.objects.write().insert(public_id.into(), bytes.into());
	}

	pub fn contains(&self, public_id: &str) -> bool {
		self.objects.read().contains_key(public_id)
	}

	/// Public ids deleted so far, in call order
	pub fn deleted(&self) -> Vec<Box<str>> {
		self.deleted.lock().clone()
	}

	/// Make deletes for `public_id` fail with a storage error
	pub fn fail_delete(&self, public_id: &str) {
		self.fail_ids.lock().insert(public_id.into());
	}
}

#[async_trait]
impl ObjectAdapter for MemObjectAdapter {
	async fn delete_object(&self, public_id: &str) -> SlResult<()> {
		self.log.record(format!("object.delete {}", public_id));

		if self.fail_ids.lock().contains(public_id) {
			return Err(Error::StorageError(format!("injected delete failure for {}", public_id)));
		}

		// Deleting a missing object is idempotent
		self.objects.write().remove(public_id);
		self.deleted.lock().push(public_id.into());
		Ok(())
	}

	async fn upload_object(&self, bytes: &[u8], folder: &str) -> SlResult<Box<str>> {
		let id = self.next_id.fetch_add(1, Ordering::SeqCst);
		let public_id = format!("obj_{}", id);
		self.objects.write().insert(public_id.clone().into_boxed_str(), bytes.into());
		self.log.record(format!("object.upload {}/{}", folder, public_id));
		Ok(format!("https://objects.local/{}/{}.bin", folder, public_id).into_boxed_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_atomic_batch_failure_mutates_nothing() {
		let doc = MemDocAdapter::new();
		doc.insert("messages", "m1", json!({"text": "hi"}));
		doc.fail_next_batch_writes(1);

		let ops = [WriteOp::Delete { collection: "messages".into(), doc_id: "m1".into() }];
		assert!(doc.atomic_batch_write(&ops).await.is_err());
		assert!(doc.get("messages", "m1").is_some());

		// Next attempt succeeds
		assert!(doc.atomic_batch_write(&ops).await.is_ok());
		assert!(doc.get("messages", "m1").is_none());
	}

	#[tokio::test]
	async fn test_equality_filter_query() {
		let doc = MemDocAdapter::new();
		doc.insert("messages", "m1", json!({"conversationId": "c1"}));
		doc.insert("messages", "m2", json!({"conversationId": "c2"}));

		let docs = doc
			.run_query(&Query::filtered("messages", "conversationId", "c1"))
			.await
			.unwrap();
		assert_eq!(docs.len(), 1);
		assert_eq!(docs[0].id.as_ref(), "m1");
	}
}

// vim: ts=4
