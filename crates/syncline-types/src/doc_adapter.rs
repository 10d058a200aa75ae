//! Adapter trait for the hosted document store.
//!
//! The core never talks to the remote database directly; it consumes this
//! narrow contract. The store's query planner, index selection, and wire
//! protocol live behind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;

use crate::prelude::*;

/// Equality filter on a single document field
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
	pub field: Box<str>,
	pub value: Value,
}

/// A query against one collection, optionally narrowed by an equality filter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
	pub collection: Box<str>,
	pub filter: Option<Filter>,
}

impl Query {
	pub fn collection(collection: impl Into<Box<str>>) -> Self {
		Self { collection: collection.into(), filter: None }
	}

	pub fn filtered(
		collection: impl Into<Box<str>>,
		field: impl Into<Box<str>>,
		value: impl Into<Value>,
	) -> Self {
		Self {
			collection: collection.into(),
			filter: Some(Filter { field: field.into(), value: value.into() }),
		}
	}

	/// Stable channel identity for this query.
	///
	/// Two queries with the same key share one underlying channel, so the key
	/// must be a pure function of the query.
	pub fn channel_key(&self) -> String {
		match &self.filter {
			Some(f) => format!("{}?{}={}", self.collection, f.field, f.value),
			None => self.collection.to_string(),
		}
	}
}

/// One document as returned by `run_query`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Document {
	pub id: Box<str>,
	pub data: Value,
}

impl Document {
	/// String field accessor, `None` when absent or not a string
	pub fn str_field(&self, field: &str) -> Option<&str> {
		self.data.get(field).and_then(Value::as_str)
	}
}

/// A single mutation inside an atomic batch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum WriteOp {
	Set { collection: Box<str>, doc_id: Box<str>, data: Value },
	Update { collection: Box<str>, doc_id: Box<str>, data: Value },
	Delete { collection: Box<str>, doc_id: Box<str> },
}

impl WriteOp {
	pub fn doc_id(&self) -> &str {
		match self {
			WriteOp::Set { doc_id, .. }
			| WriteOp::Update { doc_id, .. }
			| WriteOp::Delete { doc_id, .. } => doc_id,
		}
	}

	pub fn collection(&self) -> &str {
		match self {
			WriteOp::Set { collection, .. }
			| WriteOp::Update { collection, .. }
			| WriteOp::Delete { collection, .. } => collection,
		}
	}
}

/// Idempotent close capability for an open channel.
///
/// Modeled as a trait object rather than a bare closure so that ownership and
/// idempotence are type-checked at the seam.
pub trait ChannelClose: Send + Sync {
	/// Close the underlying channel. Calling twice is a no-op.
	fn close(&self);
}

/// Sender half of a channel's change feed
pub type SnapshotSender = flume::Sender<Value>;

#[async_trait]
pub trait DocAdapter: Debug + Send + Sync {
	/// Opens a long-lived subscription to change notifications for `query`.
	///
	/// Snapshots are delivered on `tx` until the returned capability is
	/// closed. Errors during establishment are returned; errors after
	/// establishment close the feed.
	async fn open_channel(&self, query: &Query, tx: SnapshotSender)
		-> SlResult<Box<dyn ChannelClose>>;

	/// One-shot read
	async fn run_query(&self, query: &Query) -> SlResult<Vec<Document>>;

	/// All-or-nothing multi-document mutation
	async fn atomic_batch_write(&self, ops: &[WriteOp]) -> SlResult<()>;

	/// Deletes a single document. Deleting a missing document is a no-op.
	async fn delete_document(&self, collection: &str, doc_id: &str) -> SlResult<()>;
}


// vim: ts=4
