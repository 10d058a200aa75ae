//! Basic in-memory adapter operation tests
//!
//! Tests document CRUD, batch atomicity, and object-store semantics

use serde_json::json;
use std::sync::Arc;
use syncline_store_adapter_mem::{CallLog, MemDocAdapter, MemObjectAdapter};
use syncline_types::doc_adapter::{DocAdapter, Query, WriteOp};
use syncline_types::object_adapter::ObjectAdapter;

#[tokio::test]
async fn test_batch_set_and_query() {
	let doc = MemDocAdapter::new();

	doc.atomic_batch_write(&[
		WriteOp::Set {
			collection: "conversations".into(),
			doc_id: "c1".into(),
			data: json!({"title": "alpha"}),
		},
		WriteOp::Set {
			collection: "conversations".into(),
			doc_id: "c2".into(),
			data: json!({"title": "beta"}),
		},
	])
	.await
	.expect("batch write failed");

	let all = doc.run_query(&Query::collection("conversations")).await.expect("query failed");
	assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_update_merges_fields() {
	let doc = MemDocAdapter::new();
	doc.insert("messages", "m1", json!({"text": "hi", "read": false}));

	doc.atomic_batch_write(&[WriteOp::Update {
		collection: "messages".into(),
		doc_id: "m1".into(),
		data: json!({"read": true}),
	}])
	.await
	.expect("update failed");

	let data = doc.get("messages", "m1").expect("document missing");
	assert_eq!(data["text"], json!("hi"));
	assert_eq!(data["read"], json!(true));
}

#[tokio::test]
async fn test_delete_document_is_idempotent() {
	let doc = MemDocAdapter::new();
	doc.insert("messages", "m1", json!({}));

	doc.delete_document("messages", "m1").await.expect("delete failed");
	// Second delete of the same id is a no-op
	doc.delete_document("messages", "m1").await.expect("repeat delete failed");
	assert!(doc.get("messages", "m1").is_none());
}

#[tokio::test]
async fn test_injected_batch_failure_is_transient() {
	let doc = MemDocAdapter::new();
	doc.fail_next_batch_writes(1);

	let ops = [WriteOp::Set {
		collection: "messages".into(),
		doc_id: "m1".into(),
		data: json!({}),
	}];
	assert!(doc.atomic_batch_write(&ops).await.is_err());
	assert!(doc.atomic_batch_write(&ops).await.is_ok());
	assert_eq!(doc.len("messages"), 1);
}

#[tokio::test]
async fn test_object_store_delete_and_failures() {
	let object = MemObjectAdapter::new();
	object.put("a1", b"one");
	object.put("a2", b"two");
	object.fail_delete("a2");

	object.delete_object("a1").await.expect("delete failed");
	assert!(!object.contains("a1"));

	assert!(object.delete_object("a2").await.is_err());
	assert!(object.contains("a2"));

	// Deleting a missing object is idempotent
	object.delete_object("nope").await.expect("missing delete should succeed");
	assert_eq!(object.deleted().len(), 2);
}

#[tokio::test]
async fn test_upload_returns_resolvable_url() {
	let object = MemObjectAdapter::new();
	let url = object.upload_object(b"payload", "chat").await.expect("upload failed");

	let public_id = syncline_types::utils::public_id_from_url(&url);
	assert!(object.contains(public_id));
}

#[tokio::test]
async fn test_shared_call_log_orders_across_adapters() {
	let log = Arc::new(CallLog::default());
	let doc = MemDocAdapter::with_log(log.clone());
	let object = MemObjectAdapter::with_log(log.clone());

	object.delete_object("a1").await.expect("delete failed");
	doc.delete_document("messages", "m1").await.expect("delete failed");

	let entries = log.entries();
	assert_eq!(entries, ["object.delete a1", "doc.delete messages/m1"]);
}

// vim: ts=4
