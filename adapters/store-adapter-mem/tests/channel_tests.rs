//! Change fan-out tests for the in-memory document adapter

use serde_json::json;
use syncline_store_adapter_mem::MemDocAdapter;
use syncline_types::doc_adapter::{DocAdapter, Query, WriteOp};

fn set_op(conv: &str, id: &str) -> WriteOp {
	WriteOp::Set {
		collection: "messages".into(),
		doc_id: id.into(),
		data: json!({"conversationId": conv}),
	}
}

#[tokio::test]
async fn test_channel_receives_matching_changes() {
	let doc = MemDocAdapter::new();
	let (tx, rx) = flume::unbounded();

	let _closer = doc
		.open_channel(&Query::filtered("messages", "conversationId", "c1"), tx)
		.await
		.expect("open failed");

	doc.atomic_batch_write(&[set_op("c1", "m1"), set_op("c2", "m2")])
		.await
		.expect("batch failed");

	let event = rx.try_recv().expect("no event delivered");
	assert_eq!(event["operation"], json!("set"));
	assert_eq!(event["docId"], json!("m1"));
	// The c2 write did not match the filter
	assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_closed_channel_stops_receiving() {
	let doc = MemDocAdapter::new();
	let (tx, rx) = flume::unbounded();

	let closer = doc
		.open_channel(&Query::collection("messages"), tx)
		.await
		.expect("open failed");
	assert_eq!(doc.open_channel_count(), 1);

	closer.close();
	// Closing twice is a no-op
	closer.close();
	assert_eq!(doc.open_channel_count(), 0);

	doc.atomic_batch_write(&[set_op("c1", "m1")]).await.expect("batch failed");
	assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_delete_notifies_with_old_data() {
	let doc = MemDocAdapter::new();
	doc.insert("messages", "m1", json!({"conversationId": "c1"}));

	let (tx, rx) = flume::unbounded();
	let _closer = doc
		.open_channel(&Query::collection("messages"), tx)
		.await
		.expect("open failed");

	doc.delete_document("messages", "m1").await.expect("delete failed");

	let event = rx.try_recv().expect("no event delivered");
	assert_eq!(event["operation"], json!("delete"));
	assert_eq!(event["data"]["conversationId"], json!("c1"));
}

// vim: ts=4
