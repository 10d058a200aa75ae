//! Shared fixtures for integration tests

use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use syncline::channel_registry::DataCallback;
use syncline::settings::{ActivitySettings, BatchSettings, RetryPolicy, SyncSettings};
use syncline::SyncManager;
use syncline_store_adapter_mem::{CallLog, MemDocAdapter, MemObjectAdapter};

pub struct TestEnv {
	pub doc: Arc<MemDocAdapter>,
	pub object: Arc<MemObjectAdapter>,
	pub log: Arc<CallLog>,
	pub manager: Arc<SyncManager>,
}

/// Millisecond-scale settings so lifecycle tests run quickly
pub fn fast_settings() -> SyncSettings {
	SyncSettings {
		activity: ActivitySettings {
			active_threshold: Duration::from_millis(60),
			cleanup_interval: Duration::from_millis(500),
			memory_threshold: 100,
		},
		batch: BatchSettings {
			batch_delay: Duration::from_millis(40),
			batch_size_threshold: 4,
			retry: RetryPolicy::new((Duration::from_millis(20), Duration::from_millis(80)), 3),
		},
		cleanup: syncline::settings::CleanupSettings::default(),
	}
}

pub fn test_env() -> TestEnv {
	let _ = tracing_subscriber::fmt().try_init();

	let log = Arc::new(CallLog::default());
	let doc = MemDocAdapter::with_log(log.clone());
	let object = MemObjectAdapter::with_log(log.clone());
	let manager = SyncManager::new(doc.clone(), object.clone(), fast_settings());
	TestEnv { doc, object, log, manager }
}

/// Callback collecting every received snapshot
pub fn collector() -> (DataCallback, Arc<Mutex<Vec<Value>>>) {
	let seen = Arc::new(Mutex::new(Vec::new()));
	let sink = seen.clone();
	let callback: DataCallback = Arc::new(move |data: &Value| {
		sink.lock().unwrap().push(data.clone());
	});
	(callback, seen)
}

// vim: ts=4
