//! Channel Registry
//!
//! Deduplicates and reference-counts live subscriptions keyed by a logical
//! resource key. Many UI components interested in the same data share exactly
//! one underlying store channel; the registry owns that channel and fans
//! incoming snapshots out to every registered listener.
//!
//! Losing the last listener does NOT close the channel: a re-render churns
//! listeners far more often than a user truly leaves a resource, so the
//! registry only fires its idle hook and leaves suspend timing to the
//! activity tracker.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::prelude::*;
use syncline_types::doc_adapter::ChannelClose;
use syncline_types::utils::random_id;

/// Re-invocable channel opener, retained across suspend/resume cycles
pub type ChannelOpener =
	Arc<dyn Fn() -> BoxFuture<'static, SlResult<LiveChannel>> + Send + Sync>;

/// Per-listener snapshot callback
pub type DataCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Hook fired when a key loses its last listener
pub type IdleHook = Arc<dyn Fn(&str) + Send + Sync>;

/// An established channel: the close capability plus the forwarding task
pub struct LiveChannel {
	closer: Box<dyn ChannelClose>,
	forward: Option<tokio::task::JoinHandle<()>>,
}

impl LiveChannel {
	pub fn new(closer: Box<dyn ChannelClose>, forward: Option<tokio::task::JoinHandle<()>>) -> Self {
		Self { closer, forward }
	}

	fn shutdown(self) {
		self.closer.close();
		if let Some(handle) = self.forward {
			handle.abort();
		}
	}
}

/// Channel status of one subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
	Active,
	Suspended,
}

struct Listener {
	id: Box<str>,
	on_data: DataCallback,
}

struct SlotState {
	status: ChannelStatus,
	channel: Option<LiveChannel>,
	opener: ChannelOpener,
}

/// One subscription entry. The async mutex serializes open/suspend/resume
/// for this key; listener churn only touches the sync lock.
struct Slot {
	state: tokio::sync::Mutex<SlotState>,
	listeners: RwLock<Vec<Listener>>,
	suspended: AtomicBool,
}

impl Slot {
	fn new(opener: ChannelOpener) -> Arc<Self> {
		Arc::new(Self {
			state: tokio::sync::Mutex::new(SlotState {
				status: ChannelStatus::Active,
				channel: None,
				opener,
			}),
			listeners: RwLock::new(Vec::new()),
			suspended: AtomicBool::new(false),
		})
	}
}

/// Registry statistics
#[derive(Debug, Clone)]
pub struct RegistryStats {
	/// Number of subscription entries (one underlying channel each)
	pub subscriptions: usize,
	/// Total registered listeners across all keys
	pub listeners: usize,
	/// Entries currently suspended
	pub suspended: usize,
}

/// Deduplicating, reference-counted subscription registry
#[derive(Clone)]
pub struct ChannelRegistry {
	slots: Arc<RwLock<HashMap<Box<str>, Arc<Slot>>>>,
	idle_hook: Arc<RwLock<Option<IdleHook>>>,
}

impl ChannelRegistry {
	pub fn new() -> Self {
		Self {
			slots: Arc::new(RwLock::new(HashMap::new())),
			idle_hook: Arc::new(RwLock::new(None)),
		}
	}

	/// Install the hook fired when a key loses its last listener
	pub fn set_idle_hook(&self, hook: IdleHook) {
		*self.idle_hook.write() = Some(hook);
	}

	pub fn clear_idle_hook(&self) {
		*self.idle_hook.write() = None;
	}

	/// Register interest in `key`.
	///
	/// The first subscriber's `opener` establishes the real channel; later
	/// subscribers share it and their `opener` argument is ignored. A failed
	/// initial open propagates the error and leaves no partial entry.
	pub async fn subscribe(
		&self,
		key: &str,
		opener: ChannelOpener,
		on_data: DataCallback,
	) -> SlResult<ListenerGuard> {
		let listener_id: Box<str> = random_id()?.into();

		loop {
			let slot = {
				let mut slots = self.slots.write();
				slots.entry(key.into()).or_insert_with(|| Slot::new(opener.clone())).clone()
			};

			let mut state = slot.state.lock().await;

			// A concurrent subscriber may have failed its open and dropped the
			// slot while we waited for the state lock; start over on a fresh one.
			if !self.slot_live(key, &slot) {
				continue;
			}

			if state.channel.is_none() && state.status == ChannelStatus::Active {
				match (state.opener)().await {
					Ok(channel) => {
						debug!("Opened channel for {}", key);
						state.channel = Some(channel);
					}
					Err(e) => {
						drop(state);
						self.drop_slot_if_unused(key, &slot);
						return Err(e);
					}
				}
			}

			slot.listeners
				.write()
				.push(Listener { id: listener_id.clone(), on_data: on_data.clone() });
			drop(state);

			debug!("Listener {} registered for {}", listener_id, key);
			return Ok(ListenerGuard {
				registry: self.clone(),
				key: key.into(),
				listener_id,
				released: AtomicBool::new(false),
				release_on_drop: false,
			});
		}
	}

	/// Deliver `data` to every listener currently registered for `key`.
	///
	/// A panicking listener is isolated; the rest still receive the event.
	/// Returns the number of successful deliveries.
	pub fn broadcast(&self, key: &str, data: &Value) -> usize {
		let Some(slot) = self.slots.read().get(key).cloned() else {
			return 0;
		};

		// Snapshot the listener set: registrations after this point do not
		// retroactively receive the event.
		let callbacks: Vec<DataCallback> =
			slot.listeners.read().iter().map(|l| l.on_data.clone()).collect();

		let mut delivered = 0;
		for cb in callbacks {
			match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(data))) {
				Ok(()) => delivered += 1,
				Err(_) => warn!("Listener for {} panicked during broadcast", key),
			}
		}
		delivered
	}

	/// Close the underlying channel but retain the opener for later resume.
	/// No-op if already suspended or unknown.
	pub async fn suspend(&self, key: &str) -> SlResult<()> {
		let Some(slot) = self.slots.read().get(key).cloned() else {
			return Ok(());
		};

		let mut state = slot.state.lock().await;
		if state.status == ChannelStatus::Suspended {
			debug!("Suspend {}: already suspended", key);
			return Ok(());
		}

		if let Some(channel) = state.channel.take() {
			channel.shutdown();
		}
		state.status = ChannelStatus::Suspended;
		slot.suspended.store(true, Ordering::SeqCst);
		info!("Suspended channel for {}", key);
		Ok(())
	}

	/// Re-invoke the retained opener and mark the entry active.
	/// No-op if already active or unknown; a failed reopen keeps the entry
	/// suspended and returns the error.
	pub async fn resume(&self, key: &str) -> SlResult<()> {
		let Some(slot) = self.slots.read().get(key).cloned() else {
			return Ok(());
		};

		let mut state = slot.state.lock().await;
		if state.status == ChannelStatus::Active {
			debug!("Resume {}: already active", key);
			return Ok(());
		}

		let channel = (state.opener)().await?;
		state.channel = Some(channel);
		state.status = ChannelStatus::Active;
		slot.suspended.store(false, Ordering::SeqCst);
		info!("Resumed channel for {}", key);
		Ok(())
	}

	/// Drop the entry outright, closing its channel if one is open.
	///
	/// Used by the reaper once the suspension grace period has elapsed with
	/// no listeners. Removing an unknown key is a no-op.
	pub async fn remove(&self, key: &str) {
		let slot = self.slots.write().remove(key);
		if let Some(slot) = slot {
			let mut state = slot.state.lock().await;
			if let Some(channel) = state.channel.take() {
				channel.shutdown();
			}
			debug!("Removed subscription entry for {}", key);
		}
	}

	/// Like [`remove`](Self::remove), but only when the key has no listeners.
	///
	/// Returns true if the entry was removed. Keys with live listeners are
	/// left untouched: destruction requires both zero references and an
	/// elapsed grace period, and the caller only knows about the latter.
	pub async fn remove_if_idle(&self, key: &str) -> bool {
		let slot = {
			let mut slots = self.slots.write();
			match slots.get(key) {
				Some(slot) if slot.listeners.read().is_empty() => slots.remove(key),
				_ => None,
			}
		};
		match slot {
			Some(slot) => {
				let mut state = slot.state.lock().await;
				if let Some(channel) = state.channel.take() {
					channel.shutdown();
				}
				debug!("Removed idle subscription entry for {}", key);
				true
			}
			None => false,
		}
	}

	/// Close every channel and drop all entries (shutdown path)
	pub async fn close_all(&self) {
		let drained: Vec<Arc<Slot>> = self.slots.write().drain().map(|(_, slot)| slot).collect();
		for slot in drained {
			let mut state = slot.state.lock().await;
			if let Some(channel) = state.channel.take() {
				channel.shutdown();
			}
		}
	}

	pub fn stats(&self) -> RegistryStats {
		let slots = self.slots.read();
		let mut listeners = 0;
		let mut suspended = 0;
		for slot in slots.values() {
			listeners += slot.listeners.read().len();
			if slot.suspended.load(Ordering::SeqCst) {
				suspended += 1;
			}
		}
		RegistryStats { subscriptions: slots.len(), listeners, suspended }
	}

	/// Listener count for one key
	pub fn listener_count(&self, key: &str) -> usize {
		self.slots.read().get(key).map_or(0, |slot| slot.listeners.read().len())
	}

	pub fn status(&self, key: &str) -> Option<ChannelStatus> {
		self.slots.read().get(key).map(|slot| {
			if slot.suspended.load(Ordering::SeqCst) {
				ChannelStatus::Suspended
			} else {
				ChannelStatus::Active
			}
		})
	}

	fn slot_live(&self, key: &str, slot: &Arc<Slot>) -> bool {
		self.slots.read().get(key).is_some_and(|s| Arc::ptr_eq(s, slot))
	}

	fn drop_slot_if_unused(&self, key: &str, slot: &Arc<Slot>) {
		let mut slots = self.slots.write();
		if let Some(current) = slots.get(key) {
			if Arc::ptr_eq(current, slot) && slot.listeners.read().is_empty() {
				slots.remove(key);
			}
		}
	}

	fn release_listener(&self, key: &str, listener_id: &str) {
		let Some(slot) = self.slots.read().get(key).cloned() else {
			return;
		};

		let now_idle = {
			let mut listeners = slot.listeners.write();
			let before = listeners.len();
			listeners.retain(|l| l.id.as_ref() != listener_id);
			before > 0 && listeners.is_empty()
		};
		debug!("Listener {} released for {}", listener_id, key);

		if now_idle {
			let hook = self.idle_hook.read().clone();
			if let Some(hook) = hook {
				hook(key);
			}
		}
	}
}

impl Default for ChannelRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Capability object detaching one listener registration.
///
/// `release` is idempotent; releasing never force-closes a channel that
/// other listeners still hold.
pub struct ListenerGuard {
	registry: ChannelRegistry,
	key: Box<str>,
	listener_id: Box<str>,
	released: AtomicBool,
	release_on_drop: bool,
}

impl ListenerGuard {
	pub fn key(&self) -> &str {
		&self.key
	}

	/// Detach this listener. Calling twice is a safe no-op.
	pub fn release(&self) {
		if !self.released.swap(true, Ordering::SeqCst) {
			self.registry.release_listener(&self.key, &self.listener_id);
		}
	}

	/// Opt into RAII release for call sites that prefer drop semantics
	pub fn release_on_drop(mut self) -> Self {
		self.release_on_drop = true;
		self
	}
}

impl Drop for ListenerGuard {
	fn drop(&mut self) {
		if self.release_on_drop {
			self.release();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;
	use std::sync::Mutex;

	struct NoopClose;

	impl ChannelClose for NoopClose {
		fn close(&self) {}
	}

	fn counting_opener(opens: Arc<AtomicUsize>) -> ChannelOpener {
		Arc::new(move || {
			let opens = opens.clone();
			Box::pin(async move {
				opens.fetch_add(1, Ordering::SeqCst);
				Ok(LiveChannel::new(Box::new(NoopClose), None))
			})
		})
	}

	fn failing_opener() -> ChannelOpener {
		Arc::new(|| {
			Box::pin(async { Err(Error::ServiceUnavailable("connect refused".into())) })
		})
	}

	fn collecting_callback(seen: Arc<Mutex<Vec<Value>>>) -> DataCallback {
		Arc::new(move |data| seen.lock().unwrap().push(data.clone()))
	}

	#[tokio::test]
	async fn test_subscribe_dedup() {
		let registry = ChannelRegistry::new();
		let opens = Arc::new(AtomicUsize::new(0));

		let mut guards = Vec::new();
		for _ in 0..5 {
			let seen = Arc::new(Mutex::new(Vec::new()));
			let guard = registry
				.subscribe("messages/conv1", counting_opener(opens.clone()), collecting_callback(seen))
				.await
				.unwrap();
			guards.push(guard);
		}

		// Five callers, one real channel
		assert_eq!(opens.load(Ordering::SeqCst), 1);
		let stats = registry.stats();
		assert_eq!(stats.subscriptions, 1);
		assert_eq!(stats.listeners, 5);
	}

	#[tokio::test]
	async fn test_release_keeps_survivor_delivery() {
		let registry = ChannelRegistry::new();
		let opens = Arc::new(AtomicUsize::new(0));

		let survivor_seen = Arc::new(Mutex::new(Vec::new()));
		let survivor = registry
			.subscribe(
				"messages/conv1",
				counting_opener(opens.clone()),
				collecting_callback(survivor_seen.clone()),
			)
			.await
			.unwrap();

		let mut others = Vec::new();
		for _ in 0..3 {
			let seen = Arc::new(Mutex::new(Vec::new()));
			others.push(
				registry
					.subscribe("messages/conv1", counting_opener(opens.clone()), collecting_callback(seen))
					.await
					.unwrap(),
			);
		}
		for guard in &others {
			guard.release();
		}

		let delivered = registry.broadcast("messages/conv1", &serde_json::json!({"n": 1}));
		assert_eq!(delivered, 1);
		assert_eq!(survivor_seen.lock().unwrap().len(), 1);
		drop(survivor);
	}

	#[tokio::test]
	async fn test_double_release_is_noop() {
		let registry = ChannelRegistry::new();
		let opens = Arc::new(AtomicUsize::new(0));
		let seen = Arc::new(Mutex::new(Vec::new()));

		let g1 = registry
			.subscribe("conv", counting_opener(opens.clone()), collecting_callback(seen.clone()))
			.await
			.unwrap();
		let g2 = registry
			.subscribe("conv", counting_opener(opens.clone()), collecting_callback(seen))
			.await
			.unwrap();

		g1.release();
		g1.release();
		assert_eq!(registry.listener_count("conv"), 1);
		drop(g2);
	}

	#[tokio::test]
	async fn test_failed_open_leaves_no_entry() {
		let registry = ChannelRegistry::new();
		let seen = Arc::new(Mutex::new(Vec::new()));

		let result = registry.subscribe("bad", failing_opener(), collecting_callback(seen)).await;
		assert!(result.is_err());
		assert_eq!(registry.stats().subscriptions, 0);
	}

	#[tokio::test]
	async fn test_suspend_resume_idempotent() {
		let registry = ChannelRegistry::new();
		let opens = Arc::new(AtomicUsize::new(0));
		let seen = Arc::new(Mutex::new(Vec::new()));

		let _guard = registry
			.subscribe("conv", counting_opener(opens.clone()), collecting_callback(seen.clone()))
			.await
			.unwrap();
		assert_eq!(opens.load(Ordering::SeqCst), 1);

		registry.suspend("conv").await.unwrap();
		registry.suspend("conv").await.unwrap();
		assert_eq!(registry.status("conv"), Some(ChannelStatus::Suspended));

		registry.resume("conv").await.unwrap();
		registry.resume("conv").await.unwrap();
		assert_eq!(registry.status("conv"), Some(ChannelStatus::Active));
		// One initial open plus exactly one reopen
		assert_eq!(opens.load(Ordering::SeqCst), 2);

		// Delivery restored without a new subscribe call
		let delivered = registry.broadcast("conv", &serde_json::json!({"n": 2}));
		assert_eq!(delivered, 1);
		assert_eq!(seen.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_suspend_unknown_key_is_noop() {
		let registry = ChannelRegistry::new();
		registry.suspend("nothing").await.unwrap();
		registry.resume("nothing").await.unwrap();
	}

	#[tokio::test]
	async fn test_broadcast_isolates_panicking_listener() {
		let registry = ChannelRegistry::new();
		let opens = Arc::new(AtomicUsize::new(0));

		let _bad = registry
			.subscribe(
				"conv",
				counting_opener(opens.clone()),
				Arc::new(|_data: &Value| panic!("listener bug")),
			)
			.await
			.unwrap();

		let seen = Arc::new(Mutex::new(Vec::new()));
		let _good = registry
			.subscribe("conv", counting_opener(opens), collecting_callback(seen.clone()))
			.await
			.unwrap();

		let delivered = registry.broadcast("conv", &serde_json::json!({"n": 3}));
		assert_eq!(delivered, 1);
		assert_eq!(seen.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_idle_hook_fires_on_last_release() {
		let registry = ChannelRegistry::new();
		let opens = Arc::new(AtomicUsize::new(0));
		let idle_keys = Arc::new(Mutex::new(Vec::new()));

		{
			let idle_keys = idle_keys.clone();
			registry.set_idle_hook(Arc::new(move |key: &str| {
				idle_keys.lock().unwrap().push(key.to_string());
			}));
		}

		let seen = Arc::new(Mutex::new(Vec::new()));
		let g1 = registry
			.subscribe("conv", counting_opener(opens.clone()), collecting_callback(seen.clone()))
			.await
			.unwrap();
		let g2 = registry
			.subscribe("conv", counting_opener(opens), collecting_callback(seen))
			.await
			.unwrap();

		g1.release();
		assert!(idle_keys.lock().unwrap().is_empty());

		g2.release();
		assert_eq!(idle_keys.lock().unwrap().as_slice(), ["conv"]);

		// Entry survives idleness; only remove() drops it
		assert_eq!(registry.stats().subscriptions, 1);
		registry.remove("conv").await;
		assert_eq!(registry.stats().subscriptions, 0);
	}

	#[tokio::test]
	async fn test_remove_if_idle_spares_live_listeners() {
		let registry = ChannelRegistry::new();
		let opens = Arc::new(AtomicUsize::new(0));
		let seen = Arc::new(Mutex::new(Vec::new()));

		let guard = registry
			.subscribe("conv", counting_opener(opens), collecting_callback(seen))
			.await
			.unwrap();

		assert!(!registry.remove_if_idle("conv").await);
		assert_eq!(registry.stats().subscriptions, 1);

		guard.release();
		assert!(registry.remove_if_idle("conv").await);
		assert_eq!(registry.stats().subscriptions, 0);
	}
}

// vim: ts=4
