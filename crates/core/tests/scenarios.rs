//! End-to-end scenarios over the in-memory engine: several host
//! instances sharing one lease catalog, bootstrap, rebalancing, splits
//! and backlog estimation.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use weir_core::err::Error;
use weir_core::est::RemainingWorkEstimator;
use weir_core::feed::FeedReader;
use weir_core::host::{
	Checkpointer, ObserverError, PartitionProcessor, PartitionSupervisor,
};
use weir_core::lease::{DocumentLeaseManager, LeaseManager, LeaseRenewer, LeaseStore};
use weir_core::store::mem::MemCollection;
use weir_core::{
	ChangeFeedObserver, ChangeFeedProcessor, CloseReason, ObserverContext, ProcessorOptions,
};

/// Records every observer interaction for later assertions
#[derive(Default)]
struct Recording {
	opens: Vec<String>,
	batches: Vec<(String, Vec<Value>, Option<String>)>,
	closes: Vec<(String, CloseReason)>,
}

#[derive(Default)]
struct RecordingObserver {
	recording: Mutex<Recording>,
}

impl RecordingObserver {
	fn opens(&self) -> usize {
		self.recording.lock().expect("poisoned").opens.len()
	}
	fn batch_count(&self) -> usize {
		self.recording.lock().expect("poisoned").batches.len()
	}
	fn continuations(&self) -> Vec<String> {
		self.recording
			.lock()
			.expect("poisoned")
			.batches
			.iter()
			.filter_map(|(_, _, continuation)| continuation.clone())
			.collect()
	}
	fn delivered_ids(&self) -> Vec<String> {
		self.recording
			.lock()
			.expect("poisoned")
			.batches
			.iter()
			.flat_map(|(_, items, _)| items.iter())
			.filter_map(|item| item.get("id").and_then(Value::as_str).map(str::to_string))
			.collect()
	}
	fn close_reasons(&self) -> Vec<CloseReason> {
		self.recording.lock().expect("poisoned").closes.iter().map(|(_, r)| *r).collect()
	}
}

#[async_trait]
impl ChangeFeedObserver for RecordingObserver {
	async fn open(&self, ctx: &ObserverContext) -> Result<(), ObserverError> {
		self.recording.lock().expect("poisoned").opens.push(ctx.lease_token().to_string());
		Ok(())
	}
	async fn process(&self, ctx: &ObserverContext, changes: Vec<Value>) -> Result<(), ObserverError> {
		self.recording.lock().expect("poisoned").batches.push((
			ctx.lease_token().to_string(),
			changes,
			ctx.continuation().map(str::to_string),
		));
		Ok(())
	}
	async fn close(&self, ctx: &ObserverContext, reason: CloseReason) -> Result<(), ObserverError> {
		self.recording
			.lock()
			.expect("poisoned")
			.closes
			.push((ctx.lease_token().to_string(), reason));
		Ok(())
	}
}

/// Options tuned for fast test cycles
fn fast_options() -> ProcessorOptions {
	ProcessorOptions::new()
		.acquire_interval(Duration::from_millis(20))
		.renew_interval(Duration::from_millis(30))
		.expiration_interval(Duration::from_millis(70))
		.poll_interval(Duration::from_millis(10))
		.init_retry_interval(Duration::from_millis(10))
}

fn processor(
	instance: &str,
	monitored: &Arc<MemCollection>,
	leases: &Arc<MemCollection>,
	observer: &Arc<RecordingObserver>,
	options: ProcessorOptions,
) -> ChangeFeedProcessor {
	ChangeFeedProcessor::builder()
		.instance_name(instance)
		.monitored_collection(monitored.clone())
		.lease_collection(leases.clone())
		.observer(observer.clone())
		.options(options)
		.build()
		.expect("builder is complete")
}

#[test_log::test(tokio::test)]
async fn a_single_host_bootstraps_and_idles_over_three_ranges() {
	let monitored = Arc::new(MemCollection::with_ranges("monitored", 3));
	let leases = Arc::new(MemCollection::new("leases"));
	let observer = Arc::new(RecordingObserver::default());
	let host = processor("host-a", &monitored, &leases, &observer, fast_options());
	host.start().await.expect("host starts");
	tokio::time::sleep(Duration::from_millis(80)).await;
	// The catalog was seeded and every range is being supervised
	let store = LeaseStore::new(leases.clone(), "weir");
	assert!(store.is_initialized().await.expect("marker readable"));
	let all = store.get_all_leases().await.expect("leases readable");
	assert_eq!(all.len(), 3);
	assert!(all.iter().all(|l| l.is_owned_by("host-a")));
	let renewed_at: Vec<_> = all.iter().map(|l| l.timestamp()).collect();
	// Leases keep being renewed while the feed stays idle
	tokio::time::sleep(Duration::from_millis(80)).await;
	let later = store.get_all_leases().await.expect("leases readable");
	assert!(later
		.iter()
		.zip(renewed_at.iter())
		.any(|(lease, earlier)| lease.timestamp() > *earlier));
	host.stop().await.expect("host stops");
	// Three observers opened, none processed, all closed by shutdown
	assert_eq!(observer.opens(), 3);
	assert_eq!(observer.batch_count(), 0);
	let reasons = observer.close_reasons();
	assert_eq!(reasons.len(), 3);
	assert!(reasons.iter().all(|r| *r == CloseReason::Shutdown));
}

#[test_log::test(tokio::test)]
async fn checkpoints_advance_monotonically_per_batch() {
	let monitored = Arc::new(MemCollection::new("monitored"));
	let leases = Arc::new(MemCollection::new("leases"));
	let observer = Arc::new(RecordingObserver::default());
	let options = fast_options().checkpoint_after_n_docs(1);
	let host = processor("host-a", &monitored, &leases, &observer, options);
	host.start().await.expect("host starts");
	tokio::time::sleep(Duration::from_millis(60)).await;
	// Deliver three changes far enough apart to land in separate batches
	for i in 0..3 {
		monitored.append("0", json!({"id": format!("d{i}")})).await.expect("append");
		tokio::time::sleep(Duration::from_millis(40)).await;
	}
	host.stop().await.expect("host stops");
	// Every delivered batch carried a later continuation than the last
	let continuations = observer.continuations();
	assert!(!continuations.is_empty());
	let numeric: Vec<u64> =
		continuations.iter().map(|c| c.parse().expect("numeric continuation")).collect();
	assert!(numeric.windows(2).all(|w| w[0] < w[1]));
	// And the persisted progress matches the tail of the feed
	let store = LeaseStore::new(leases.clone(), "weir");
	let lease = store.get_lease("0").await.expect("lease readable").expect("lease exists");
	assert_eq!(lease.continuation.as_deref(), Some("3"));
}

#[test_log::test(tokio::test)]
async fn an_abandoned_lease_is_stolen_and_the_loser_notices() {
	let monitored = Arc::new(MemCollection::new("monitored"));
	let leases = Arc::new(MemCollection::new("leases"));
	let store = Arc::new(LeaseStore::new(leases.clone(), "weir"));
	store.mark_initialized().await.expect("marker");
	let lease =
		store.create_lease_if_not_exists("0", None, HashMap::new()).await.expect("create").expect("fresh");
	// Host X acquires the lease but renews far too slowly to keep it
	let manager_x: Arc<dyn LeaseManager> =
		Arc::new(DocumentLeaseManager::new(leases.clone(), "host-x"));
	let mine = manager_x.acquire(&lease).await.expect("acquire").expect("owned");
	let slot = Arc::new(RwLock::new(mine));
	let observer_x = Arc::new(RecordingObserver::default());
	let options = fast_options();
	let checkpointer = Arc::new(Checkpointer::new(manager_x.clone(), slot.clone(), &options));
	let supervisor = PartitionSupervisor::new(
		"0",
		observer_x.clone(),
		Arc::new(PartitionProcessor::new(
			FeedReader::new(monitored.clone(), "0", 10),
			observer_x.clone(),
			checkpointer,
			slot.clone(),
			options.clone(),
		)),
		Arc::new(LeaseRenewer::new(manager_x, slot, Duration::from_millis(500))),
	);
	let supervision = tokio::spawn({
		let shutdown = CancellationToken::new();
		async move { supervisor.run(shutdown).await }
	});
	// Host Y balances, sees the lease expire, and takes it
	let observer_y = Arc::new(RecordingObserver::default());
	let host_y = processor("host-y", &monitored, &leases, &observer_y, fast_options());
	host_y.start().await.expect("host starts");
	tokio::time::sleep(Duration::from_millis(200)).await;
	let current = store.get_lease("0").await.expect("lease readable").expect("lease exists");
	assert!(current.is_owned_by("host-y"));
	// Y processes new changes on the stolen lease
	monitored.append("0", json!({"id": "fresh"})).await.expect("append");
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(observer_y.delivered_ids(), vec!["fresh".to_string()]);
	// X's next renewal observes the loss and closes with the reason
	let outcome = supervision.await.expect("supervision joins");
	assert!(matches!(outcome, Err(Error::LeaseLost { .. })));
	assert_eq!(observer_x.close_reasons(), vec![CloseReason::LeaseLost]);
	host_y.stop().await.expect("host stops");
}

#[test_log::test(tokio::test)]
async fn a_split_replaces_the_parent_lease_with_inheriting_children() {
	let monitored = Arc::new(MemCollection::new("monitored"));
	let leases = Arc::new(MemCollection::new("leases"));
	let store = Arc::new(LeaseStore::new(leases.clone(), "weir"));
	// Seed the catalog by hand so the parent lease carries properties
	store.mark_initialized().await.expect("marker");
	let mut properties = HashMap::new();
	properties.insert("tenant".to_string(), "blue".to_string());
	store.create_lease_if_not_exists("0", None, properties).await.expect("create");
	let observer = Arc::new(RecordingObserver::default());
	let host = processor("host-a", &monitored, &leases, &observer, fast_options());
	host.start().await.expect("host starts");
	// Process one change, then split the range out from under the reader
	monitored.append("0", json!({"id": "before"})).await.expect("append");
	tokio::time::sleep(Duration::from_millis(100)).await;
	let (left, right) = monitored.split_range("0").await.expect("split");
	tokio::time::sleep(Duration::from_millis(150)).await;
	// The parent lease is gone, both children exist and inherit from it
	assert!(store.get_lease("0").await.expect("readable").is_none());
	for child in [&left, &right] {
		let lease = store.get_lease(child).await.expect("readable").expect("child lease");
		assert_eq!(lease.properties.get("tenant").map(String::as_str), Some("blue"));
		assert_eq!(lease.continuation.as_deref(), Some("1"));
		assert!(lease.is_owned_by("host-a"));
	}
	// Changes in a child range flow to the observer
	monitored.append(&right, json!({"id": "after"})).await.expect("append");
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert!(observer.delivered_ids().contains(&"after".to_string()));
	host.stop().await.expect("host stops");
}

#[test_log::test(tokio::test)]
async fn the_estimator_tracks_the_backlog_of_a_running_host() {
	let monitored = Arc::new(MemCollection::new("monitored"));
	let leases = Arc::new(MemCollection::new("leases"));
	for i in 0..42 {
		monitored.append("0", json!({"id": format!("d{i}")})).await.expect("append");
	}
	let store = Arc::new(LeaseStore::new(leases.clone(), "weir"));
	store.mark_initialized().await.expect("marker");
	// Progress was checkpointed through the ninth change
	store
		.create_lease_if_not_exists("0", Some("9".to_string()), HashMap::new())
		.await
		.expect("create");
	let estimator = RemainingWorkEstimator::new(store.clone(), monitored.clone(), 4);
	assert_eq!(estimator.estimate().await.expect("estimate"), 33);
	// Draining the feed brings the estimate to zero
	let observer = Arc::new(RecordingObserver::default());
	let host = processor("host-a", &monitored, &leases, &observer, fast_options());
	host.start().await.expect("host starts");
	tokio::time::sleep(Duration::from_millis(150)).await;
	host.stop().await.expect("host stops");
	assert_eq!(estimator.estimate().await.expect("estimate"), 0);
}

#[test_log::test(tokio::test)]
async fn two_hosts_converge_to_an_even_share() {
	let monitored = Arc::new(MemCollection::with_ranges("monitored", 4));
	let leases = Arc::new(MemCollection::new("leases"));
	let observer_a = Arc::new(RecordingObserver::default());
	let observer_b = Arc::new(RecordingObserver::default());
	let host_a = processor("host-a", &monitored, &leases, &observer_a, fast_options());
	let host_b = processor("host-b", &monitored, &leases, &observer_b, fast_options());
	host_a.start().await.expect("host starts");
	host_b.start().await.expect("host starts");
	tokio::time::sleep(Duration::from_millis(400)).await;
	let store = LeaseStore::new(leases.clone(), "weir");
	let all = store.get_all_leases().await.expect("leases readable");
	let owned_a = all.iter().filter(|l| l.is_owned_by("host-a")).count();
	let owned_b = all.iter().filter(|l| l.is_owned_by("host-b")).count();
	assert_eq!(owned_a + owned_b, 4);
	// Within one lease of the fair share each
	assert!(owned_a >= 1 && owned_b >= 1, "owned_a={owned_a} owned_b={owned_b}");
	host_a.stop().await.expect("host stops");
	host_b.stop().await.expect("host stops");
}
