use crate::err::Error;
use crate::feed::{FeedReader, FeedResponse, FeedStart};
use crate::host::{ChangeFeedObserver, Checkpointer, ObserverContext};
use crate::lease::Lease;
use crate::options::ProcessorOptions;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const TARGET: &str = "weir::core::host::partition";

/// Reads one partition range's change feed and drives the observer.
///
/// The loop is strictly sequential for its range: read a page, deliver it,
/// advance the continuation, maybe checkpoint, repeat. Terminal feed
/// conditions are surfaced as the matching error kinds for the supervisor
/// to translate into a close reason.
pub struct PartitionProcessor {
	/// The reader bound to this partition range
	reader: FeedReader,
	/// The observer receiving the change batches
	observer: Arc<dyn ChangeFeedObserver>,
	/// The checkpointer persisting progress into the lease
	checkpointer: Arc<Checkpointer>,
	/// The shared slot holding the owned lease
	lease: Arc<RwLock<Lease>>,
	/// The processor configuration
	options: ProcessorOptions,
}

impl PartitionProcessor {
	/// Create a processor for one owned partition range
	pub fn new(
		reader: FeedReader,
		observer: Arc<dyn ChangeFeedObserver>,
		checkpointer: Arc<Checkpointer>,
		lease: Arc<RwLock<Lease>>,
		options: ProcessorOptions,
	) -> Self {
		Self {
			reader,
			observer,
			checkpointer,
			lease,
			options,
		}
	}
	/// Process the partition until cancelled or a terminal fault occurs
	#[instrument(level = "debug", target = "weir::core::host::partition", skip(self, cancel), fields(range = %self.reader.range()))]
	pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
		let token = self.lease.read().await.token.clone();
		// Resume from the continuation recorded on the lease, if any
		let mut continuation = self.lease.read().await.continuation.clone();
		loop {
			if cancel.is_cancelled() {
				return Ok(());
			}
			let start = FeedStart::resolve(&self.options, continuation.as_deref());
			let response = tokio::select! {
				_ = cancel.cancelled() => return Ok(()),
				response = self.reader.read(&start) => response,
			};
			match response {
				Ok(FeedResponse::Page(page)) => {
					let count = page.items.len() as u64;
					trace!(target: TARGET, range = %self.reader.range(), count, "Delivering a batch");
					let ctx = ObserverContext::for_batch(
						token.clone(),
						page.etag.clone(),
						self.checkpointer.clone(),
					);
					self.observer.process(&ctx, page.items).await.map_err(|source| {
						Error::Observer {
							source,
						}
					})?;
					// The batch was acknowledged, adopt its continuation
					continuation = Some(page.etag.clone());
					self.checkpointer.batch_processed(count, &page.etag).await?;
				}
				Ok(FeedResponse::NotModified {
					etag,
					..
				}) => {
					// No new changes, adopt the position and back off
					continuation = Some(etag);
					tokio::select! {
						_ = cancel.cancelled() => return Ok(()),
						_ = tokio::time::sleep(self.options.poll_interval) => (),
					}
				}
				Err(Error::FeedSplit {
					..
				}) => {
					// Attach the last acknowledged continuation for the
					// controller's split handling
					return Err(Error::FeedSplit {
						continuation: continuation.clone(),
					});
				}
				Err(Error::Throttled {
					retry_after,
				}) => {
					// Back off for the requested time and try again
					warn!(target: TARGET, range = %self.reader.range(), "Feed read was throttled");
					tokio::select! {
						_ = cancel.cancelled() => return Ok(()),
						_ = tokio::time::sleep(retry_after) => (),
					}
				}
				Err(e) => return Err(e),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::host::ObserverError;
	use crate::lease::{DocumentLeaseManager, LeaseManager, LeaseStore};
	use crate::store::mem::MemCollection;
	use async_trait::async_trait;
	use serde_json::{json, Value};
	use std::collections::HashMap;
	use std::sync::Mutex;
	use std::time::Duration;

	struct Recorder {
		batches: Mutex<Vec<Vec<Value>>>,
		fail: bool,
	}

	#[async_trait]
	impl ChangeFeedObserver for Recorder {
		async fn process(
			&self,
			_ctx: &ObserverContext,
			changes: Vec<Value>,
		) -> Result<(), ObserverError> {
			if self.fail {
				return Err("observer exploded".into());
			}
			self.batches.lock().expect("poisoned").push(changes);
			Ok(())
		}
	}

	async fn processor(
		fail: bool,
	) -> (Arc<MemCollection>, Arc<Recorder>, PartitionProcessor, Arc<RwLock<Lease>>) {
		let monitored = Arc::new(MemCollection::new("monitored"));
		let leases = Arc::new(MemCollection::new("leases"));
		let store = LeaseStore::new(leases.clone(), "weir");
		let lease =
			store.create_lease_if_not_exists("0", None, HashMap::new()).await.unwrap().unwrap();
		let manager = Arc::new(DocumentLeaseManager::new(leases, "host-a"));
		let mine = manager.acquire(&lease).await.unwrap().unwrap();
		let slot = Arc::new(RwLock::new(mine));
		let options =
			ProcessorOptions::new().start_from_beginning().poll_interval(Duration::from_millis(5));
		let observer = Arc::new(Recorder {
			batches: Mutex::new(Vec::new()),
			fail,
		});
		let checkpointer = Arc::new(Checkpointer::new(manager, slot.clone(), &options));
		let reader = FeedReader::new(monitored.clone(), "0", options.max_items);
		let processor = PartitionProcessor::new(
			reader,
			observer.clone(),
			checkpointer,
			slot.clone(),
			options,
		);
		(monitored, observer, processor, slot)
	}

	#[tokio::test]
	async fn batches_are_delivered_and_checkpointed_in_order() {
		let (monitored, observer, processor, slot) = processor(false).await;
		for i in 0..3 {
			monitored.append("0", json!({"id": format!("d{i}")})).await.unwrap();
		}
		let cancel = CancellationToken::new();
		let stop = cancel.clone();
		let task = tokio::spawn(async move { processor.run(stop).await });
		tokio::time::sleep(Duration::from_millis(50)).await;
		cancel.cancel();
		task.await.unwrap().unwrap();
		let batches = observer.batches.lock().expect("poisoned");
		let delivered: usize = batches.iter().map(Vec::len).sum();
		assert_eq!(delivered, 3);
		// Progress was persisted up to the tail of the feed
		assert_eq!(slot.read().await.continuation.as_deref(), Some("3"));
	}

	#[tokio::test]
	async fn observer_failure_is_terminal() {
		let (monitored, _, processor, _) = processor(true).await;
		monitored.append("0", json!({"id": "d"})).await.unwrap();
		let err = processor.run(CancellationToken::new()).await.unwrap_err();
		assert!(matches!(err, Error::Observer { .. }));
	}

	#[tokio::test]
	async fn split_carries_the_last_acknowledged_continuation() {
		let (monitored, _, processor, _) = processor(false).await;
		monitored.append("0", json!({"id": "d"})).await.unwrap();
		let cancel = CancellationToken::new();
		let handle = {
			let stop = cancel.clone();
			tokio::spawn(async move { processor.run(stop).await })
		};
		// Let the first batch through, then split the range
		tokio::time::sleep(Duration::from_millis(30)).await;
		monitored.split_range("0").await.unwrap();
		let err = handle.await.unwrap().unwrap_err();
		match err {
			Error::FeedSplit {
				continuation,
			} => assert_eq!(continuation.as_deref(), Some("1")),
			other => panic!("expected a split, got {other:?}"),
		}
	}
}
