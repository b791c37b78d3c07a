use crate::err::Error;
use crate::lease::LeaseStore;
use crate::options::ProcessorOptions;
use crate::store::Collection;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const TARGET: &str = "weir::core::host::bootstrap";

/// Ensures the lease catalog exists and is seeded with one lease per
/// partition range before any processing starts.
///
/// Concurrent hosts race for a TTL-guarded lock; losers poll the marker
/// until the winner finishes. The TTL guarantees forward progress if the
/// winning host crashes mid-bootstrap. The whole procedure is idempotent
/// across restarts.
pub struct Bootstrapper {
	/// The lease catalog being seeded
	store: Arc<LeaseStore>,
	/// The monitored collection whose ranges seed the catalog
	monitored: Arc<dyn Collection>,
	/// The processor configuration
	options: ProcessorOptions,
}

impl Bootstrapper {
	/// Create a bootstrapper for a lease catalog
	pub fn new(
		store: Arc<LeaseStore>,
		monitored: Arc<dyn Collection>,
		options: ProcessorOptions,
	) -> Self {
		Self {
			store,
			monitored,
			options,
		}
	}
	/// Run the bootstrap protocol to completion
	#[instrument(level = "debug", target = "weir::core::host::bootstrap", skip(self, cancel))]
	pub async fn initialize(&self, cancel: &CancellationToken) -> Result<(), Error> {
		loop {
			if cancel.is_cancelled() {
				return Err(Error::Cancelled);
			}
			if self.store.is_initialized().await? {
				trace!(target: TARGET, "Lease catalog is initialized");
				return Ok(());
			}
			if self.store.acquire_init_lock(self.options.init_lock_ttl).await? {
				// We hold the lock, seed the catalog and always release
				let seeded = self.seed().await;
				if !self.store.release_init_lock().await? {
					warn!(target: TARGET, "The bootstrap lock expired before it was released");
				}
				seeded?;
				return Ok(());
			}
			// Another host is bootstrapping, wait for the marker to appear
			debug!(target: TARGET, "Waiting for another host to finish bootstrapping");
			tokio::select! {
				_ = cancel.cancelled() => return Err(Error::Cancelled),
				_ = tokio::time::sleep(self.options.init_retry_interval) => (),
			}
		}
	}
	/// Create one lease per partition range and write the marker
	async fn seed(&self) -> Result<(), Error> {
		// A crashed predecessor may have finished before losing its lock
		if self.store.is_initialized().await? {
			return Ok(());
		}
		let ranges = self.monitored.partition_ranges(true).await?;
		info!(target: TARGET, ranges = ranges.len(), "Seeding the lease catalog");
		for range in &ranges {
			self.store
				.create_lease_if_not_exists(
					&range.id,
					self.options.start_continuation.clone(),
					HashMap::new(),
				)
				.await?;
		}
		self.store.mark_initialized().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::mem::MemCollection;
	use std::time::Duration;

	fn bootstrapper(
		monitored: Arc<MemCollection>,
		leases: Arc<MemCollection>,
	) -> (Bootstrapper, Arc<LeaseStore>) {
		let store = Arc::new(LeaseStore::new(leases, "weir"));
		let options = ProcessorOptions::new()
			.init_retry_interval(Duration::from_millis(5));
		(Bootstrapper::new(store.clone(), monitored, options), store)
	}

	#[tokio::test]
	async fn one_lease_is_created_per_range() {
		let monitored = Arc::new(MemCollection::with_ranges("monitored", 3));
		let leases = Arc::new(MemCollection::new("leases"));
		let (first, store) = bootstrapper(monitored, leases);
		first.initialize(&CancellationToken::new()).await.unwrap();
		assert!(store.is_initialized().await.unwrap());
		let created = store.get_all_leases().await.unwrap();
		let tokens: Vec<&str> = created.iter().map(|l| l.token.as_str()).collect();
		assert_eq!(tokens, vec!["0", "1", "2"]);
	}

	#[tokio::test]
	async fn concurrent_bootstrap_seeds_exactly_once() {
		let monitored = Arc::new(MemCollection::with_ranges("monitored", 3));
		let leases = Arc::new(MemCollection::new("leases"));
		let mut tasks = Vec::new();
		for _ in 0..4 {
			let (host, _) = bootstrapper(monitored.clone(), leases.clone());
			tasks.push(tokio::spawn(async move {
				host.initialize(&CancellationToken::new()).await
			}));
		}
		for task in tasks {
			task.await.unwrap().unwrap();
		}
		let store = LeaseStore::new(leases, "weir");
		assert_eq!(store.get_all_leases().await.unwrap().len(), 3);
	}

	#[tokio::test]
	async fn repeated_bootstrap_is_idempotent() {
		let monitored = Arc::new(MemCollection::with_ranges("monitored", 2));
		let leases = Arc::new(MemCollection::new("leases"));
		let (first, store) = bootstrapper(monitored.clone(), leases.clone());
		first.initialize(&CancellationToken::new()).await.unwrap();
		let (again, _) = bootstrapper(monitored, leases);
		again.initialize(&CancellationToken::new()).await.unwrap();
		assert_eq!(store.get_all_leases().await.unwrap().len(), 2);
	}
}
