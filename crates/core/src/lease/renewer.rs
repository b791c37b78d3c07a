use crate::err::Error;
use crate::lease::{Lease, LeaseManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const TARGET: &str = "weir::core::lease::renewer";

/// Periodically renews one owned lease so it is not considered abandoned.
///
/// The renewed record is written back into the shared lease slot so the
/// checkpointer always works from the freshest concurrency stamp. Loss of
/// the lease is terminal; any other renewal failure is logged and retried
/// on the next tick.
pub struct LeaseRenewer {
	/// The manager performing the conditional writes
	manager: Arc<dyn LeaseManager>,
	/// The shared slot holding the owned lease
	lease: Arc<RwLock<Lease>>,
	/// How often the lease is renewed
	interval: Duration,
}

impl LeaseRenewer {
	/// Create a renewer for one owned lease
	pub fn new(manager: Arc<dyn LeaseManager>, lease: Arc<RwLock<Lease>>, interval: Duration) -> Self {
		Self {
			manager,
			lease,
			interval,
		}
	}
	/// Renew the lease until cancelled or lost
	pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
		loop {
			// Wait out the renewal interval, exiting promptly on cancel
			tokio::select! {
				_ = cancel.cancelled() => return Ok(()),
				_ = tokio::time::sleep(self.interval) => (),
			}
			let current = self.lease.read().await.clone();
			match self.manager.renew(&current).await {
				Ok(renewed) => {
					trace!(target: TARGET, token = %renewed.token, "Renewed lease");
					*self.lease.write().await = renewed;
				}
				Err(Error::LeaseLost {
					token,
				}) => {
					debug!(target: TARGET, token = %token, "Lease was lost during renewal");
					return Err(Error::LeaseLost {
						token,
					});
				}
				Err(e) => {
					// Transient renewal failure, try again next tick
					warn!(target: TARGET, token = %current.token, error = %e, "Failed to renew lease");
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::lease::{DocumentLeaseManager, LeaseStore};
	use crate::store::mem::MemCollection;
	use std::collections::HashMap;

	#[tokio::test]
	async fn renewal_advances_the_clock_until_cancelled() {
		let collection = Arc::new(MemCollection::new("leases"));
		let store = LeaseStore::new(collection.clone(), "weir");
		let lease =
			store.create_lease_if_not_exists("0", None, HashMap::new()).await.unwrap().unwrap();
		let manager = Arc::new(DocumentLeaseManager::new(collection, "host-a"));
		let mine = manager.acquire(&lease).await.unwrap().unwrap();
		let first_clock = mine.timestamp();
		let slot = Arc::new(RwLock::new(mine));
		let renewer =
			LeaseRenewer::new(manager.clone(), slot.clone(), Duration::from_millis(10));
		let cancel = CancellationToken::new();
		let stop = cancel.clone();
		let task = tokio::spawn(async move { renewer.run(stop).await });
		tokio::time::sleep(Duration::from_millis(50)).await;
		cancel.cancel();
		task.await.unwrap().unwrap();
		assert!(slot.read().await.timestamp() >= first_clock);
	}

	#[tokio::test]
	async fn a_stolen_lease_stops_the_renewer() {
		let collection = Arc::new(MemCollection::new("leases"));
		let store = LeaseStore::new(collection.clone(), "weir");
		let lease =
			store.create_lease_if_not_exists("0", None, HashMap::new()).await.unwrap().unwrap();
		let owner = Arc::new(DocumentLeaseManager::new(collection.clone(), "host-a"));
		let thief = DocumentLeaseManager::new(collection, "host-b");
		let mine = owner.acquire(&lease).await.unwrap().unwrap();
		thief.acquire(&mine).await.unwrap().unwrap();
		let slot = Arc::new(RwLock::new(mine));
		let renewer = LeaseRenewer::new(owner, slot, Duration::from_millis(5));
		let err = renewer.run(CancellationToken::new()).await.unwrap_err();
		assert!(matches!(err, Error::LeaseLost { .. }));
	}
}
