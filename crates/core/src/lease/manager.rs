use crate::cnf::LEASE_CONFLICT_RETRIES;
use crate::err::Error;
use crate::lease::Lease;
use crate::store::Collection;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

const TARGET: &str = "weir::core::lease::manager";

/// The lease operations the processing machinery depends on.
///
/// Every ownership-changing write is conditional on the concurrency stamp
/// last observed for the lease. The store serializes racing writers; this
/// layer detects the losing side and reports it as lease loss.
#[async_trait]
pub trait LeaseManager: Send + Sync + 'static {
	/// Take ownership of a lease for this instance.
	/// Returns the post-write lease, or `None` when another instance took
	/// ownership in between.
	async fn acquire(&self, lease: &Lease) -> Result<Option<Lease>, Error>;
	/// Refresh the renewal clock of an owned lease
	async fn renew(&self, lease: &Lease) -> Result<Lease, Error>;
	/// Give up ownership of a lease, leaving it free for any instance
	async fn release(&self, lease: &Lease) -> Result<(), Error>;
	/// Persist the user properties of an owned lease without touching
	/// its ownership
	async fn update_properties(&self, lease: &Lease) -> Result<Lease, Error>;
	/// Persist observer progress into an owned lease and refresh its
	/// renewal clock
	async fn checkpoint(&self, lease: &Lease, continuation: &str) -> Result<Lease, Error>;
	/// Remove a lease from the catalog unconditionally
	async fn delete(&self, lease: &Lease) -> Result<(), Error>;
}

/// A [`LeaseManager`] persisting leases as documents in a collection.
pub struct DocumentLeaseManager {
	/// The collection holding the lease catalog
	collection: Arc<dyn Collection>,
	/// The name stamped into the owner field on acquisition
	instance: String,
}

impl DocumentLeaseManager {
	/// Create a manager writing leases on behalf of an instance
	pub fn new(collection: Arc<dyn Collection>, instance: impl Into<String>) -> Self {
		Self {
			collection,
			instance: instance.into(),
		}
	}
	/// The instance name this manager writes into acquired leases
	pub fn instance(&self) -> &str {
		&self.instance
	}
	/// Write a mutated lease conditionally on its concurrency stamp.
	///
	/// When the stamp has moved, the current record is re-read. If the
	/// owner is no longer the one the caller observed, the lease was taken
	/// by someone else. Otherwise the stamp moved through a concurrent
	/// write of our own (renewal racing a checkpoint) and the mutation is
	/// re-applied onto the fresh record, a bounded number of times.
	async fn update_lease<F>(&self, lease: &Lease, mutate: F) -> Result<Lease, Error>
	where
		F: Fn(&mut Lease) + Send + Sync,
	{
		let expected_owner = lease.owner.clone();
		let mut current = lease.clone();
		for _ in 0..LEASE_CONFLICT_RETRIES {
			let mut next = current.clone();
			mutate(&mut next);
			let item = serde_json::to_value(&next)?;
			let stamp = current.concurrency_token.clone();
			match self.collection.replace_item(&next.id, item, stamp.as_deref()).await {
				Ok(stored) => return Ok(serde_json::from_value(stored)?),
				Err(Error::Conflict {
					..
				}) => {
					// The stamp moved, fetch the record to see who owns it now
					let fresh = self.collection.read_item(&lease.id).await?;
					let fresh: Lease = match fresh {
						Some(item) => serde_json::from_value(item)?,
						None => {
							return Err(Error::LeaseLost {
								token: lease.token.clone(),
							})
						}
					};
					if fresh.owner != expected_owner {
						trace!(
							target: TARGET,
							token = %lease.token,
							owner = ?fresh.owner,
							"Lease changed owner mid-write"
						);
						return Err(Error::LeaseLost {
							token: lease.token.clone(),
						});
					}
					current = fresh;
				}
				Err(Error::ItemNotFound {
					..
				}) => {
					return Err(Error::LeaseLost {
						token: lease.token.clone(),
					})
				}
				Err(e) => return Err(e),
			}
		}
		Err(Error::LeaseLost {
			token: lease.token.clone(),
		})
	}
}

#[async_trait]
impl LeaseManager for DocumentLeaseManager {
	#[instrument(level = "trace", target = "weir::core::lease::manager", skip(self, lease), fields(token = %lease.token))]
	async fn acquire(&self, lease: &Lease) -> Result<Option<Lease>, Error> {
		let instance = self.instance.clone();
		let result = self
			.update_lease(lease, move |l| {
				l.owner = Some(instance.clone());
				l.explicit_timestamp = Some(Utc::now());
			})
			.await;
		match result {
			Ok(acquired) => Ok(Some(acquired)),
			// Another instance stole the lease between our read and write
			Err(Error::LeaseLost {
				..
			}) => Ok(None),
			Err(e) => Err(e),
		}
	}

	#[instrument(level = "trace", target = "weir::core::lease::manager", skip(self, lease), fields(token = %lease.token))]
	async fn renew(&self, lease: &Lease) -> Result<Lease, Error> {
		if !lease.is_owned_by(&self.instance) {
			return Err(Error::LeaseLost {
				token: lease.token.clone(),
			});
		}
		self.update_lease(lease, |l| {
			l.explicit_timestamp = Some(Utc::now());
		})
		.await
	}

	#[instrument(level = "trace", target = "weir::core::lease::manager", skip(self, lease), fields(token = %lease.token))]
	async fn release(&self, lease: &Lease) -> Result<(), Error> {
		self.update_lease(lease, |l| {
			l.owner = None;
			l.explicit_timestamp = Some(Utc::now());
		})
		.await?;
		trace!(target: TARGET, token = %lease.token, "Released lease");
		Ok(())
	}

	async fn update_properties(&self, lease: &Lease) -> Result<Lease, Error> {
		if !lease.is_owned_by(&self.instance) {
			return Err(Error::LeaseLost {
				token: lease.token.clone(),
			});
		}
		let properties = lease.properties.clone();
		self.update_lease(lease, move |l| {
			l.properties = properties.clone();
		})
		.await
	}

	#[instrument(level = "trace", target = "weir::core::lease::manager", skip(self, lease, continuation), fields(token = %lease.token))]
	async fn checkpoint(&self, lease: &Lease, continuation: &str) -> Result<Lease, Error> {
		if continuation.is_empty() {
			return Err(Error::InvalidContinuation {
				value: continuation.to_string(),
			});
		}
		let continuation = continuation.to_string();
		self.update_lease(lease, move |l| {
			l.continuation = Some(continuation.clone());
			l.explicit_timestamp = Some(Utc::now());
		})
		.await
	}

	async fn delete(&self, lease: &Lease) -> Result<(), Error> {
		self.collection.delete_item(&lease.id, None).await?;
		Ok(())
	}
}
