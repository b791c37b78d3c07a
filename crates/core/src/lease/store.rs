use crate::err::Error;
use crate::lease::Lease;
use crate::store::{item_etag, Collection};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const TARGET: &str = "weir::core::lease::store";

/// The persistent catalog of leases, together with the bootstrap marker
/// and the bootstrap lock.
///
/// All items live in one collection under a configurable prefix: the
/// marker at `<prefix>.info`, the lock at `<prefix>.lock`, and one lease
/// per partition range at `<prefix>..<token>`.
pub struct LeaseStore {
	/// The collection holding the lease catalog
	collection: Arc<dyn Collection>,
	/// The namespace prefix for all item identifiers
	prefix: String,
	/// The concurrency stamp of the lock item this instance created
	lock_token: Mutex<Option<String>>,
}

impl LeaseStore {
	/// Create a lease store over a collection with an identifier prefix
	pub fn new(collection: Arc<dyn Collection>, prefix: impl Into<String>) -> Self {
		Self {
			collection,
			prefix: prefix.into(),
			lock_token: Mutex::new(None),
		}
	}
	/// The identifier of the bootstrap marker item
	fn marker_id(&self) -> String {
		format!("{}.info", self.prefix)
	}
	/// The identifier of the bootstrap lock item
	fn lock_id(&self) -> String {
		format!("{}.lock", self.prefix)
	}
	/// The identifier of the lease item for a partition range
	pub fn lease_id(&self, token: &str) -> String {
		format!("{}..{}", self.prefix, token)
	}
	/// Check whether the lease catalog has been seeded
	pub async fn is_initialized(&self) -> Result<bool, Error> {
		Ok(self.collection.read_item(&self.marker_id()).await?.is_some())
	}
	/// Record that the lease catalog has been seeded. Idempotent.
	pub async fn mark_initialized(&self) -> Result<(), Error> {
		let marker = json!({ "id": self.marker_id() });
		match self.collection.create_item(marker, None).await {
			Ok(_) => Ok(()),
			Err(Error::AlreadyExists {
				..
			}) => Ok(()),
			Err(e) => Err(e),
		}
	}
	/// Try to take the bootstrap lock for `ttl`. Returns whether this
	/// instance now holds the lock. The TTL guarantees forward progress
	/// if the locking host crashes mid-bootstrap.
	#[instrument(level = "trace", target = "weir::core::lease::store", skip(self))]
	pub async fn acquire_init_lock(&self, ttl: Duration) -> Result<bool, Error> {
		let lock = json!({ "id": self.lock_id(), "ttl": ttl.as_secs() });
		match self.collection.create_item(lock, Some(ttl.as_secs())).await {
			Ok(stored) => {
				// Remember the stamp so only our own lock can be released
				let token = item_etag(&stored).map(str::to_string);
				*self.lock_token.lock().await = token;
				trace!(target: TARGET, "Acquired the bootstrap lock");
				Ok(true)
			}
			Err(Error::AlreadyExists {
				..
			}) => Ok(false),
			Err(e) => Err(e),
		}
	}
	/// Release the bootstrap lock taken by this instance. Returns whether
	/// the lock was deleted.
	pub async fn release_init_lock(&self) -> Result<bool, Error> {
		let token = self.lock_token.lock().await.take();
		let Some(token) = token else {
			return Ok(false);
		};
		match self.collection.delete_item(&self.lock_id(), Some(&token)).await {
			Ok(deleted) => Ok(deleted),
			Err(Error::Conflict {
				..
			}) => Ok(false),
			Err(e) => Err(e),
		}
	}
	/// Fetch every lease in the catalog
	pub async fn get_all_leases(&self) -> Result<Vec<Lease>, Error> {
		let prefix = format!("{}..", self.prefix);
		let items = self.collection.list_items(&prefix).await?;
		let mut leases = Vec::with_capacity(items.len());
		for item in items {
			leases.push(serde_json::from_value(item)?);
		}
		Ok(leases)
	}
	/// Fetch the lease for a partition range
	pub async fn get_lease(&self, token: &str) -> Result<Option<Lease>, Error> {
		match self.collection.read_item(&self.lease_id(token)).await? {
			Some(item) => Ok(Some(serde_json::from_value(item)?)),
			None => Ok(None),
		}
	}
	/// Create a lease for a partition range unless one already exists.
	/// Returns the created lease, or `None` when another host won the race.
	#[instrument(level = "trace", target = "weir::core::lease::store", skip(self, properties))]
	pub async fn create_lease_if_not_exists(
		&self,
		token: &str,
		continuation: Option<String>,
		properties: HashMap<String, String>,
	) -> Result<Option<Lease>, Error> {
		let mut lease = Lease::new(self.lease_id(token), token);
		lease.continuation = continuation;
		lease.properties = properties;
		let item = serde_json::to_value(&lease)?;
		match self.collection.create_item(item, None).await {
			Ok(stored) => {
				trace!(target: TARGET, token = %token, "Created lease");
				Ok(Some(serde_json::from_value(stored)?))
			}
			Err(Error::AlreadyExists {
				..
			}) => Ok(None),
			Err(e) => Err(e),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::mem::MemCollection;

	fn store() -> LeaseStore {
		LeaseStore::new(Arc::new(MemCollection::new("leases")), "weir")
	}

	#[tokio::test]
	async fn marker_is_idempotent() {
		let store = store();
		assert!(!store.is_initialized().await.unwrap());
		store.mark_initialized().await.unwrap();
		store.mark_initialized().await.unwrap();
		assert!(store.is_initialized().await.unwrap());
	}

	#[tokio::test]
	async fn lock_is_exclusive_until_released() {
		let collection = Arc::new(MemCollection::new("leases"));
		let first = LeaseStore::new(collection.clone(), "weir");
		let second = LeaseStore::new(collection, "weir");
		assert!(first.acquire_init_lock(Duration::from_secs(60)).await.unwrap());
		assert!(!second.acquire_init_lock(Duration::from_secs(60)).await.unwrap());
		assert!(first.release_init_lock().await.unwrap());
		assert!(second.acquire_init_lock(Duration::from_secs(60)).await.unwrap());
	}

	#[tokio::test]
	async fn releasing_without_the_lock_is_a_no_op() {
		let store = store();
		assert!(!store.release_init_lock().await.unwrap());
	}

	#[tokio::test]
	async fn leases_are_listed_without_marker_and_lock() {
		let store = store();
		store.mark_initialized().await.unwrap();
		store.acquire_init_lock(Duration::from_secs(60)).await.unwrap();
		store.create_lease_if_not_exists("0", None, HashMap::new()).await.unwrap();
		store.create_lease_if_not_exists("1", Some("42".to_string()), HashMap::new()).await.unwrap();
		let leases = store.get_all_leases().await.unwrap();
		assert_eq!(leases.len(), 2);
		assert_eq!(leases[0].token, "0");
		assert_eq!(leases[1].continuation.as_deref(), Some("42"));
	}

	#[tokio::test]
	async fn create_is_first_writer_wins() {
		let store = store();
		assert!(store
			.create_lease_if_not_exists("0", None, HashMap::new())
			.await
			.unwrap()
			.is_some());
		assert!(store
			.create_lease_if_not_exists("0", None, HashMap::new())
			.await
			.unwrap()
			.is_none());
	}
}
