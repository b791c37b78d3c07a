use crate::err::Error;
use crate::store::{Collection, PartitionRange};
use std::sync::Arc;
use tokio::sync::RwLock;

const TARGET: &str = "weir::core::store::sync";

/// Keeps a cached view of the collection's partition range topology and
/// resolves the child ranges produced by a split.
///
/// The cache deliberately lags the store: when a range disappears the stale
/// entry is what lets us recover the parent's bounds, which are then used
/// to find the children among the refreshed ranges.
pub struct PartitionSynchronizer {
	/// The collection whose topology is being tracked
	collection: Arc<dyn Collection>,
	/// The last observed set of partition ranges
	cache: RwLock<Vec<PartitionRange>>,
}

impl PartitionSynchronizer {
	/// Create a new synchronizer over a collection
	pub fn new(collection: Arc<dyn Collection>) -> Self {
		Self {
			collection,
			cache: RwLock::new(Vec::new()),
		}
	}
	/// The current set of partition ranges, refreshed from the store when
	/// requested or when nothing has been cached yet
	pub async fn ranges(&self, refresh: bool) -> Result<Vec<PartitionRange>, Error> {
		if !refresh {
			let cached = self.cache.read().await;
			if !cached.is_empty() {
				return Ok(cached.clone());
			}
		}
		// Fetch the topology and remember it
		let fresh = self.collection.partition_ranges(refresh).await?;
		trace!(target: TARGET, count = fresh.len(), "Refreshed partition range topology");
		*self.cache.write().await = fresh.clone();
		Ok(fresh)
	}
	/// Look up a range by identifier in the cached topology
	pub async fn range_by_id(&self, id: &str) -> Result<Option<PartitionRange>, Error> {
		let ranges = self.ranges(false).await?;
		Ok(ranges.into_iter().find(|r| r.id == id))
	}
	/// Make sure a range is present in the cached topology, refreshing
	/// once when it is not. Returns the cached range, if any; a range
	/// that stays unknown after a refresh no longer exists in the store.
	pub async fn ensure_range(&self, id: &str) -> Result<Option<PartitionRange>, Error> {
		if let Some(range) = self.range_by_id(id).await? {
			return Ok(Some(range));
		}
		self.ranges(true).await?;
		self.range_by_id(id).await
	}
	/// The ranges overlapping the interval `[min, max)`
	pub async fn overlapping(
		&self,
		min: &str,
		max: &str,
		refresh: bool,
	) -> Result<Vec<PartitionRange>, Error> {
		let ranges = self.ranges(refresh).await?;
		Ok(ranges.into_iter().filter(|r| r.overlaps(min, max)).collect())
	}
	/// Resolve the child ranges which replaced a split parent.
	///
	/// The parent's bounds are taken from the cached topology, the topology
	/// is refreshed, and every refreshed range tiling the parent's interval
	/// is returned. A split always produces at least two children.
	#[instrument(level = "trace", target = "weir::core::store::sync", skip(self))]
	pub async fn split_ranges(&self, parent: &str) -> Result<Vec<PartitionRange>, Error> {
		// Recover the parent's bounds before refreshing
		let known = self.range_by_id(parent).await?.ok_or_else(|| Error::Store {
			message: format!("unknown parent range '{parent}'"),
		})?;
		// Refresh and collect the ranges replacing the parent
		let children: Vec<PartitionRange> = self
			.overlapping(&known.min, &known.max, true)
			.await?
			.into_iter()
			.filter(|r| r.id != parent)
			.collect();
		if children.len() < 2 {
			return Err(Error::Store {
				message: format!(
					"range '{parent}' was reported gone but only {} replacement ranges exist",
					children.len()
				),
			});
		}
		debug!(target: TARGET, parent = %parent, children = children.len(), "Resolved split children");
		Ok(children)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::mem::MemCollection;

	#[tokio::test]
	async fn split_children_tile_the_parent() {
		let collection = Arc::new(MemCollection::new("monitored"));
		let synchronizer = PartitionSynchronizer::new(collection.clone());
		// Warm the cache with the pre-split topology
		let before = synchronizer.ranges(true).await.unwrap();
		assert_eq!(before.len(), 1);
		collection.split_range("0").await.unwrap();
		let children = synchronizer.split_ranges("0").await.unwrap();
		assert_eq!(children.len(), 2);
		assert_eq!(children[0].min, before[0].min);
		assert_eq!(children[0].max, children[1].min);
		assert_eq!(children[1].max, before[0].max);
	}

	#[tokio::test]
	async fn unknown_parent_is_an_error() {
		let collection = Arc::new(MemCollection::new("monitored"));
		let synchronizer = PartitionSynchronizer::new(collection);
		assert!(synchronizer.split_ranges("nope").await.is_err());
	}
}
