//! The document store capability consumed by the processor.
//!
//! The store client itself, its wire protocol, request retry and
//! authentication are all external concerns. The processor only requires
//! the small surface captured by [`Collection`]: identifier-addressed item
//! operations with optimistic concurrency stamps, the partition range
//! topology, and ordered change feed reads per range.

use crate::err::Error;
use crate::feed::{FeedResponse, FeedStart};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[cfg(feature = "store-mem")]
pub mod mem;
pub mod sync;

pub use self::sync::PartitionSynchronizer;

/// The minimum key of the partition key space
pub const RANGE_MIN: &str = "";
/// The maximum key of the partition key space
pub const RANGE_MAX: &str = "FF";

/// A contiguous sub-interval of the store's partition key space with its
/// own append-only change feed. The interval covers `[min, max)`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct PartitionRange {
	/// The opaque identifier of this range
	pub id: String,
	/// The inclusive lower bound of the range
	pub min: String,
	/// The exclusive upper bound of the range
	pub max: String,
}

impl PartitionRange {
	/// Create a new partition range definition
	pub fn new(id: impl Into<String>, min: impl Into<String>, max: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			min: min.into(),
			max: max.into(),
		}
	}
	/// Check whether this range overlaps the interval `[min, max)`
	pub fn overlaps(&self, min: &str, max: &str) -> bool {
		self.min.as_str() < max && self.max.as_str() > min
	}
}

/// The operations the processor requires from a document store collection.
///
/// Items are carried as opaque JSON values. The store is expected to
/// maintain three system fields on every stored item: `id` (caller
/// supplied), `_etag` (refreshed on every write, required for conditional
/// operations) and `_ts` (seconds since the Unix epoch at the last write).
#[async_trait]
pub trait Collection: Send + Sync + 'static {
	/// The name of this collection
	fn name(&self) -> &str;
	/// Create an item, failing if the identifier is already present.
	/// A TTL in seconds may be attached, after which the item vanishes.
	async fn create_item(&self, item: Value, ttl: Option<u64>) -> Result<Value, Error>;
	/// Fetch an item by identifier
	async fn read_item(&self, id: &str) -> Result<Option<Value>, Error>;
	/// Replace an item, conditional on its concurrency stamp when given
	async fn replace_item(&self, id: &str, item: Value, if_match: Option<&str>)
		-> Result<Value, Error>;
	/// Delete an item, conditional on its concurrency stamp when given.
	/// Returns whether an item was deleted.
	async fn delete_item(&self, id: &str, if_match: Option<&str>) -> Result<bool, Error>;
	/// List all items whose identifier starts with the given prefix
	async fn list_items(&self, id_prefix: &str) -> Result<Vec<Value>, Error>;
	/// Enumerate the current partition ranges of this collection
	async fn partition_ranges(&self, refresh: bool) -> Result<Vec<PartitionRange>, Error>;
	/// Read one page of the change feed for a partition range
	async fn read_feed(
		&self,
		range: &str,
		start: &FeedStart,
		max_items: u32,
	) -> Result<FeedResponse, Error>;
}

/// Extract the `id` system field from a stored item
pub(crate) fn item_id(item: &Value) -> Option<&str> {
	item.get("id").and_then(Value::as_str)
}

/// Extract the `_etag` system field from a stored item
pub(crate) fn item_etag(item: &Value) -> Option<&str> {
	item.get("_etag").and_then(Value::as_str)
}
