use crate::err::{Error, GoneKind};
use crate::feed::{FeedResponse, FeedStart};
use crate::store::Collection;
use std::sync::Arc;

const TARGET: &str = "weir::core::feed::reader";

/// Reads pages of changes for one partition range from a starting position.
///
/// The reader translates the raw store signals into the processor's error
/// taxonomy: a split surfaces as [`Error::FeedSplit`], a missing resource
/// as [`Error::FeedNotFound`], and a stale range cache is refreshed and
/// retried exactly once before being surfaced.
pub struct FeedReader {
	/// The collection whose change feed is being read
	collection: Arc<dyn Collection>,
	/// The partition range this reader is bound to
	range: String,
	/// The page size hint for each read
	max_items: u32,
}

impl FeedReader {
	/// Create a new reader bound to a partition range
	pub fn new(collection: Arc<dyn Collection>, range: impl Into<String>, max_items: u32) -> Self {
		Self {
			collection,
			range: range.into(),
			max_items,
		}
	}
	/// The partition range this reader is bound to
	pub fn range(&self) -> &str {
		&self.range
	}
	/// Read the next page of changes from the given position
	#[instrument(level = "trace", target = "weir::core::feed::reader", skip(self, start))]
	pub async fn read(&self, start: &FeedStart) -> Result<FeedResponse, Error> {
		// Attempt the read, allowing one forced cache refresh
		let mut refreshed = false;
		loop {
			match self.collection.read_feed(&self.range, start, self.max_items).await {
				Err(Error::Gone {
					kind: GoneKind::NameCacheStale,
				}) if !refreshed => {
					// Force a refresh of the range topology and retry once
					trace!(target: TARGET, range = %self.range, "Range cache is stale, refreshing");
					self.collection.partition_ranges(true).await?;
					refreshed = true;
				}
				Err(Error::Gone {
					kind: GoneKind::NameCacheStale,
				}) => return Err(Error::NameCacheStale),
				Err(Error::Gone {
					..
				}) => {
					// The range was split, the controller must resync ownership
					trace!(target: TARGET, range = %self.range, "Range is gone, feed was split");
					return Err(Error::FeedSplit {
						continuation: start.continuation().map(str::to_string),
					});
				}
				Err(Error::ItemNotFound {
					..
				}) => return Err(Error::FeedNotFound),
				other => return other,
			}
		}
	}
}
