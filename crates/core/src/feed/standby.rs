use crate::err::Error;
use crate::feed::{CompositeContinuation, FeedResponse, FeedStart};
use crate::store::{Collection, PartitionSynchronizer};
use serde_json::Value;
use std::sync::Arc;

const TARGET: &str = "weir::core::feed::standby";

/// The outcome of one stand-by read across the composite's ranges
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum StandbyResponse {
	/// One range delivered a page of changes
	Page {
		/// The changed items, in the range's commit order
		items: Vec<Value>,
		/// The serialized composite continuation to resume from
		continuation: String,
	},
	/// Every range was idle for a full traversal of the ring
	NotModified {
		/// The serialized composite continuation to resume from
		continuation: String,
	},
}

/// A pull-mode iterator multiplexing one change feed cursor across every
/// partition range, round-robin.
///
/// Each [`read_next`] call walks the ring starting at the current range:
/// idle ranges update their token and rotate away, the first page found is
/// returned, and a full idle traversal returns the accumulated composite.
/// A split splices the child ranges in place of their parent, inheriting
/// its token. Any other error breaks the ring and surfaces unchanged.
///
/// [`read_next`]: StandbyIterator::read_next
pub struct StandbyIterator {
	/// The collection whose change feed is being read
	collection: Arc<dyn Collection>,
	/// The partition topology, used to resolve ranges and splits
	synchronizer: PartitionSynchronizer,
	/// The per-range continuation ring
	composite: CompositeContinuation,
	/// The page size hint for each read
	max_items: u32,
}

impl StandbyIterator {
	/// Create an iterator reading every range from the beginning
	pub fn new(collection: Arc<dyn Collection>, max_items: u32) -> Self {
		Self {
			synchronizer: PartitionSynchronizer::new(collection.clone()),
			collection,
			composite: CompositeContinuation::default(),
			max_items,
		}
	}
	/// Create an iterator resuming from a serialized composite continuation
	pub fn from_continuation(
		collection: Arc<dyn Collection>,
		continuation: &str,
		max_items: u32,
	) -> Result<Self, Error> {
		let composite = CompositeContinuation::parse(continuation)?;
		Ok(Self {
			synchronizer: PartitionSynchronizer::new(collection.clone()),
			collection,
			composite,
			max_items,
		})
	}
	/// Read the next available page of changes, rotating across ranges.
	#[instrument(level = "trace", target = "weir::core::feed::standby", skip(self))]
	pub async fn read_next(&mut self) -> Result<StandbyResponse, Error> {
		self.ensure_initialized().await?;
		// The min bound of the first idle range marks a full traversal
		let mut first_idle: Option<String> = None;
		loop {
			let current = match self.composite.current() {
				Some(entry) => entry.clone(),
				None => {
					return Err(Error::Store {
						message: "the composite continuation holds no ranges".to_string(),
					})
				}
			};
			if first_idle.as_deref() == Some(current.min.as_str()) {
				// The ring is complete, everything was idle
				return Ok(StandbyResponse::NotModified {
					continuation: self.composite.serialize()?,
				});
			}
			let range = self.resolve_current(&current.min, &current.max).await?;
			let start = match self.composite.current().and_then(|c| c.token.clone()) {
				Some(token) => FeedStart::Continuation(token),
				None => FeedStart::Beginning,
			};
			match self.collection.read_feed(&range, &start, self.max_items).await {
				Ok(FeedResponse::Page(page)) => {
					// Record the new position and hand the turn to the
					// successor before reporting back
					self.composite.update_current_token(page.etag);
					self.composite.move_next();
					return Ok(StandbyResponse::Page {
						items: page.items,
						continuation: self.composite.serialize()?,
					});
				}
				Ok(FeedResponse::NotModified {
					etag,
					..
				}) => {
					trace!(target: TARGET, range = %range, "Range is idle");
					self.composite.update_current_token(etag);
					if first_idle.is_none() {
						first_idle = Some(current.min.clone());
					}
					self.composite.move_next();
				}
				Err(error) if error.is_split() => {
					// Replace the head with its children and keep reading
					self.handle_split(&current.min, &current.max).await?;
				}
				// Anything else breaks the ring and surfaces unchanged
				Err(error) => return Err(error),
			}
		}
	}
	/// Populate the composite from the topology on first use
	async fn ensure_initialized(&mut self) -> Result<(), Error> {
		if !self.composite.is_empty() {
			return Ok(());
		}
		let ranges = self.synchronizer.ranges(true).await?;
		if ranges.is_empty() {
			return Err(Error::Store {
				message: format!("collection '{}' reports no partition ranges", self.collection.name()),
			});
		}
		self.composite = CompositeContinuation::from_ranges(&ranges, None);
		Ok(())
	}
	/// Resolve the head entry's bounds to a live range identifier,
	/// splicing in children when the topology moved underneath us
	async fn resolve_current(&mut self, min: &str, max: &str) -> Result<String, Error> {
		let overlapping = self.synchronizer.overlapping(min, max, false).await?;
		match overlapping.as_slice() {
			[only] if only.min == min && only.max == max => Ok(only.id.clone()),
			[] => Err(Error::Store {
				message: format!("no partition range covers ({min}, {max})"),
			}),
			_ => {
				// The cached topology already shows the split
				self.composite.replace_current(&overlapping);
				let head = self.composite.current().ok_or_else(|| Error::Store {
					message: "the composite continuation holds no ranges".to_string(),
				})?;
				let id = overlapping
					.iter()
					.find(|r| r.min == head.min)
					.map(|r| r.id.clone())
					.ok_or_else(|| Error::Store {
						message: format!("no partition range covers ({min}, {max})"),
					})?;
				Ok(id)
			}
		}
	}
	/// Refresh the topology after a split and splice the children in
	async fn handle_split(&mut self, min: &str, max: &str) -> Result<(), Error> {
		debug!(target: TARGET, min = %min, max = %max, "Stand-by range was split, refreshing");
		let children = self.synchronizer.overlapping(min, max, true).await?;
		if children.is_empty() {
			return Err(Error::Store {
				message: format!("no partition range covers ({min}, {max}) after a split"),
			});
		}
		self.composite.replace_current(&children);
		Ok(())
	}
}
