#![cfg(feature = "store-mem")]

//! An in-memory document store engine.
//!
//! Backs the processor in tests and single-host embeddings. Multi-host
//! coordination is only meaningful when every host shares the same
//! collection instance; durable multi-host operation requires a real
//! [`Collection`] implementation.

use crate::err::{Error, GoneKind};
use crate::feed::{FeedPage, FeedResponse, FeedStart};
use crate::store::{item_etag, Collection, PartitionRange, RANGE_MAX, RANGE_MIN};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tokio::sync::RwLock;

const TARGET: &str = "weir::core::store::mem";

/// A stored document together with its expiry deadline
struct MemDoc {
	/// The stored value, including the system fields
	value: Value,
	/// When this document vanishes, if a TTL was attached
	expires_at: Option<Instant>,
}

/// One change feed entry appended to a partition range
struct FeedEntry {
	/// The sequence number assigned at commit
	lsn: u64,
	/// Seconds since the Unix epoch at commit
	ts: i64,
	/// The committed item, including the injected system fields
	item: Value,
}

/// One partition range together with its append-only change log
struct MemRange {
	/// The range definition
	range: PartitionRange,
	/// Whether this range was replaced by a split
	gone: bool,
	/// The ordered change log of this range
	log: Vec<FeedEntry>,
}

struct Inner {
	/// All stored documents, addressed by identifier
	docs: HashMap<String, MemDoc>,
	/// All partition ranges, including split parents
	ranges: Vec<MemRange>,
	/// The concurrency stamp sequence
	etag_seq: u64,
	/// The commit sequence shared by all ranges
	lsn_seq: u64,
	/// The next generated range identifier
	range_seq: u64,
	/// Ranges whose next read fails with a stale name cache
	stale: HashSet<String>,
}

/// An in-memory [`Collection`] with explicit split and fault hooks.
pub struct MemCollection {
	/// The name of this collection
	name: String,
	/// The guarded engine state
	inner: RwLock<Inner>,
}

impl MemCollection {
	/// Create a collection covering the key space with a single range
	pub fn new(name: impl Into<String>) -> Self {
		Self::with_ranges(name, 1)
	}
	/// Create a collection with the key space tiled into `count` ranges
	pub fn with_ranges(name: impl Into<String>, count: u64) -> Self {
		let count = count.max(1);
		let bound = |i: u64| -> String {
			if i == 0 {
				RANGE_MIN.to_string()
			} else if i == count {
				RANGE_MAX.to_string()
			} else {
				format!("{:02X}", (i * 256 / count) as u8)
			}
		};
		let ranges = (0..count)
			.map(|i| MemRange {
				range: PartitionRange::new(i.to_string(), bound(i), bound(i + 1)),
				gone: false,
				log: Vec::new(),
			})
			.collect();
		Self {
			name: name.into(),
			inner: RwLock::new(Inner {
				docs: HashMap::new(),
				ranges,
				etag_seq: 0,
				lsn_seq: 0,
				range_seq: count,
				stale: HashSet::new(),
			}),
		}
	}
	/// Append an item to a partition range's change feed.
	/// The engine injects the `_lsn` and `_ts` system fields at commit.
	pub async fn append(&self, range: &str, mut item: Value) -> Result<u64, Error> {
		let mut inner = self.inner.write().await;
		if !item.is_object() {
			return Err(Error::Store {
				message: "change feed items must be objects".to_string(),
			});
		}
		inner.lsn_seq += 1;
		let lsn = inner.lsn_seq;
		let ts = Utc::now().timestamp();
		let entry = inner.range_mut(range)?;
		if entry.gone {
			return Err(Error::Gone {
				kind: GoneKind::RangeGone,
			});
		}
		if let Some(obj) = item.as_object_mut() {
			obj.insert("_lsn".to_string(), Value::from(lsn));
			obj.insert("_ts".to_string(), Value::from(ts));
		}
		entry.log.push(FeedEntry {
			lsn,
			ts,
			item,
		});
		Ok(lsn)
	}
	/// Split a partition range into two children tiling its interval.
	/// Returns the identifiers of the children.
	pub async fn split_range(&self, range: &str) -> Result<(String, String), Error> {
		let mut inner = self.inner.write().await;
		let (min, max) = {
			let entry = inner.range_mut(range)?;
			if entry.gone {
				return Err(Error::Gone {
					kind: GoneKind::RangeGone,
				});
			}
			entry.gone = true;
			(entry.range.min.clone(), entry.range.max.clone())
		};
		let mid = midpoint(&min, &max)?;
		let left = inner.range_seq.to_string();
		let right = (inner.range_seq + 1).to_string();
		inner.range_seq += 2;
		inner.ranges.push(MemRange {
			range: PartitionRange::new(left.clone(), min, mid.clone()),
			gone: false,
			log: Vec::new(),
		});
		inner.ranges.push(MemRange {
			range: PartitionRange::new(right.clone(), mid, max),
			gone: false,
			log: Vec::new(),
		});
		debug!(target: TARGET, parent = %range, left = %left, right = %right, "Split partition range");
		Ok((left, right))
	}
	/// Make the next feed read of a range fail with a stale name cache
	pub async fn fail_next_with_stale_cache(&self, range: &str) {
		self.inner.write().await.stale.insert(range.to_string());
	}
}

impl Inner {
	/// Look up a range by identifier
	fn range_mut(&mut self, id: &str) -> Result<&mut MemRange, Error> {
		self.ranges.iter_mut().find(|r| r.range.id == id).ok_or_else(|| Error::Store {
			message: format!("unknown partition range '{id}'"),
		})
	}
	/// Drop documents whose TTL has elapsed
	fn purge_expired(&mut self) {
		let now = Instant::now();
		self.docs.retain(|_, doc| doc.expires_at.map_or(true, |at| at > now));
	}
	/// Stamp a value with fresh system fields and return it
	fn stamp(&mut self, id: &str, mut value: Value) -> Value {
		self.etag_seq += 1;
		if let Some(obj) = value.as_object_mut() {
			obj.insert("id".to_string(), Value::from(id));
			obj.insert("_etag".to_string(), Value::from(self.etag_seq.to_string()));
			obj.insert("_ts".to_string(), Value::from(Utc::now().timestamp()));
		}
		value
	}
}

/// A midpoint strictly inside `(min, max)` in lexicographic order
fn midpoint(min: &str, max: &str) -> Result<String, Error> {
	for suffix in ["80", "40", "20", "10", "08", "04", "02", "01"] {
		let candidate = format!("{min}{suffix}");
		if candidate.as_str() < max {
			return Ok(candidate);
		}
	}
	Err(Error::Store {
		message: format!("partition range ({min}, {max}) is too narrow to split"),
	})
}

#[async_trait]
impl Collection for MemCollection {
	fn name(&self) -> &str {
		&self.name
	}

	#[instrument(level = "trace", target = "weir::core::store::mem", skip(self, item))]
	async fn create_item(&self, item: Value, ttl: Option<u64>) -> Result<Value, Error> {
		let mut inner = self.inner.write().await;
		inner.purge_expired();
		let id = match super::item_id(&item) {
			Some(id) => id.to_string(),
			None => {
				return Err(Error::Store {
					message: "item is missing an 'id' field".to_string(),
				})
			}
		};
		if inner.docs.contains_key(&id) {
			return Err(Error::AlreadyExists {
				id,
			});
		}
		let value = inner.stamp(&id, item);
		let expires_at = ttl.map(|secs| Instant::now() + std::time::Duration::from_secs(secs));
		inner.docs.insert(
			id,
			MemDoc {
				value: value.clone(),
				expires_at,
			},
		);
		Ok(value)
	}

	async fn read_item(&self, id: &str) -> Result<Option<Value>, Error> {
		let mut inner = self.inner.write().await;
		inner.purge_expired();
		Ok(inner.docs.get(id).map(|doc| doc.value.clone()))
	}

	#[instrument(level = "trace", target = "weir::core::store::mem", skip(self, item))]
	async fn replace_item(
		&self,
		id: &str,
		item: Value,
		if_match: Option<&str>,
	) -> Result<Value, Error> {
		let mut inner = self.inner.write().await;
		inner.purge_expired();
		let current_etag = match inner.docs.get(id) {
			Some(doc) => item_etag(&doc.value).map(str::to_string),
			None => {
				return Err(Error::ItemNotFound {
					id: id.to_string(),
				})
			}
		};
		// Enforce the concurrency stamp when the caller supplied one
		if let Some(expected) = if_match {
			if current_etag.as_deref() != Some(expected) {
				return Err(Error::Conflict {
					id: id.to_string(),
				});
			}
		}
		let value = inner.stamp(id, item);
		if let Some(doc) = inner.docs.get_mut(id) {
			doc.value = value.clone();
		}
		Ok(value)
	}

	async fn delete_item(&self, id: &str, if_match: Option<&str>) -> Result<bool, Error> {
		let mut inner = self.inner.write().await;
		inner.purge_expired();
		let Some(doc) = inner.docs.get(id) else {
			return Ok(false);
		};
		if let Some(expected) = if_match {
			if item_etag(&doc.value) != Some(expected) {
				return Err(Error::Conflict {
					id: id.to_string(),
				});
			}
		}
		inner.docs.remove(id);
		Ok(true)
	}

	async fn list_items(&self, id_prefix: &str) -> Result<Vec<Value>, Error> {
		let mut inner = self.inner.write().await;
		inner.purge_expired();
		let mut items: Vec<Value> = inner
			.docs
			.iter()
			.filter(|(id, _)| id.starts_with(id_prefix))
			.map(|(_, doc)| doc.value.clone())
			.collect();
		items.sort_by(|a, b| super::item_id(a).cmp(&super::item_id(b)));
		Ok(items)
	}

	async fn partition_ranges(&self, _refresh: bool) -> Result<Vec<PartitionRange>, Error> {
		let inner = self.inner.read().await;
		Ok(inner.ranges.iter().filter(|r| !r.gone).map(|r| r.range.clone()).collect())
	}

	#[instrument(level = "trace", target = "weir::core::store::mem", skip(self, start))]
	async fn read_feed(
		&self,
		range: &str,
		start: &FeedStart,
		max_items: u32,
	) -> Result<FeedResponse, Error> {
		let mut inner = self.inner.write().await;
		// Consume an injected stale-cache fault first
		if inner.stale.remove(range) {
			return Err(Error::Gone {
				kind: GoneKind::NameCacheStale,
			});
		}
		let entry = inner.ranges.iter().find(|r| r.range.id == range).ok_or_else(|| {
			Error::Store {
				message: format!("unknown partition range '{range}'"),
			}
		})?;
		if entry.gone {
			return Err(Error::Gone {
				kind: GoneKind::RangeGone,
			});
		}
		// Resolve the starting position to a consumed-through sequence number
		let bound = match start {
			FeedStart::Beginning => 0,
			FeedStart::Continuation(c) | FeedStart::ContinuationAndRange(c, _) => {
				c.parse::<u64>().map_err(|_| Error::InvalidContinuation {
					value: c.clone(),
				})?
			}
			FeedStart::Time(t) => {
				let at = t.timestamp();
				match entry.log.iter().find(|e| e.ts >= at) {
					Some(first) => first.lsn.saturating_sub(1),
					None => entry.log.last().map(|e| e.lsn).unwrap_or(0),
				}
			}
		};
		let session_token = format!("{}:-1#{}", range, entry.log.last().map(|e| e.lsn).unwrap_or(0));
		let items: Vec<Value> = entry
			.log
			.iter()
			.filter(|e| e.lsn > bound)
			.take(max_items as usize)
			.map(|e| e.item.clone())
			.collect();
		match items.last() {
			Some(last) => {
				let etag = last
					.get("_lsn")
					.and_then(Value::as_u64)
					.unwrap_or(bound)
					.to_string();
				Ok(FeedResponse::Page(FeedPage {
					items,
					etag,
					session_token,
				}))
			}
			None => Ok(FeedResponse::NotModified {
				etag: bound.to_string(),
				session_token,
			}),
		}
	}
}
