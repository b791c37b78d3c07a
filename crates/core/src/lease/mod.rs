//! Leases grant one host instance the exclusive right to read a partition
//! range's change feed for a bounded time.

pub mod manager;
pub mod renewer;
pub mod store;

pub use self::manager::{DocumentLeaseManager, LeaseManager};
pub use self::renewer::LeaseRenewer;
pub use self::store::LeaseStore;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A persisted record granting one host the exclusive right to read a
/// partition range's change feed.
///
/// A previous schema persisted the range identifier under `PartitionId`;
/// records written by that version are still accepted on load, but this
/// version always writes `LeaseToken`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Lease {
	/// The persisted identifier of this lease
	pub id: String,
	/// The partition range this lease covers
	#[serde(rename = "LeaseToken", alias = "PartitionId", default)]
	pub token: String,
	/// The instance currently holding this lease, if any
	#[serde(rename = "Owner", default, skip_serializing_if = "Option::is_none")]
	pub owner: Option<String>,
	/// The most recent accepted change feed continuation
	#[serde(rename = "ContinuationToken", default, skip_serializing_if = "Option::is_none")]
	pub continuation: Option<String>,
	/// The renewal clock, written explicitly on every ownership operation
	#[serde(rename = "timestamp", default, skip_serializing_if = "Option::is_none")]
	pub explicit_timestamp: Option<DateTime<Utc>>,
	/// Seconds since the Unix epoch at the last store write
	#[serde(rename = "_ts", default)]
	pub server_ts: i64,
	/// The store concurrency stamp, refreshed on every write
	#[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
	pub concurrency_token: Option<String>,
	/// User-opaque properties carried end-to-end on this lease
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub properties: HashMap<String, String>,
}

impl Lease {
	/// Create a fresh, unowned lease for a partition range
	pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			token: token.into(),
			owner: None,
			continuation: None,
			explicit_timestamp: None,
			server_ts: 0,
			concurrency_token: None,
			properties: HashMap::new(),
		}
	}
	/// The renewal clock of this lease, preferring the explicit timestamp
	/// over the store-assigned write time
	pub fn timestamp(&self) -> DateTime<Utc> {
		match self.explicit_timestamp {
			Some(ts) => ts,
			None => Utc.timestamp_opt(self.server_ts, 0).single().unwrap_or_else(Utc::now),
		}
	}
	/// Check whether this lease is up for grabs: unowned, or not renewed
	/// within the expiration interval
	pub fn is_expired(&self, expiration: Duration, now: DateTime<Utc>) -> bool {
		match &self.owner {
			None => true,
			Some(owner) if owner.is_empty() => true,
			Some(_) => match chrono::Duration::from_std(expiration) {
				Ok(age) => self.timestamp() + age < now,
				Err(_) => false,
			},
		}
	}
	/// Check whether this lease is held by the given instance
	pub fn is_owned_by(&self, instance: &str) -> bool {
		self.owner.as_deref() == Some(instance)
	}
}
