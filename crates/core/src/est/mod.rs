//! Estimates how much change feed backlog is still unprocessed per lease.

use crate::err::Error;
use crate::feed::{FeedResponse, FeedStart};
use crate::lease::{Lease, LeaseStore};
use crate::store::Collection;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;

const TARGET: &str = "weir::core::est";

/// The estimated backlog behind one lease
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct RemainingWork {
	/// The partition range the estimate is for
	pub lease_token: String,
	/// The instance holding the lease, if any
	pub owner: Option<String>,
	/// The estimated number of unprocessed changes, at least zero
	pub remaining: u64,
}

/// Estimates the remaining work across all leases by issuing one-item
/// probe reads and comparing the store's session position against the
/// first unprocessed change.
pub struct RemainingWorkEstimator {
	/// The lease catalog
	store: Arc<LeaseStore>,
	/// The monitored collection whose feed is probed
	monitored: Arc<dyn Collection>,
	/// How many leases are probed concurrently
	degree: usize,
}

impl RemainingWorkEstimator {
	/// Create an estimator over a lease catalog and a monitored collection
	pub fn new(store: Arc<LeaseStore>, monitored: Arc<dyn Collection>, degree: usize) -> Self {
		Self {
			store,
			monitored,
			degree: degree.max(1),
		}
	}
	/// The total estimated backlog across all leases.
	///
	/// Returns at least `1` when the backlog could not be shown to be
	/// empty, including when no leases exist yet.
	#[instrument(level = "debug", target = "weir::core::est", skip(self))]
	pub async fn estimate(&self) -> Result<u64, Error> {
		let details = self.estimate_detail().await?;
		if details.is_empty() {
			return Ok(1);
		}
		Ok(details.iter().map(|d| d.remaining).sum())
	}
	/// The estimated backlog behind every lease.
	///
	/// Leases are probed with a bounded fan-out. A failing probe is logged
	/// and skipped so a single bad lease cannot poison the aggregate.
	pub async fn estimate_detail(&self) -> Result<Vec<RemainingWork>, Error> {
		let leases = self.store.get_all_leases().await?;
		let estimates = stream::iter(leases)
			.map(|lease| async move {
				let token = lease.token.clone();
				match self.estimate_lease(lease).await {
					Ok(work) => Some(work),
					Err(error) => {
						warn!(target: TARGET, token = %token, error = %error, "Failed to estimate lease backlog");
						None
					}
				}
			})
			.buffer_unordered(self.degree)
			.collect::<Vec<Option<RemainingWork>>>()
			.await;
		let mut details: Vec<RemainingWork> = estimates.into_iter().flatten().collect();
		details.sort_by(|a, b| a.lease_token.cmp(&b.lease_token));
		Ok(details)
	}
	/// Probe one lease's range with a single-item read
	async fn estimate_lease(&self, lease: Lease) -> Result<RemainingWork, Error> {
		let start = match &lease.continuation {
			Some(c) if !c.is_empty() => FeedStart::Continuation(c.clone()),
			_ => FeedStart::Beginning,
		};
		let response = self.monitored.read_feed(&lease.token, &start, 1).await?;
		let session_lsn = parse_session_lsn(response.session_token());
		let remaining = match &response {
			FeedResponse::Page(page) => {
				match (session_lsn, page.items.first().and_then(item_lsn)) {
					(Some(session), Some(first)) => {
						// The probe saw the first unprocessed change
						session.saturating_sub(first.saturating_sub(1)).max(0) as u64
					}
					// The feed has items but no position could be computed
					_ => 1,
				}
			}
			FeedResponse::NotModified {
				..
			} => match session_lsn {
				// Everything up to the session position was consumed
				Some(_) => 0,
				None => 1,
			},
		};
		Ok(RemainingWork {
			lease_token: lease.token,
			owner: lease.owner,
			remaining,
		})
	}
}

/// The sequence number assigned to an item at commit
fn item_lsn(item: &Value) -> Option<i64> {
	item.get("_lsn").and_then(Value::as_i64)
}

/// Parse the global sequence number out of a store session token.
///
/// The sequence is the numeric segment after the first `:`, and when that
/// segment is `#`-separated, the part after the `#`. A malformed number
/// yields zero with a warning rather than an error.
fn parse_session_lsn(token: &str) -> Option<i64> {
	if token.is_empty() {
		return None;
	}
	let (_, rest) = token.split_once(':')?;
	let number = match rest.split_once('#') {
		Some((_, global)) => global,
		None => rest,
	};
	match number.parse::<i64>() {
		Ok(lsn) => Some(lsn),
		Err(_) => {
			warn!(target: TARGET, token = %token, "Failed to parse a session token sequence number");
			Some(0)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::mem::MemCollection;
	use serde_json::json;
	use std::collections::HashMap;

	#[test]
	fn session_tokens_are_parsed() {
		assert_eq!(parse_session_lsn("0:-1#42"), Some(42));
		assert_eq!(parse_session_lsn("0:12"), Some(12));
		assert_eq!(parse_session_lsn("0:junk"), Some(0));
		assert_eq!(parse_session_lsn("no-colon"), None);
		assert_eq!(parse_session_lsn(""), None);
	}

	async fn estimator(
		monitored: Arc<MemCollection>,
	) -> (RemainingWorkEstimator, Arc<LeaseStore>) {
		let store = Arc::new(LeaseStore::new(Arc::new(MemCollection::new("leases")), "weir"));
		(RemainingWorkEstimator::new(store.clone(), monitored, 4), store)
	}

	#[tokio::test]
	async fn no_leases_is_a_nonzero_estimate() {
		let monitored = Arc::new(MemCollection::new("monitored"));
		let (estimator, _) = estimator(monitored).await;
		assert_eq!(estimator.estimate().await.unwrap(), 1);
	}

	#[tokio::test]
	async fn backlog_is_session_position_minus_progress() {
		let monitored = Arc::new(MemCollection::new("monitored"));
		// Commit 42 changes, of which the first 9 were already processed
		for i in 0..42 {
			monitored.append("0", json!({"id": format!("d{i}")})).await.unwrap();
		}
		let (estimator, store) = estimator(monitored).await;
		store
			.create_lease_if_not_exists("0", Some("9".to_string()), HashMap::new())
			.await
			.unwrap();
		// The probe sees item 10 first: 42 - (10 - 1) = 33
		assert_eq!(estimator.estimate().await.unwrap(), 33);
	}

	#[tokio::test]
	async fn a_drained_feed_estimates_zero() {
		let monitored = Arc::new(MemCollection::new("monitored"));
		for i in 0..5 {
			monitored.append("0", json!({"id": format!("d{i}")})).await.unwrap();
		}
		let (estimator, store) = estimator(monitored).await;
		store
			.create_lease_if_not_exists("0", Some("5".to_string()), HashMap::new())
			.await
			.unwrap();
		assert_eq!(estimator.estimate().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn a_poisoned_lease_does_not_break_the_aggregate() {
		let monitored = Arc::new(MemCollection::with_ranges("monitored", 2));
		monitored.append("0", json!({"id": "d"})).await.unwrap();
		let (estimator, store) = estimator(monitored).await;
		store.create_lease_if_not_exists("0", None, HashMap::new()).await.unwrap();
		// This lease points at a range the store does not know
		store.create_lease_if_not_exists("missing", None, HashMap::new()).await.unwrap();
		let details = estimator.estimate_detail().await.unwrap();
		assert_eq!(details.len(), 1);
		assert_eq!(details[0].lease_token, "0");
		assert_eq!(details[0].remaining, 1);
	}
}
