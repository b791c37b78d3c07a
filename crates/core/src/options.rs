use crate::cnf;
use crate::err::Error;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Configuration for the behaviour of a change feed processor host.
///
/// The defaults are sensible for most deployments, so please only modify
/// these if you know deliberately why you are modifying them.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ProcessorOptions {
	/// The namespace prefix for lease, marker and lock item identifiers
	pub lease_prefix: String,
	/// How often the load balancer looks for leases to acquire
	pub acquire_interval: Duration,
	/// The age above which a lease is considered abandoned by its owner
	pub expiration_interval: Duration,
	/// How often an owned lease is renewed
	pub renew_interval: Duration,
	/// How long a partition processor sleeps after an empty feed read
	pub poll_interval: Duration,
	/// The page size hint for change feed reads
	pub max_items: u32,
	/// Whether to start reading from the beginning of the change feed
	pub start_from_beginning: bool,
	/// The point in time to start reading the change feed from
	pub start_time: Option<DateTime<Utc>>,
	/// The continuation to start reading the change feed from
	pub start_continuation: Option<String>,
	/// Checkpoint automatically after this many processed documents
	pub checkpoint_after_n_docs: Option<u64>,
	/// Checkpoint automatically after this much wall-clock time
	pub checkpoint_after_interval: Option<Duration>,
	/// How many leases the backlog estimator inspects concurrently
	pub estimator_degree_of_parallelism: usize,
	/// The TTL placed on the bootstrap lock item
	pub init_lock_ttl: Duration,
	/// How long a contending host waits before re-polling the bootstrap marker
	pub init_retry_interval: Duration,
}

impl Default for ProcessorOptions {
	fn default() -> Self {
		Self {
			lease_prefix: cnf::DEFAULT_LEASE_PREFIX.to_string(),
			acquire_interval: Duration::from_secs(*cnf::ACQUIRE_INTERVAL_SECS),
			expiration_interval: Duration::from_secs(*cnf::EXPIRATION_INTERVAL_SECS),
			renew_interval: Duration::from_secs(*cnf::RENEW_INTERVAL_SECS),
			poll_interval: Duration::from_millis(*cnf::POLL_INTERVAL_MILLIS),
			max_items: *cnf::MAX_ITEM_COUNT,
			start_from_beginning: false,
			start_time: None,
			start_continuation: None,
			checkpoint_after_n_docs: None,
			checkpoint_after_interval: None,
			estimator_degree_of_parallelism: *cnf::ESTIMATOR_PARALLELISM,
			init_lock_ttl: Duration::from_secs(*cnf::INIT_LOCK_TTL_SECS),
			init_retry_interval: Duration::from_millis(*cnf::INIT_RETRY_MILLIS),
		}
	}
}

impl ProcessorOptions {
	/// Create a new set of options with the defaults applied
	pub fn new() -> Self {
		Self::default()
	}
	/// Set the namespace prefix for lease, marker and lock item identifiers
	pub fn lease_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.lease_prefix = prefix.into();
		self
	}
	/// Set how often the load balancer looks for leases to acquire
	pub fn acquire_interval(mut self, interval: Duration) -> Self {
		self.acquire_interval = interval;
		self
	}
	/// Set the age above which a lease is considered abandoned
	pub fn expiration_interval(mut self, interval: Duration) -> Self {
		self.expiration_interval = interval;
		self
	}
	/// Set how often an owned lease is renewed
	pub fn renew_interval(mut self, interval: Duration) -> Self {
		self.renew_interval = interval;
		self
	}
	/// Set how long a partition processor sleeps after an empty feed read
	pub fn poll_interval(mut self, interval: Duration) -> Self {
		self.poll_interval = interval;
		self
	}
	/// Set the page size hint for change feed reads
	pub fn max_items(mut self, max_items: u32) -> Self {
		self.max_items = max_items;
		self
	}
	/// Start reading from the beginning of the change feed
	pub fn start_from_beginning(mut self) -> Self {
		self.start_from_beginning = true;
		self
	}
	/// Start reading the change feed from a point in time
	pub fn start_time(mut self, time: DateTime<Utc>) -> Self {
		self.start_time = Some(time);
		self
	}
	/// Start reading the change feed from a continuation
	pub fn start_continuation(mut self, continuation: impl Into<String>) -> Self {
		self.start_continuation = Some(continuation.into());
		self
	}
	/// Checkpoint automatically after this many processed documents
	pub fn checkpoint_after_n_docs(mut self, docs: u64) -> Self {
		self.checkpoint_after_n_docs = Some(docs);
		self
	}
	/// Checkpoint automatically after this much wall-clock time
	pub fn checkpoint_after_interval(mut self, interval: Duration) -> Self {
		self.checkpoint_after_interval = Some(interval);
		self
	}
	/// Set how many leases the backlog estimator inspects concurrently
	pub fn estimator_degree_of_parallelism(mut self, degree: usize) -> Self {
		self.estimator_degree_of_parallelism = degree;
		self
	}
	/// Set the TTL placed on the bootstrap lock item
	pub fn init_lock_ttl(mut self, ttl: Duration) -> Self {
		self.init_lock_ttl = ttl;
		self
	}
	/// Set how long a contending host waits before re-polling the marker
	pub fn init_retry_interval(mut self, interval: Duration) -> Self {
		self.init_retry_interval = interval;
		self
	}
	/// Check that the configured values are consistent with each other
	pub fn validate(&self) -> Result<(), Error> {
		if self.expiration_interval <= self.renew_interval * 2 {
			return Err(Error::InvalidOptions {
				message: format!(
					"expiration_interval ({:?}) must be greater than twice renew_interval ({:?})",
					self.expiration_interval, self.renew_interval
				),
			});
		}
		if self.estimator_degree_of_parallelism == 0 {
			return Err(Error::InvalidOptions {
				message: "estimator_degree_of_parallelism must be at least 1".to_string(),
			});
		}
		if self.max_items == 0 {
			return Err(Error::InvalidOptions {
				message: "max_items must be at least 1".to_string(),
			});
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_valid() {
		ProcessorOptions::default().validate().unwrap();
	}

	#[test]
	fn expiration_must_exceed_twice_renewal() {
		let opts = ProcessorOptions::new()
			.renew_interval(Duration::from_secs(30))
			.expiration_interval(Duration::from_secs(60));
		assert!(matches!(
			opts.validate(),
			Err(Error::InvalidOptions {
				..
			})
		));
	}

	#[test]
	fn estimator_degree_must_be_positive() {
		let opts = ProcessorOptions::new().estimator_degree_of_parallelism(0);
		assert!(opts.validate().is_err());
	}
}
