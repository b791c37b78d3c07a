use std::time::Duration;
use thiserror::Error;

/// The reason a change feed read returned `410 Gone` from the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum GoneKind {
	/// The partition range was split and no longer exists
	RangeGone,
	/// The partition range is in the process of completing a split
	CompletingSplit,
	/// The client's name-to-range cache is stale and must be refreshed
	NameCacheStale,
}

/// An error originating from the change feed processor
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
	/// The lease for a partition range was taken by another instance
	#[error("The lease for partition range '{token}' was lost to another owner")]
	LeaseLost {
		token: String,
	},

	/// The partition range was split while its change feed was being read.
	/// Carries the last continuation accepted before the split was observed,
	/// when the caller knows it.
	#[error("The partition range was split while reading the change feed")]
	FeedSplit {
		continuation: Option<String>,
	},

	/// The monitored resource backing the change feed no longer exists
	#[error("The resource backing the change feed was not found")]
	FeedNotFound,

	/// The session used for reading the change feed is not available
	#[error("The read session for the change feed is not available")]
	FeedReadSessionNotAvailable,

	/// The user observer failed while processing a batch of changes
	#[error("The change feed observer failed: {source}")]
	Observer {
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},

	/// The name-to-range cache was stale and remained stale after a refresh
	#[error("The partition range cache is stale")]
	NameCacheStale,

	/// The store throttled the request
	#[error("The request was throttled by the store, retry after {retry_after:?}")]
	Throttled {
		retry_after: Duration,
	},

	/// The operation was cancelled cooperatively
	#[error("The operation was cancelled")]
	Cancelled,

	/// The store returned `410 Gone` for a partition range
	#[error("The partition range is gone: {kind:?}")]
	Gone {
		kind: GoneKind,
	},

	/// An item targeted by a conditional operation does not exist
	#[error("The item '{id}' was not found in the store")]
	ItemNotFound {
		id: String,
	},

	/// An item with this identifier already exists in the store
	#[error("The item '{id}' already exists in the store")]
	AlreadyExists {
		id: String,
	},

	/// A conditional write failed because the concurrency stamp moved
	#[error("The concurrency stamp for item '{id}' did not match")]
	Conflict {
		id: String,
	},

	/// A continuation token could not be understood
	#[error("Invalid continuation token: {value}")]
	InvalidContinuation {
		value: String,
	},

	/// The processor configuration is inconsistent
	#[error("Invalid processor options: {message}")]
	InvalidOptions {
		message: String,
	},

	/// The processor was asked to start while already running
	#[error("The change feed processor is already started")]
	AlreadyStarted,

	/// A store operation failed in a way the processor cannot recover from
	#[error("There was a problem with the underlying store: {message}")]
	Store {
		message: String,
	},

	/// A spawned task failed to run to completion
	#[error("A background task failed: {message}")]
	Task {
		message: String,
	},

	/// Represents an error when encoding or decoding a persisted record
	#[error("Serde error: {0}")]
	Serde(#[from] serde_json::Error),
}

impl Error {
	/// Check whether this error signals a partition split
	pub fn is_split(&self) -> bool {
		matches!(
			self,
			Error::FeedSplit {
				..
			} | Error::Gone {
				kind: GoneKind::RangeGone | GoneKind::CompletingSplit,
			}
		)
	}
}
