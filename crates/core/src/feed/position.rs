use crate::options::ProcessorOptions;
use crate::store::PartitionRange;
use chrono::{DateTime, Utc};

/// Where to start reading a partition range's change feed.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum FeedStart {
	/// Read from the very beginning of the retained feed
	Beginning,
	/// Read changes committed at or after this point in time
	Time(DateTime<Utc>),
	/// Resume from a previously returned continuation
	Continuation(String),
	/// Resume from a continuation scoped to an explicit range, used when
	/// the range identity travels with the token rather than the request
	ContinuationAndRange(String, PartitionRange),
}

impl FeedStart {
	/// Resolve the starting position for a partition processor.
	///
	/// A continuation recorded on the lease always wins. Otherwise the
	/// configured start continuation, then the configured start time, then
	/// the beginning of the feed, in that order of precedence. With nothing
	/// configured at all, reading starts at the present moment.
	pub fn resolve(options: &ProcessorOptions, lease_continuation: Option<&str>) -> FeedStart {
		if let Some(continuation) = lease_continuation {
			if !continuation.is_empty() {
				return FeedStart::Continuation(continuation.to_string());
			}
		}
		if let Some(continuation) = &options.start_continuation {
			return FeedStart::Continuation(continuation.clone());
		}
		if let Some(time) = options.start_time {
			return FeedStart::Time(time);
		}
		if options.start_from_beginning {
			return FeedStart::Beginning;
		}
		FeedStart::Time(Utc::now())
	}
	/// The continuation carried by this position, if any
	pub fn continuation(&self) -> Option<&str> {
		match self {
			FeedStart::Continuation(c) => Some(c),
			FeedStart::ContinuationAndRange(c, _) => Some(c),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lease_continuation_wins() {
		let options = ProcessorOptions::new()
			.start_continuation("opt")
			.start_time(Utc::now())
			.start_from_beginning();
		let start = FeedStart::resolve(&options, Some("lease"));
		assert_eq!(start, FeedStart::Continuation("lease".to_string()));
	}

	#[test]
	fn options_continuation_beats_time() {
		let options = ProcessorOptions::new().start_continuation("opt").start_time(Utc::now());
		let start = FeedStart::resolve(&options, None);
		assert_eq!(start, FeedStart::Continuation("opt".to_string()));
	}

	#[test]
	fn time_beats_beginning() {
		let time = Utc::now();
		let options = ProcessorOptions::new().start_time(time).start_from_beginning();
		assert_eq!(FeedStart::resolve(&options, None), FeedStart::Time(time));
	}

	#[test]
	fn empty_lease_continuation_is_ignored() {
		let options = ProcessorOptions::new().start_from_beginning();
		assert_eq!(FeedStart::resolve(&options, Some("")), FeedStart::Beginning);
	}

	#[test]
	fn an_unconfigured_start_reads_from_now() {
		let options = ProcessorOptions::new();
		assert!(matches!(FeedStart::resolve(&options, None), FeedStart::Time(_)));
	}

	#[test]
	fn the_carried_continuation_is_exposed() {
		let range = PartitionRange::new("0", "", "FF");
		let scoped = FeedStart::ContinuationAndRange("42".to_string(), range);
		assert_eq!(scoped.continuation(), Some("42"));
		assert_eq!(FeedStart::Beginning.continuation(), None);
	}
}
