use crate::err::Error;
use crate::store::PartitionRange;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// The continuation state of one partition range inside a composite token.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RangeContinuation {
	/// The inclusive lower bound of the range
	pub min: String,
	/// The exclusive upper bound of the range
	pub max: String,
	/// The continuation for this range, absent before the first read
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub token: Option<String>,
}

impl RangeContinuation {
	/// Create a continuation entry for a range with an optional token
	pub fn new(range: &PartitionRange, token: Option<String>) -> Self {
		Self {
			min: range.min.clone(),
			max: range.max.clone(),
			token,
		}
	}
}

/// An ordered FIFO of per-range continuations.
///
/// The head of the queue is the range currently being read. Rotating moves
/// the head to the tail, giving round-robin traversal across all ranges.
/// The serialized form is a JSON array of entries in FIFO order; the flat
/// single-entry object form is also accepted on ingest.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompositeContinuation {
	ranges: VecDeque<RangeContinuation>,
}

impl CompositeContinuation {
	/// Build a composite over a set of ranges, all starting from the same
	/// token. A freshly enumerated topology yields entries sorted by min.
	pub fn from_ranges(ranges: &[PartitionRange], token: Option<&str>) -> Self {
		let mut entries: Vec<RangeContinuation> =
			ranges.iter().map(|r| RangeContinuation::new(r, token.map(str::to_string))).collect();
		entries.sort_by(|a, b| a.min.cmp(&b.min));
		Self {
			ranges: entries.into(),
		}
	}
	/// Parse a composite continuation from its serialized form
	pub fn parse(input: &str) -> Result<Self, Error> {
		// Accept the canonical array form first
		if let Ok(entries) = serde_json::from_str::<Vec<RangeContinuation>>(input) {
			if entries.is_empty() {
				return Err(Error::InvalidContinuation {
					value: input.to_string(),
				});
			}
			return Ok(Self {
				ranges: entries.into(),
			});
		}
		// Fall back to the flat single-entry object form
		match serde_json::from_str::<RangeContinuation>(input) {
			Ok(entry) => Ok(Self {
				ranges: VecDeque::from([entry]),
			}),
			Err(_) => Err(Error::InvalidContinuation {
				value: input.to_string(),
			}),
		}
	}
	/// Serialize this composite in FIFO order
	pub fn serialize(&self) -> Result<String, Error> {
		let entries: Vec<&RangeContinuation> = self.ranges.iter().collect();
		Ok(serde_json::to_string(&entries)?)
	}
	/// The entry currently at the head of the queue
	pub fn current(&self) -> Option<&RangeContinuation> {
		self.ranges.front()
	}
	/// Rotate the head entry to the tail
	pub fn move_next(&mut self) {
		if let Some(entry) = self.ranges.pop_front() {
			self.ranges.push_back(entry);
		}
	}
	/// Replace the token of the head entry
	pub fn update_current_token(&mut self, token: impl Into<String>) {
		if let Some(entry) = self.ranges.front_mut() {
			entry.token = Some(token.into());
		}
	}
	/// Replace the head entry with the child ranges produced by a split.
	/// Each child inherits the parent's token, and the first child becomes
	/// the new head.
	pub fn replace_current(&mut self, children: &[PartitionRange]) {
		if let Some(parent) = self.ranges.pop_front() {
			let mut sorted: Vec<&PartitionRange> = children.iter().collect();
			sorted.sort_by(|a, b| a.min.cmp(&b.min));
			for child in sorted.into_iter().rev() {
				self.ranges.push_front(RangeContinuation::new(child, parent.token.clone()));
			}
		}
	}
	/// The number of entries in this composite
	pub fn len(&self) -> usize {
		self.ranges.len()
	}
	/// Check whether this composite holds no entries
	pub fn is_empty(&self) -> bool {
		self.ranges.is_empty()
	}
}
