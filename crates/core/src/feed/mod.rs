//! Change feed reading for a single partition range, the composite
//! continuation protocol, and the pull-mode stand-by iterator.

pub mod composite;
pub mod position;
pub mod reader;
pub mod standby;

pub use self::composite::{CompositeContinuation, RangeContinuation};
pub use self::position::FeedStart;
pub use self::reader::FeedReader;
pub use self::standby::{StandbyIterator, StandbyResponse};

use serde_json::Value;

/// One page of changes read from a partition range's change feed
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct FeedPage {
	/// The changed items, in the store's commit order
	pub items: Vec<Value>,
	/// The continuation identifying the position after this page
	pub etag: String,
	/// The store session token observed on this response
	pub session_token: String,
}

/// The outcome of a single change feed read
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum FeedResponse {
	/// The feed delivered a page of changes
	Page(FeedPage),
	/// There were no new changes past the requested position
	NotModified {
		/// The continuation identifying the current feed position
		etag: String,
		/// The store session token observed on this response
		session_token: String,
	},
}

impl FeedResponse {
	/// The continuation returned with this response
	pub fn etag(&self) -> &str {
		match self {
			FeedResponse::Page(page) => &page.etag,
			FeedResponse::NotModified {
				etag,
				..
			} => etag,
		}
	}
	/// The store session token observed on this response
	pub fn session_token(&self) -> &str {
		match self {
			FeedResponse::Page(page) => &page.session_token,
			FeedResponse::NotModified {
				session_token,
				..
			} => session_token,
		}
	}
}
