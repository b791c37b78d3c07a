//! The worker pool machinery: observers, checkpointing, per-partition
//! processing, supervision, the owned-lease controller, load balancing,
//! bootstrap and the top-level manager.

pub mod balancer;
pub mod bootstrap;
pub mod checkpoint;
pub mod controller;
pub mod manager;
pub mod monitor;
pub mod partition;
pub mod supervisor;

pub use self::balancer::{EqualDistributionStrategy, LoadBalancer, LoadBalancingStrategy};
pub use self::bootstrap::Bootstrapper;
pub use self::checkpoint::Checkpointer;
pub use self::controller::{LeaseController, PartitionController};
pub use self::monitor::{
	HealthMonitor, HealthMonitoringController, HealthOperation, HealthRecord, HealthSeverity,
	TracingHealthMonitor,
};
pub use self::partition::PartitionProcessor;
pub use self::supervisor::PartitionSupervisor;

use crate::err::Error;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// The boxed error type user observers may fail with
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Why a partition's observer was closed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CloseReason {
	/// The host is shutting down
	Shutdown,
	/// The lease was taken by another instance
	LeaseLost,
	/// The partition range was split and its lease replaced
	LeaseGone,
	/// The resource backing the change feed no longer exists
	ResourceGone,
	/// The read session for the change feed is not available
	ReadSessionNotAvailable,
	/// The observer itself failed while processing
	ObserverError,
	/// The processor failed for a reason not covered above
	Unknown,
}

impl fmt::Display for CloseReason {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			CloseReason::Shutdown => write!(f, "shutdown"),
			CloseReason::LeaseLost => write!(f, "lease lost"),
			CloseReason::LeaseGone => write!(f, "lease gone"),
			CloseReason::ResourceGone => write!(f, "resource gone"),
			CloseReason::ReadSessionNotAvailable => write!(f, "read session not available"),
			CloseReason::ObserverError => write!(f, "observer error"),
			CloseReason::Unknown => write!(f, "unknown"),
		}
	}
}

/// The context handed to an observer alongside every call.
///
/// During [`ChangeFeedObserver::process`] the context carries the
/// continuation of the delivered batch and can checkpoint it explicitly.
pub struct ObserverContext {
	/// The partition range whose changes are being observed
	lease_token: String,
	/// The continuation of the batch being delivered, when processing
	continuation: Option<String>,
	/// The checkpointer bound to the owning lease, when processing
	checkpointer: Option<Arc<Checkpointer>>,
}

impl ObserverContext {
	/// Create a context without a batch, used for open and close calls
	pub(crate) fn for_lease(lease_token: impl Into<String>) -> Self {
		Self {
			lease_token: lease_token.into(),
			continuation: None,
			checkpointer: None,
		}
	}
	/// Create a context carrying one delivered batch
	pub(crate) fn for_batch(
		lease_token: impl Into<String>,
		continuation: impl Into<String>,
		checkpointer: Arc<Checkpointer>,
	) -> Self {
		Self {
			lease_token: lease_token.into(),
			continuation: Some(continuation.into()),
			checkpointer: Some(checkpointer),
		}
	}
	/// The partition range whose changes are being observed
	pub fn lease_token(&self) -> &str {
		&self.lease_token
	}
	/// The continuation of the batch being delivered, if any
	pub fn continuation(&self) -> Option<&str> {
		self.continuation.as_deref()
	}
	/// Persist the delivered batch's continuation into the owning lease.
	/// Only meaningful from within [`ChangeFeedObserver::process`].
	pub async fn checkpoint(&self) -> Result<(), Error> {
		match (&self.checkpointer, &self.continuation) {
			(Some(checkpointer), Some(continuation)) => {
				checkpointer.checkpoint(continuation).await?;
				Ok(())
			}
			_ => Err(Error::Store {
				message: "checkpointing is only available while processing a batch".to_string(),
			}),
		}
	}
}

/// User-supplied logic receiving batches of changes for one partition
/// range at a time, in the store's commit order for that range.
///
/// Delivery is at-least-once: a batch may be replayed on another host
/// after a rebalance, so implementations must be idempotent.
#[async_trait]
pub trait ChangeFeedObserver: Send + Sync + 'static {
	/// Called once before the first batch for a partition is delivered
	async fn open(&self, ctx: &ObserverContext) -> Result<(), ObserverError> {
		let _ = ctx;
		Ok(())
	}
	/// Called once per page of changes
	async fn process(&self, ctx: &ObserverContext, changes: Vec<Value>) -> Result<(), ObserverError>;
	/// Called once when processing for a partition ends
	async fn close(&self, ctx: &ObserverContext, reason: CloseReason) -> Result<(), ObserverError> {
		let _ = (ctx, reason);
		Ok(())
	}
}

/// Creates one observer per supervised partition.
pub trait ObserverFactory: Send + Sync + 'static {
	/// Create an observer for a newly acquired partition
	fn create_observer(&self) -> Arc<dyn ChangeFeedObserver>;
}

impl<F> ObserverFactory for F
where
	F: Fn() -> Arc<dyn ChangeFeedObserver> + Send + Sync + 'static,
{
	fn create_observer(&self) -> Arc<dyn ChangeFeedObserver> {
		self()
	}
}
