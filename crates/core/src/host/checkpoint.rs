use crate::err::Error;
use crate::lease::{Lease, LeaseManager};
use crate::options::ProcessorOptions;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

const TARGET: &str = "weir::core::host::checkpoint";

/// When progress is persisted automatically after a processed batch.
#[derive(Clone, Copy, Debug)]
enum Policy {
	/// Persist after every batch
	EveryBatch,
	/// Persist once enough documents or enough time has accumulated
	Threshold {
		docs: Option<u64>,
		interval: Option<Duration>,
	},
}

/// Tracks progress accumulated since the last persisted checkpoint
struct Progress {
	/// Documents processed since the last checkpoint
	docs: u64,
	/// When the last checkpoint was persisted
	at: Instant,
}

/// Persists observer progress back into the owning lease.
///
/// Checkpoints for one lease are serialized with respect to each other,
/// and the refreshed lease record is written back into the shared slot so
/// later writes carry the current concurrency stamp.
pub struct Checkpointer {
	/// The manager performing the conditional writes
	manager: Arc<dyn LeaseManager>,
	/// The shared slot holding the owned lease
	lease: Arc<RwLock<Lease>>,
	/// The auto-checkpoint policy
	policy: Policy,
	/// Progress since the last checkpoint, guarded to serialize writers
	progress: Mutex<Progress>,
}

impl Checkpointer {
	/// Create a checkpointer for one owned lease
	pub fn new(
		manager: Arc<dyn LeaseManager>,
		lease: Arc<RwLock<Lease>>,
		options: &ProcessorOptions,
	) -> Self {
		let policy = match (options.checkpoint_after_n_docs, options.checkpoint_after_interval) {
			(None, None) => Policy::EveryBatch,
			(docs, interval) => Policy::Threshold {
				docs,
				interval,
			},
		};
		Self {
			manager,
			lease,
			policy,
			progress: Mutex::new(Progress {
				docs: 0,
				at: Instant::now(),
			}),
		}
	}
	/// Persist a continuation into the owning lease
	#[instrument(level = "trace", target = "weir::core::host::checkpoint", skip(self))]
	pub async fn checkpoint(&self, continuation: &str) -> Result<Lease, Error> {
		let mut progress = self.progress.lock().await;
		let current = self.lease.read().await.clone();
		let updated = self.manager.checkpoint(&current, continuation).await?;
		trace!(target: TARGET, token = %updated.token, continuation = %continuation, "Checkpointed");
		*self.lease.write().await = updated.clone();
		progress.docs = 0;
		progress.at = Instant::now();
		Ok(updated)
	}
	/// Record a processed batch and checkpoint it when the policy says so
	pub async fn batch_processed(&self, docs: u64, continuation: &str) -> Result<(), Error> {
		let due = {
			let mut progress = self.progress.lock().await;
			progress.docs += docs;
			match self.policy {
				Policy::EveryBatch => true,
				Policy::Threshold {
					docs: threshold,
					interval,
				} => {
					threshold.is_some_and(|n| progress.docs >= n)
						|| interval.is_some_and(|i| progress.at.elapsed() >= i)
				}
			}
		};
		if due {
			self.checkpoint(continuation).await?;
		}
		Ok(())
	}
}
