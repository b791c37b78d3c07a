use crate::err::Error;
use crate::host::{ChangeFeedObserver, CloseReason, ObserverContext, PartitionProcessor};
use crate::lease::LeaseRenewer;
use std::sync::Arc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

const TARGET: &str = "weir::core::host::supervisor";

/// Runs the partition processor and the lease renewer for one owned lease
/// as two linked tasks: whichever finishes first, for whatever reason,
/// immediately cancels the other.
///
/// The supervisor opens the observer before processing starts and always
/// closes it on exit with a reason derived from the observed fault.
pub struct PartitionSupervisor {
	/// The partition range this supervisor owns
	token: String,
	/// The observer receiving this partition's changes
	observer: Arc<dyn ChangeFeedObserver>,
	/// The processing loop
	processor: Arc<PartitionProcessor>,
	/// The renewal loop
	renewer: Arc<LeaseRenewer>,
}

impl PartitionSupervisor {
	/// Create a supervisor for one owned partition range
	pub fn new(
		token: impl Into<String>,
		observer: Arc<dyn ChangeFeedObserver>,
		processor: Arc<PartitionProcessor>,
		renewer: Arc<LeaseRenewer>,
	) -> Self {
		Self {
			token: token.into(),
			observer,
			processor,
			renewer,
		}
	}
	/// Supervise the partition until shutdown or a terminal fault.
	///
	/// Returns `Ok` on a clean shutdown. A split is re-raised so the
	/// controller can run the split protocol; other faults are re-raised
	/// after the observer has been closed.
	#[instrument(level = "debug", target = "weir::core::host::supervisor", skip(self, shutdown), fields(token = %self.token))]
	pub async fn run(&self, shutdown: CancellationToken) -> Result<(), Error> {
		// Open the observer before any batch is delivered
		let ctx = ObserverContext::for_lease(self.token.clone());
		if let Err(source) = self.observer.open(&ctx).await {
			let error = Error::Observer {
				source,
			};
			self.close(CloseReason::ObserverError).await;
			return Err(error);
		}
		// Both tasks share one linked token: outer shutdown cascades into
		// it, and either task finishing cancels the other through it
		let linked = shutdown.child_token();
		let mut processing = {
			let processor = self.processor.clone();
			let cancel = linked.clone();
			tokio::spawn(async move { processor.run(cancel).await })
		};
		let mut renewal = {
			let renewer = self.renewer.clone();
			let cancel = linked.clone();
			tokio::spawn(async move { renewer.run(cancel).await })
		};
		// Wait for the first task to finish, then cancel and await the other
		let (processed, renewed) = tokio::select! {
			first = &mut processing => {
				linked.cancel();
				(flatten(first), flatten((&mut renewal).await))
			}
			first = &mut renewal => {
				linked.cancel();
				(flatten((&mut processing).await), flatten(first))
			}
		};
		// Derive the close reason from the observed termination
		let (reason, outcome) = resolve(processed, renewed);
		debug!(target: TARGET, token = %self.token, reason = %reason, "Partition supervision ended");
		self.close(reason).await;
		outcome
	}
	/// Close the observer, logging rather than surfacing its failures
	async fn close(&self, reason: CloseReason) {
		let ctx = ObserverContext::for_lease(self.token.clone());
		if let Err(error) = self.observer.close(&ctx, reason).await {
			warn!(target: TARGET, token = %self.token, %error, "Observer failed to close");
		}
	}
}

/// Collapse a join result into the task's own result
fn flatten(joined: Result<Result<(), Error>, JoinError>) -> Result<(), Error> {
	match joined {
		Ok(result) => result,
		Err(e) => Err(Error::Task {
			message: e.to_string(),
		}),
	}
}

/// Map the two task outcomes onto a close reason and the supervisor's
/// own result. Lease loss takes precedence over processor faults: a split
/// observed on a lease we no longer hold is not ours to handle. Both
/// loops only finish cleanly when cancelled, so a double success means
/// the shutdown signal fired.
fn resolve(
	processed: Result<(), Error>,
	renewed: Result<(), Error>,
) -> (CloseReason, Result<(), Error>) {
	let renewed = match renewed {
		Err(error @ Error::LeaseLost {
			..
		}) => return (CloseReason::LeaseLost, Err(error)),
		other => other,
	};
	match processed {
		Err(error @ Error::FeedSplit {
			..
		}) => (CloseReason::LeaseGone, Err(error)),
		Err(error @ Error::FeedNotFound) => (CloseReason::ResourceGone, Err(error)),
		Err(error @ Error::FeedReadSessionNotAvailable) => {
			(CloseReason::ReadSessionNotAvailable, Err(error))
		}
		Err(error @ Error::Observer {
			..
		}) => (CloseReason::ObserverError, Err(error)),
		Err(error @ Error::LeaseLost {
			..
		}) => (CloseReason::LeaseLost, Err(error)),
		Err(Error::Cancelled) => (CloseReason::Shutdown, Ok(())),
		Err(error) => (CloseReason::Unknown, Err(error)),
		Ok(()) => match renewed {
			// Both loops only finish cleanly when cancelled
			Ok(()) => (CloseReason::Shutdown, Ok(())),
			Err(error) => (CloseReason::Unknown, Err(error)),
		},
	}
}
