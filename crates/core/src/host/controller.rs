use crate::err::Error;
use crate::feed::FeedReader;
use crate::host::{
	Checkpointer, ObserverFactory, PartitionProcessor, PartitionSupervisor,
};
use crate::lease::{Lease, LeaseManager, LeaseRenewer, LeaseStore};
use crate::options::ProcessorOptions;
use crate::store::{Collection, PartitionSynchronizer};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TARGET: &str = "weir::core::host::controller";

/// The controller surface the load balancer and the manager drive.
#[async_trait]
pub trait LeaseController: Send + Sync + 'static {
	/// Adopt the leases already owned by this instance in the store
	async fn initialize(&self) -> Result<(), Error>;
	/// Take ownership of a lease and start processing it, or refresh the
	/// persisted properties of a lease already being processed
	async fn add_or_update(&self, lease: Lease) -> Result<(), Error>;
	/// Stop processing every owned lease and wait until each partition's
	/// observer has been closed
	async fn shutdown(&self);
}

/// One owned partition and the completion of its processing task
struct Owned {
	/// The supervision task, set once the lease has been acquired
	handle: Option<JoinHandle<()>>,
}

struct Inner {
	/// The instance name this controller acquires leases for
	instance: String,
	/// The monitored collection whose change feed is processed
	monitored: Arc<dyn Collection>,
	/// The manager performing conditional lease writes
	manager: Arc<dyn LeaseManager>,
	/// The lease catalog
	store: Arc<LeaseStore>,
	/// The partition topology, used to resolve splits
	synchronizer: Arc<PartitionSynchronizer>,
	/// Creates one observer per supervised partition
	factory: Arc<dyn ObserverFactory>,
	/// The processor configuration
	options: ProcessorOptions,
	/// The currently owned leases, keyed by lease token
	owned: DashMap<String, Owned>,
	/// The shutdown signal cascading into every supervisor
	shutdown: CancellationToken,
}

/// Tracks the set of leases owned by this instance, supervises one
/// processing pipeline per owned lease, and runs the split protocol when
/// a supervisor reports that its range is gone.
pub struct PartitionController {
	inner: Arc<Inner>,
}

impl PartitionController {
	/// Create a controller for one host instance
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		instance: impl Into<String>,
		monitored: Arc<dyn Collection>,
		manager: Arc<dyn LeaseManager>,
		store: Arc<LeaseStore>,
		synchronizer: Arc<PartitionSynchronizer>,
		factory: Arc<dyn ObserverFactory>,
		options: ProcessorOptions,
		shutdown: CancellationToken,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				instance: instance.into(),
				monitored,
				manager,
				store,
				synchronizer,
				factory,
				options,
				owned: DashMap::new(),
				shutdown,
			}),
		}
	}
	/// The number of leases currently being processed
	pub fn owned_count(&self) -> usize {
		self.inner.owned.len()
	}
}

#[async_trait]
impl LeaseController for PartitionController {
	#[instrument(level = "debug", target = "weir::core::host::controller", skip(self))]
	async fn initialize(&self) -> Result<(), Error> {
		// Adopt every lease the store still records as ours
		let leases = self.inner.store.get_all_leases().await?;
		for lease in leases {
			if lease.is_owned_by(&self.inner.instance) {
				debug!(target: TARGET, token = %lease.token, "Adopting owned lease");
				if let Err(error) = self.inner.clone().add_or_update(lease).await {
					warn!(target: TARGET, error = %error, "Failed to adopt an owned lease");
				}
			}
		}
		Ok(())
	}

	async fn add_or_update(&self, lease: Lease) -> Result<(), Error> {
		self.inner.clone().add_or_update(lease).await
	}

	#[instrument(level = "debug", target = "weir::core::host::controller", skip(self))]
	async fn shutdown(&self) {
		// Signal every supervisor, then wait for processing to end
		self.inner.shutdown.cancel();
		let handles: Vec<JoinHandle<()>> = self
			.inner
			.owned
			.iter_mut()
			.filter_map(|mut entry| entry.value_mut().handle.take())
			.collect();
		for handle in handles {
			if let Err(error) = handle.await {
				warn!(target: TARGET, error = %error, "A supervision task failed to join");
			}
		}
	}
}

impl Inner {
	/// Take ownership of a lease and start supervising it. A lease that is
	/// already being processed only has its properties refreshed. Safe
	/// against concurrent invocations for the same token: the owned-set
	/// reservation is a single insert-if-absent.
	async fn add_or_update(self: Arc<Self>, lease: Lease) -> Result<(), Error> {
		let token = lease.token.clone();
		// Reserve the slot before any suspension point
		let reserved = match self.owned.entry(token.clone()) {
			Entry::Occupied(_) => false,
			Entry::Vacant(vacant) => {
				vacant.insert(Owned {
					handle: None,
				});
				true
			}
		};
		if !reserved {
			// Already processing this partition, persist property changes
			self.manager.update_properties(&lease).await?;
			return Ok(());
		}
		match self.manager.acquire(&lease).await {
			Ok(Some(acquired)) => {
				info!(target: TARGET, token = %token, "Acquired lease");
				let handle = self.clone().spawn_supervision(acquired);
				if let Some(mut slot) = self.owned.get_mut(&token) {
					slot.handle = Some(handle);
				}
				Ok(())
			}
			Ok(None) => {
				// Another instance stole the lease, do not retry this cycle
				self.owned.remove(&token);
				Err(Error::LeaseLost {
					token,
				})
			}
			Err(e) => {
				self.owned.remove(&token);
				Err(e)
			}
		}
	}
	/// Run one supervision pipeline for an acquired lease to completion
	fn spawn_supervision(self: Arc<Self>, lease: Lease) -> JoinHandle<()> {
		let inner = self;
		tokio::spawn(async move {
			let token = lease.token.clone();
			let slot = Arc::new(RwLock::new(lease));
			// Cache the range bounds now so a later split can recover them
			match inner.synchronizer.ensure_range(&token).await {
				Ok(Some(_)) => (),
				Ok(None) => {
					warn!(target: TARGET, token = %token, "The acquired lease covers no known range")
				}
				Err(error) => {
					warn!(target: TARGET, token = %token, error = %error, "Failed to cache the range topology")
				}
			}
			// Assemble the per-partition pipeline
			let observer = inner.factory.create_observer();
			let checkpointer =
				Arc::new(Checkpointer::new(inner.manager.clone(), slot.clone(), &inner.options));
			let reader =
				FeedReader::new(inner.monitored.clone(), token.clone(), inner.options.max_items);
			let processor = Arc::new(PartitionProcessor::new(
				reader,
				observer.clone(),
				checkpointer,
				slot.clone(),
				inner.options.clone(),
			));
			let renewer = Arc::new(LeaseRenewer::new(
				inner.manager.clone(),
				slot.clone(),
				inner.options.renew_interval,
			));
			let supervisor = PartitionSupervisor::new(token.clone(), observer, processor, renewer);
			let result = supervisor.run(inner.shutdown.child_token()).await;
			// React to how processing ended before vacating the slot
			let last = slot.read().await.clone();
			match result {
				Ok(()) => {
					// A clean shutdown frees the lease for other instances
					if let Err(error) = inner.manager.release(&last).await {
						warn!(target: TARGET, token = %token, error = %error, "Failed to release lease on shutdown");
					}
				}
				Err(Error::FeedSplit {
					continuation,
				}) => {
					if let Err(error) = inner.clone().handle_split(last, continuation).await {
						error!(target: TARGET, token = %token, error = %error, "Failed to handle a partition split");
					}
				}
				Err(Error::LeaseLost {
					..
				}) => {
					// Nothing to release, the lease belongs to someone else
					debug!(target: TARGET, token = %token, "Processing ended, lease lost");
				}
				Err(error) => {
					warn!(target: TARGET, token = %token, error = %error, "Processing ended with an error");
					if let Err(error) = inner.manager.release(&last).await {
						warn!(target: TARGET, token = %token, error = %error, "Failed to release lease");
					}
				}
			}
			inner.owned.remove(&token);
		})
	}
	/// The split protocol: persist the parent's final position, discover
	/// the child ranges, create their leases with the parent's properties,
	/// delete the parent, and start processing every child.
	#[instrument(level = "debug", target = "weir::core::host::controller", skip(self, parent, continuation), fields(token = %parent.token))]
	async fn handle_split(
		self: Arc<Self>,
		parent: Lease,
		continuation: Option<String>,
	) -> Result<(), Error> {
		info!(target: TARGET, token = %parent.token, "Partition range was split");
		// Persist the last accepted continuation into the parent first, so
		// the children inherit an up-to-date starting position
		let parent = match continuation {
			Some(c) if !c.is_empty() => self.manager.checkpoint(&parent, &c).await?,
			_ => parent,
		};
		let children = self.synchronizer.split_ranges(&parent.token).await?;
		// All children must exist before the parent lease is deleted
		for child in &children {
			self.store
				.create_lease_if_not_exists(
					&child.id,
					parent.continuation.clone(),
					parent.properties.clone(),
				)
				.await?;
		}
		self.manager.delete(&parent).await?;
		// Pick up the children, leaving any we lose to other instances
		for child in &children {
			match self.store.get_lease(&child.id).await? {
				Some(lease) => {
					if let Err(error) = self.clone().add_or_update(lease).await {
						warn!(target: TARGET, child = %child.id, error = %error, "Failed to start processing a split child");
					}
				}
				None => {
					warn!(target: TARGET, child = %child.id, "A split child lease disappeared");
				}
			}
		}
		Ok(())
	}
}
