use crate::err::Error;
use crate::est::RemainingWorkEstimator;
use crate::host::{
	Bootstrapper, ChangeFeedObserver, EqualDistributionStrategy, HealthMonitor,
	HealthMonitoringController, LeaseController, LoadBalancer, LoadBalancingStrategy,
	ObserverFactory, PartitionController,
};
use crate::lease::{DocumentLeaseManager, LeaseStore};
use crate::options::ProcessorOptions;
use crate::store::{Collection, PartitionSynchronizer};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TARGET: &str = "weir::core::host::manager";

/// Composes bootstrap, the partition controller and the load balancer
/// into one start/stop unit.
pub struct PartitionManager {
	/// The bootstrap protocol run before anything else
	bootstrapper: Bootstrapper,
	/// The owned-lease controller
	controller: Arc<dyn LeaseController>,
	/// The periodic load balancer
	balancer: Arc<LoadBalancer>,
	/// The shutdown signal cascading through every component
	shutdown: CancellationToken,
	/// The running balancer loop, present while started
	balancing: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionManager {
	/// Create a manager over its three composed parts
	pub fn new(
		bootstrapper: Bootstrapper,
		controller: Arc<dyn LeaseController>,
		balancer: Arc<LoadBalancer>,
		shutdown: CancellationToken,
	) -> Self {
		Self {
			bootstrapper,
			controller,
			balancer,
			shutdown,
			balancing: Mutex::new(None),
		}
	}
	/// Bootstrap the lease catalog, adopt already-owned leases, and start
	/// the balancing loop
	#[instrument(level = "debug", target = "weir::core::host::manager", skip(self))]
	pub async fn start(&self) -> Result<(), Error> {
		let mut balancing = self.balancing.lock().await;
		if balancing.is_some() {
			return Err(Error::AlreadyStarted);
		}
		self.bootstrapper.initialize(&self.shutdown).await?;
		self.controller.initialize().await?;
		let balancer = self.balancer.clone();
		let cancel = self.shutdown.child_token();
		*balancing = Some(tokio::spawn(async move { balancer.run(cancel).await }));
		info!(target: TARGET, "Change feed processor started");
		Ok(())
	}
	/// Stop balancing, then shut the controller down. Returns only after
	/// every partition's observer has been closed.
	#[instrument(level = "debug", target = "weir::core::host::manager", skip(self))]
	pub async fn stop(&self) -> Result<(), Error> {
		self.shutdown.cancel();
		if let Some(balancing) = self.balancing.lock().await.take() {
			if let Err(error) = balancing.await {
				warn!(target: TARGET, error = %error, "The balancing loop failed to join");
			}
		}
		self.controller.shutdown().await;
		info!(target: TARGET, "Change feed processor stopped");
		Ok(())
	}
}

/// A running change feed processor host.
///
/// Build one with [`ChangeFeedProcessor::builder`], then [`start`] it;
/// [`stop`] returns once every observer has been closed.
///
/// [`start`]: ChangeFeedProcessor::start
/// [`stop`]: ChangeFeedProcessor::stop
pub struct ChangeFeedProcessor {
	manager: Arc<PartitionManager>,
}

impl std::fmt::Debug for ChangeFeedProcessor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChangeFeedProcessor").finish_non_exhaustive()
	}
}

impl ChangeFeedProcessor {
	/// Start building a change feed processor
	pub fn builder() -> ChangeFeedProcessorBuilder {
		ChangeFeedProcessorBuilder::new()
	}
	/// Start processing the change feed
	pub async fn start(&self) -> Result<(), Error> {
		self.manager.start().await
	}
	/// Stop processing and close every observer
	pub async fn stop(&self) -> Result<(), Error> {
		self.manager.stop().await
	}
}

/// Assembles a [`ChangeFeedProcessor`] from its collaborators.
#[derive(Default)]
pub struct ChangeFeedProcessorBuilder {
	/// The identity stamped into acquired leases
	instance: Option<String>,
	/// The collection whose change feed is processed
	monitored: Option<Arc<dyn Collection>>,
	/// The collection holding the lease catalog
	leases: Option<Arc<dyn Collection>>,
	/// Creates one observer per supervised partition
	factory: Option<Arc<dyn ObserverFactory>>,
	/// The balancing policy, defaulting to equal distribution
	strategy: Option<Arc<dyn LoadBalancingStrategy>>,
	/// An optional sink for controller health records
	monitor: Option<Arc<dyn HealthMonitor>>,
	/// The processor configuration
	options: ProcessorOptions,
}

impl ChangeFeedProcessorBuilder {
	/// Create an empty builder with default options
	pub fn new() -> Self {
		Self::default()
	}
	/// Set the identity stamped into acquired leases
	pub fn instance_name(mut self, name: impl Into<String>) -> Self {
		self.instance = Some(name.into());
		self
	}
	/// Set the collection whose change feed is processed
	pub fn monitored_collection(mut self, collection: Arc<dyn Collection>) -> Self {
		self.monitored = Some(collection);
		self
	}
	/// Set the collection holding the lease catalog
	pub fn lease_collection(mut self, collection: Arc<dyn Collection>) -> Self {
		self.leases = Some(collection);
		self
	}
	/// Set the factory creating one observer per partition
	pub fn observer_factory(mut self, factory: Arc<dyn ObserverFactory>) -> Self {
		self.factory = Some(factory);
		self
	}
	/// Use one shared observer for every partition
	pub fn observer(mut self, observer: Arc<dyn ChangeFeedObserver>) -> Self {
		self.factory = Some(Arc::new(move || observer.clone()));
		self
	}
	/// Replace the balancing policy
	pub fn strategy(mut self, strategy: Arc<dyn LoadBalancingStrategy>) -> Self {
		self.strategy = Some(strategy);
		self
	}
	/// Report controller health records to a monitor
	pub fn health_monitor(mut self, monitor: Arc<dyn HealthMonitor>) -> Self {
		self.monitor = Some(monitor);
		self
	}
	/// Replace the processor configuration
	pub fn options(mut self, options: ProcessorOptions) -> Self {
		self.options = options;
		self
	}
	/// Assemble the processor
	pub fn build(self) -> Result<ChangeFeedProcessor, Error> {
		self.options.validate()?;
		let instance = match &self.instance {
			Some(name) => name.clone(),
			None => format!("weir-{}", uuid::Uuid::new_v4()),
		};
		let monitored = self.monitored.clone().ok_or_else(|| Error::InvalidOptions {
			message: "a monitored collection is required".to_string(),
		})?;
		let leases = self.leases.clone().ok_or_else(|| Error::InvalidOptions {
			message: "a lease collection is required".to_string(),
		})?;
		let factory = self.factory.clone().ok_or_else(|| Error::InvalidOptions {
			message: "an observer factory is required".to_string(),
		})?;
		// Wire the lease plumbing
		let store = Arc::new(LeaseStore::new(leases.clone(), self.options.lease_prefix.clone()));
		let manager = Arc::new(DocumentLeaseManager::new(leases, instance.clone()));
		let synchronizer = Arc::new(PartitionSynchronizer::new(monitored.clone()));
		let shutdown = CancellationToken::new();
		// Wire the controller, decorated when a monitor was supplied
		let controller: Arc<dyn LeaseController> = {
			let controller = Arc::new(PartitionController::new(
				instance.clone(),
				monitored.clone(),
				manager,
				store.clone(),
				synchronizer,
				factory,
				self.options.clone(),
				shutdown.clone(),
			));
			match &self.monitor {
				Some(monitor) => {
					Arc::new(HealthMonitoringController::new(controller, monitor.clone()))
				}
				None => controller,
			}
		};
		// Wire the balancer with the configured or default strategy
		let strategy: Arc<dyn LoadBalancingStrategy> = match &self.strategy {
			Some(strategy) => strategy.clone(),
			None => Arc::new(EqualDistributionStrategy::new(
				instance.clone(),
				self.options.expiration_interval,
			)),
		};
		let balancer = Arc::new(LoadBalancer::new(
			store.clone(),
			controller.clone(),
			strategy,
			self.options.acquire_interval,
		));
		let bootstrapper = Bootstrapper::new(store, monitored, self.options.clone());
		debug!(target: TARGET, instance = %instance, "Built change feed processor");
		Ok(ChangeFeedProcessor {
			manager: Arc::new(PartitionManager::new(bootstrapper, controller, balancer, shutdown)),
		})
	}
	/// Assemble a backlog estimator over the same lease catalog
	pub fn build_estimator(self) -> Result<RemainingWorkEstimator, Error> {
		let monitored = self.monitored.ok_or_else(|| Error::InvalidOptions {
			message: "a monitored collection is required".to_string(),
		})?;
		let leases = self.leases.ok_or_else(|| Error::InvalidOptions {
			message: "a lease collection is required".to_string(),
		})?;
		let store = Arc::new(LeaseStore::new(leases, self.options.lease_prefix.clone()));
		Ok(RemainingWorkEstimator::new(
			store,
			monitored,
			self.options.estimator_degree_of_parallelism,
		))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::host::{ObserverContext, ObserverError};
	use crate::store::mem::MemCollection;
	use async_trait::async_trait;
	use serde_json::Value;

	struct Noop;

	#[async_trait]
	impl ChangeFeedObserver for Noop {
		async fn process(
			&self,
			_ctx: &ObserverContext,
			_changes: Vec<Value>,
		) -> Result<(), ObserverError> {
			Ok(())
		}
	}

	#[test]
	fn missing_collections_fail_the_build() {
		let err = ChangeFeedProcessor::builder()
			.instance_name("host-a")
			.observer(Arc::new(Noop))
			.build()
			.unwrap_err();
		assert!(matches!(err, Error::InvalidOptions { .. }));
	}

	#[test]
	fn a_complete_builder_succeeds() {
		ChangeFeedProcessor::builder()
			.instance_name("host-a")
			.monitored_collection(Arc::new(MemCollection::new("monitored")))
			.lease_collection(Arc::new(MemCollection::new("leases")))
			.observer(Arc::new(Noop))
			.build()
			.unwrap();
	}

	#[tokio::test]
	async fn starting_twice_is_rejected() {
		let processor = ChangeFeedProcessor::builder()
			.instance_name("host-a")
			.monitored_collection(Arc::new(MemCollection::new("monitored")))
			.lease_collection(Arc::new(MemCollection::new("leases")))
			.observer(Arc::new(Noop))
			.build()
			.unwrap();
		processor.start().await.unwrap();
		assert!(matches!(processor.start().await, Err(Error::AlreadyStarted)));
		processor.stop().await.unwrap();
	}
}
