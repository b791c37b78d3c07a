use crate::err::Error;
use crate::host::LeaseController;
use crate::lease::{Lease, LeaseStore};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const TARGET: &str = "weir::core::host::balancer";

/// Decides which leases this instance should take in one balancing cycle.
///
/// Implementations must be deterministic for identical input, and must
/// never select a lease this instance already holds and keeps renewing.
pub trait LoadBalancingStrategy: Send + Sync + 'static {
	/// The subset of leases to acquire this cycle
	fn select_leases_to_take(&self, all_leases: &[Lease]) -> Vec<Lease>;
}

/// The default strategy: converge every instance towards an equal share.
///
/// Expired leases are taken first, in lease token order, up to the
/// difference between the fair target `ceil(total / hosts)` and the
/// current holding. When nothing has expired, at most one lease per cycle
/// is taken from the instance holding the most, and only while that
/// instance holds more than the fair target. Each cycle strictly reduces
/// the maximum imbalance, so every instance ends up within one lease of
/// the fair share.
pub struct EqualDistributionStrategy {
	/// The name of this instance
	instance: String,
	/// The age above which a lease is considered abandoned
	expiration: Duration,
}

impl EqualDistributionStrategy {
	/// Create the strategy for one instance
	pub fn new(instance: impl Into<String>, expiration: Duration) -> Self {
		Self {
			instance: instance.into(),
			expiration,
		}
	}
}

impl LoadBalancingStrategy for EqualDistributionStrategy {
	fn select_leases_to_take(&self, all_leases: &[Lease]) -> Vec<Lease> {
		if all_leases.is_empty() {
			return Vec::new();
		}
		let now = Utc::now();
		// Partition the catalog into expired leases and active holdings
		let mut expired: Vec<&Lease> = Vec::new();
		let mut holdings: BTreeMap<&str, Vec<&Lease>> = BTreeMap::new();
		for lease in all_leases {
			if lease.is_expired(self.expiration, now) {
				expired.push(lease);
			} else if let Some(owner) = lease.owner.as_deref() {
				holdings.entry(owner).or_default().push(lease);
			}
		}
		let owned = holdings.get(self.instance.as_str()).map_or(0, Vec::len);
		// Count every active participant, including ourselves
		let mut hosts = holdings.len();
		if !holdings.contains_key(self.instance.as_str()) {
			hosts += 1;
		}
		let target = all_leases.len().div_ceil(hosts);
		if owned >= target {
			return Vec::new();
		}
		let need = target - owned;
		// Expired leases are free to take immediately
		expired.sort_by(|a, b| a.token.cmp(&b.token));
		if !expired.is_empty() {
			return expired.into_iter().take(need).cloned().collect();
		}
		// Otherwise relieve the most loaded instance of a single lease
		let busiest = holdings
			.iter()
			.filter(|(owner, _)| **owner != self.instance)
			.max_by(|a, b| a.1.len().cmp(&b.1.len()).then(b.0.cmp(a.0)));
		if let Some((owner, leases)) = busiest {
			if leases.len() > target {
				let mut leases: Vec<&Lease> = leases.clone();
				leases.sort_by(|a, b| a.token.cmp(&b.token));
				if let Some(steal) = leases.first() {
					debug!(target: TARGET, from = %owner, token = %steal.token, "Stealing a lease to rebalance");
					return vec![(*steal).clone()];
				}
			}
		}
		Vec::new()
	}
}

/// Periodically fetches the lease catalog, asks the strategy which leases
/// to take, and hands each to the controller. Failures on individual
/// leases never stop the cycle; the next cycle repairs whatever was missed.
pub struct LoadBalancer {
	/// The lease catalog
	store: Arc<LeaseStore>,
	/// The controller receiving selected leases
	controller: Arc<dyn LeaseController>,
	/// The selection policy
	strategy: Arc<dyn LoadBalancingStrategy>,
	/// How often a balancing cycle runs
	interval: Duration,
}

impl LoadBalancer {
	/// Create a balancer over a lease catalog
	pub fn new(
		store: Arc<LeaseStore>,
		controller: Arc<dyn LeaseController>,
		strategy: Arc<dyn LoadBalancingStrategy>,
		interval: Duration,
	) -> Self {
		Self {
			store,
			controller,
			strategy,
			interval,
		}
	}
	/// Run balancing cycles until cancelled
	#[instrument(level = "debug", target = "weir::core::host::balancer", skip(self, cancel))]
	pub async fn run(&self, cancel: CancellationToken) {
		let mut ticker = tokio::time::interval(self.interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = cancel.cancelled() => return,
				_ = ticker.tick() => (),
			}
			if let Err(error) = self.balance(&cancel).await {
				warn!(target: TARGET, error = %error, "Balancing cycle failed");
			}
		}
	}
	/// Run one balancing cycle
	async fn balance(&self, cancel: &CancellationToken) -> Result<(), Error> {
		let all_leases = self.store.get_all_leases().await?;
		let selected = self.strategy.select_leases_to_take(&all_leases);
		trace!(target: TARGET, total = all_leases.len(), selected = selected.len(), "Balancing cycle");
		for lease in selected {
			if cancel.is_cancelled() {
				return Ok(());
			}
			let token = lease.token.clone();
			if let Err(error) = self.controller.add_or_update(lease).await {
				// Lost races are expected, anything else is worth noting
				match error {
					Error::LeaseLost {
						..
					} => {
						debug!(target: TARGET, token = %token, "Lease was taken by another instance")
					}
					error => {
						warn!(target: TARGET, token = %token, error = %error, "Failed to take lease")
					}
				}
			}
		}
		Ok(())
	}
}
