use crate::err::Error;
use crate::host::LeaseController;
use crate::lease::Lease;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

const TARGET: &str = "weir::core::host::monitor";

/// How serious a reported condition is
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum HealthSeverity {
	/// The operation completed as expected
	Informational,
	/// The operation failed
	Error,
}

/// The controller operation a health record describes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum HealthOperation {
	/// Taking ownership of a lease and starting its processing
	AcquireLease,
}

impl fmt::Display for HealthOperation {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			HealthOperation::AcquireLease => write!(f, "acquire lease"),
		}
	}
}

/// One observed controller outcome
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct HealthRecord {
	/// How serious the condition is
	pub severity: HealthSeverity,
	/// The operation that was observed
	pub operation: HealthOperation,
	/// The lease token the operation targeted
	pub lease_token: String,
	/// The failure message, when the operation failed
	pub message: Option<String>,
}

/// Receives health records emitted by the monitoring controller.
#[async_trait]
pub trait HealthMonitor: Send + Sync + 'static {
	/// Inspect one observed outcome
	async fn inspect(&self, record: HealthRecord);
}

/// A [`HealthMonitor`] forwarding records to the tracing subscriber.
#[derive(Default)]
pub struct TracingHealthMonitor;

#[async_trait]
impl HealthMonitor for TracingHealthMonitor {
	async fn inspect(&self, record: HealthRecord) {
		match record.severity {
			HealthSeverity::Informational => {
				debug!(
					target: TARGET,
					operation = %record.operation,
					token = %record.lease_token,
					"Controller operation succeeded"
				);
			}
			HealthSeverity::Error => {
				error!(
					target: TARGET,
					operation = %record.operation,
					token = %record.lease_token,
					message = record.message.as_deref().unwrap_or(""),
					"Controller operation failed"
				);
			}
		}
	}
}

/// A [`LeaseController`] decorator reporting every ownership outcome to a
/// [`HealthMonitor`] before passing it through unchanged.
pub struct HealthMonitoringController {
	/// The controller being decorated
	inner: Arc<dyn LeaseController>,
	/// The sink receiving health records
	monitor: Arc<dyn HealthMonitor>,
}

impl HealthMonitoringController {
	/// Wrap a controller with health monitoring
	pub fn new(inner: Arc<dyn LeaseController>, monitor: Arc<dyn HealthMonitor>) -> Self {
		Self {
			inner,
			monitor,
		}
	}
}

#[async_trait]
impl LeaseController for HealthMonitoringController {
	async fn initialize(&self) -> Result<(), Error> {
		self.inner.initialize().await
	}

	async fn add_or_update(&self, lease: Lease) -> Result<(), Error> {
		let token = lease.token.clone();
		let result = self.inner.add_or_update(lease).await;
		let record = match &result {
			Ok(()) => HealthRecord {
				severity: HealthSeverity::Informational,
				operation: HealthOperation::AcquireLease,
				lease_token: token,
				message: None,
			},
			Err(error) => HealthRecord {
				severity: HealthSeverity::Error,
				operation: HealthOperation::AcquireLease,
				lease_token: token,
				message: Some(error.to_string()),
			},
		};
		self.monitor.inspect(record).await;
		result
	}

	async fn shutdown(&self) {
		self.inner.shutdown().await
	}
}
