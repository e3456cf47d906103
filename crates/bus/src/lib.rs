pub mod client;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod http;
pub mod monitor;
pub mod runtime;
pub mod topics;
pub mod traits;

pub use client::{MqttTransport, QosLevel};
pub use discovery::{ServiceDescriptor, ServiceRegistry, ServiceStatus};
pub use envelope::{Envelope, MessageType, Priority, Routing};
pub use error::BusError;
pub use monitor::{HealthMonitor, OverallStatus, ProbeStatus};
pub use runtime::{HealthSnapshot, PublishOpts, ServiceRuntime, ServiceState};
pub use traits::{BusPublisher, MessageHandler};
