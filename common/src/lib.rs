pub mod config;
pub mod node;
pub mod portal;
pub mod protocol;
pub mod provisioning;
pub mod sampler;
pub mod store;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{DeviceConfig, Endpoint, EndpointError, NodeSettings};
pub use node::{Board, CycleReport, Node, ProvisioningOutcome, PublishStatus};
pub use portal::{PortalError, PortalEvent, PortalForm, PortalMode, PortalService, PortalSession};
pub use provisioning::{ProvisioningController, ProvisioningState, ProvisioningTrigger};
pub use sampler::{AnalogInput, HumitureSensor, RawHumiture, SensorFault, SensorSampler};
pub use store::{ConfigBackend, ConfigStore, FsBackend, StoreError};
pub use telemetry::{EventTransport, TelemetryPublisher, TransportError};
pub use types::{ReadStatus, SensorReading, TelemetryPacket};
