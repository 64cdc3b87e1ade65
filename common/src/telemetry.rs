use log::{debug, info};
use serde_json::Value;
use thiserror::Error;

use crate::{
    config::{Endpoint, EndpointError},
    protocol::TELEMETRY_EVENT,
    types::TelemetryPacket,
};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Socket-event connection to the aggregation server. Owned exclusively by
/// [`TelemetryPublisher`].
pub trait EventTransport {
    /// Retargets the transport, dropping any connection to the old server.
    fn bind(&mut self, endpoint: &Endpoint) -> Result<(), TransportError>;

    /// Sends one event, connecting first if needed.
    fn emit(&mut self, event: &str, payload: &Value) -> Result<(), TransportError>;
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("telemetry endpoint not configured")]
    NotConfigured,
    #[error("invalid telemetry endpoint")]
    InvalidEndpoint(#[from] EndpointError),
    #[error("failed to serialize telemetry packet")]
    Serialize(#[from] serde_json::Error),
    #[error("telemetry publish failed")]
    PublishFailed(#[source] TransportError),
}

pub struct TelemetryPublisher<T> {
    transport: T,
    endpoint: Option<Endpoint>,
}

impl<T: EventTransport> TelemetryPublisher<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            endpoint: None,
        }
    }

    /// Binds the transport to `address:port`. Returns whether the target
    /// changed; an unusable endpoint leaves the publisher unbound.
    pub fn configure(&mut self, address: &str, port: &str) -> Result<bool, PublishError> {
        let endpoint = match Endpoint::parse(address, port) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.endpoint = None;
                return Err(err.into());
            }
        };

        if self.endpoint.as_ref() == Some(&endpoint) {
            return Ok(false);
        }

        self.endpoint = None;
        self.transport
            .bind(&endpoint)
            .map_err(PublishError::PublishFailed)?;
        info!("telemetry target set to {endpoint}");
        self.endpoint = Some(endpoint);
        Ok(true)
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// One attempt, no buffering. A failed packet is gone.
    pub fn publish(&mut self, packet: &TelemetryPacket) -> Result<(), PublishError> {
        if self.endpoint.is_none() {
            return Err(PublishError::NotConfigured);
        }

        let payload = serde_json::to_value(packet)?;
        self.transport
            .emit(TELEMETRY_EVENT, &payload)
            .map_err(PublishError::PublishFailed)?;
        debug!("published {TELEMETRY_EVENT} for `{}`", packet.device_id);
        Ok(())
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
