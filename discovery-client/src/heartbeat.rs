use discovery_common::transport::{RequestSpec, Transport};
use http::Method;
use tracing::debug;

use crate::error::{ClientError, RequestError};
use crate::events::{ClientEvent, Notifier};
use crate::service::Identity;

/// Sends liveness signals for one registered identity.
/// A new `Heartbeat` is built for every registration, so it never outlives its identity.
pub struct Heartbeat {
    transport: Transport,
    identity: Identity,
    notifier: Notifier,
}

impl Heartbeat {
    pub fn new(transport: Transport, identity: Identity, notifier: Notifier) -> Self {
        Self {
            transport,
            identity,
            notifier,
        }
    }

    /// Send one heartbeat. Anything but a 2xx means the server lost track of us or is
    /// unreachable, and is reported as a `HeartbeatFailure`.
    pub async fn beat(&self) -> Result<(), ClientError> {
        let spec = self
            .identity
            .tag(RequestSpec::new(Method::POST, "/heartbeat"));

        let result = match self.transport.send(spec).await {
            Ok(response) if response.is_success() => Ok(()),
            Ok(response) => Err(RequestError::ClientRejected(response.status)),
            Err(error) => Err(RequestError::from(error)),
        };

        match result {
            Ok(()) => {
                debug!(
                    "heartbeat sent for instance {}",
                    self.identity.instance_id
                );
                metrics::counter!("discovery_heartbeats_total", "outcome" => "success")
                    .increment(1);
                self.notifier.emit(ClientEvent::Heartbeat);
                Ok(())
            }
            Err(error) => {
                metrics::counter!("discovery_heartbeats_total", "outcome" => "failure")
                    .increment(1);
                Err(ClientError::HeartbeatFailure(error))
            }
        }
    }
}
