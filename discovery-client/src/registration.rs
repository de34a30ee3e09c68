use std::time;

use discovery_common::retry::RetryPolicy;
use discovery_common::transport::{RequestSpec, Transport};
use http::Method;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ClientError, RequestError};
use crate::service::{Identity, ServiceDescriptor};

/// Registers this instance with the discovery server and deregisters it on the way out.
#[derive(Clone)]
pub struct Registrar {
    transport: Transport,
    descriptor: ServiceDescriptor,
    /// Consecutive failed attempts tolerated before registration is given up.
    max_attempts: u32,
    /// Fixed wait between registration attempts.
    retry_interval: time::Duration,
}

impl Registrar {
    pub fn new(
        transport: Transport,
        descriptor: ServiceDescriptor,
        max_attempts: u32,
        retry_interval: time::Duration,
    ) -> Self {
        Self {
            transport,
            descriptor,
            max_attempts,
            retry_interval,
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Register, retrying every `retry_interval` until an identity is assigned.
    ///
    /// Gives up with `ClientError::RegistrationExhausted` after `max_attempts` consecutive
    /// failures; at least one attempt is always made. Returns `ClientError::Stopped` as soon
    /// as `shutdown` is cancelled, even halfway through an attempt.
    pub async fn register(&self, shutdown: &CancellationToken) -> Result<Identity, ClientError> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(ClientError::Stopped),
                result = self.register_once() => result,
            };

            let error = match result {
                Ok(identity) => {
                    info!(
                        "service {} registered: SERVICE_ID: {} INSTANCE_ID: {}",
                        self.descriptor.name, identity.service_id, identity.instance_id
                    );
                    metrics::counter!("discovery_registrations_total", "outcome" => "success")
                        .increment(1);
                    return Ok(identity);
                }
                Err(error) => error,
            };

            metrics::counter!("discovery_registrations_total", "outcome" => "failure").increment(1);

            if attempt >= attempts {
                error!(
                    "could not register service {}, giving up after {} attempts: {}",
                    self.descriptor.name, attempts, error
                );
                return Err(ClientError::RegistrationExhausted {
                    attempts,
                    last_error: error,
                });
            }

            warn!(
                "[ATTEMPT {}/{}] failed to register service {}, retrying in {:?}: {}",
                attempt, attempts, self.descriptor.name, self.retry_interval, error
            );

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(ClientError::Stopped),
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
            attempt += 1;
        }
    }

    /// A single registration attempt. Transport-level retries are disabled so that a
    /// failing server is retried at the registration cadence only.
    async fn register_once(&self) -> Result<Identity, RequestError> {
        let spec = RequestSpec::new(Method::POST, "/register")
            .json(self.descriptor.to_registration_body())
            .retry_policy(RetryPolicy::none());

        let response = self.transport.send(spec).await?;

        if !response.is_success() {
            return Err(RequestError::ClientRejected(response.status));
        }

        Ok(response.into_json::<Identity>()?)
    }

    /// Best-effort deregistration. Failures are logged and swallowed so they never
    /// hold up shutdown.
    pub async fn deregister(&self, identity: &Identity) {
        let spec = identity
            .tag(RequestSpec::new(Method::DELETE, "/deregister"))
            .retry_policy(RetryPolicy::none());

        match self.transport.send(spec).await {
            Ok(response) if response.is_success() => {
                info!(
                    "service {} deregistered: INSTANCE_ID: {}",
                    self.descriptor.name, identity.instance_id
                );
            }
            Ok(response) => {
                warn!(
                    "could not deregister instance {}: discovery server responded with {}",
                    identity.instance_id, response.status
                );
            }
            Err(error) => {
                warn!(
                    "could not deregister instance {}: {}",
                    identity.instance_id, error
                );
            }
        }
    }
}
