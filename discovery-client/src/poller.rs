use std::sync::{Arc, PoisonError, RwLock};

use discovery_common::registry::RegistryCache;
use discovery_common::transport::{RequestSpec, Transport};
use http::Method;
use tracing::{debug, warn};

use crate::error::{ClientError, RequestError};
use crate::events::{ClientEvent, Notifier};

/// Shared handle to the latest registry snapshot.
pub type RegistryStore = Arc<RwLock<Arc<RegistryCache>>>;

/// Refreshes the local registry cache from the discovery server.
pub struct RegistryPoller {
    transport: Transport,
    filter: String,
    store: RegistryStore,
    notifier: Notifier,
}

impl RegistryPoller {
    pub fn new(
        transport: Transport,
        filter: &str,
        store: RegistryStore,
        notifier: Notifier,
    ) -> Self {
        Self {
            transport,
            filter: filter.to_owned(),
            store,
            notifier,
        }
    }

    /// Fetch the registry once. On success the cached snapshot is replaced as a whole,
    /// nothing from earlier polls survives.
    ///
    /// Only a failed request or a non-2xx status is a `PollFailure`. A 2xx body that does
    /// not decode into a registry keeps the previous snapshot.
    pub async fn poll(&self) -> Result<(), ClientError> {
        let spec = RequestSpec::new(Method::GET, "/registry").query("filter", &self.filter);

        let response = match self.transport.send(spec).await {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                return Err(self.failure(RequestError::ClientRejected(response.status)))
            }
            Err(error) => return Err(self.failure(RequestError::from(error))),
        };

        let cache = match response.into_json::<RegistryCache>() {
            Ok(cache) => Arc::new(cache),
            Err(error) => {
                warn!(
                    "ignoring undecodable registry, keeping the previous one: {}",
                    error
                );
                metrics::counter!("discovery_registry_fetches_total", "outcome" => "undecodable")
                    .increment(1);
                return Ok(());
            }
        };

        debug!(
            "registry fetched with {} services",
            cache.service_names().count()
        );
        metrics::counter!("discovery_registry_fetches_total", "outcome" => "success").increment(1);

        *self.store.write().unwrap_or_else(PoisonError::into_inner) = cache.clone();
        self.notifier.emit(ClientEvent::RegistryFetched(cache));

        Ok(())
    }

    fn failure(&self, error: RequestError) -> ClientError {
        metrics::counter!("discovery_registry_fetches_total", "outcome" => "failure").increment(1);
        ClientError::PollFailure(error)
    }
}
