use std::sync::Arc;

use discovery_common::registry::RegistryCache;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::ClientError;
use crate::service::Identity;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle notifications published by a `DiscoveryClient`.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Registration succeeded, initially or after recovering.
    Registered(Identity),
    /// Deregistration was sent while stopping.
    Deregistered,
    /// The discovery server acknowledged a heartbeat.
    Heartbeat,
    /// A registry poll replaced the local cache with this snapshot.
    RegistryFetched(Arc<RegistryCache>),
    /// A fatal error terminated the runtime.
    Error(ClientError),
}

/// Fan-out of `ClientEvent`s to any number of subscribers.
/// Subscribers that fall behind lose the oldest events.
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<ClientEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        if self.sender.send(event).is_err() {
            debug!("no subscribers for client event");
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
