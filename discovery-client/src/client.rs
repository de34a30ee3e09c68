use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time;

use discovery_common::registry::{InstanceRecord, RegistryCache};
use discovery_common::transport::Transport;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ClientError;
use crate::events::{ClientEvent, Notifier};
use crate::heartbeat::Heartbeat;
use crate::poller::{RegistryPoller, RegistryStore};
use crate::registration::Registrar;
use crate::schedule::{run_periodic, ReRegistrationGate};
use crate::service::{Identity, ServiceDescriptor};

/// Runtime settings of a `DiscoveryClient`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub descriptor: ServiceDescriptor,
    pub max_attempts: u32,
    pub retry_interval: time::Duration,
    pub fetch_registry: bool,
    pub fetch_registry_interval: time::Duration,
    pub fetch_registry_filter: String,
}

impl ClientOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            descriptor: config.service.descriptor(),
            max_attempts: config.discovery.max_attempts,
            retry_interval: config.discovery.retry_interval.0,
            fetch_registry: config.discovery.fetch_registry,
            fetch_registry_interval: config.discovery.fetch_registry_interval.0,
            fetch_registry_filter: config.discovery.fetch_registry_filter.as_str().to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Stopped,
    Registering,
    /// Registered, with the heartbeat loop and registry poller scheduled.
    Active,
    ReRegistering,
}

#[derive(Debug, Clone)]
enum ClosedState {
    Open,
    Stopped,
    Failed(ClientError),
}

/// The periodic loops running for one registered identity.
struct Loops {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Loops {
    async fn shutdown(self) {
        self.token.cancel();

        for result in futures::future::join_all(self.handles).await {
            if let Err(error) = result {
                warn!("discovery loop terminated abnormally: {}", error);
            }
        }
    }
}

struct State {
    lifecycle: Lifecycle,
    identity: Option<Identity>,
    loops: Option<Loops>,
    reregistration: Option<JoinHandle<()>>,
}

struct Inner {
    registrar: Registrar,
    transport: Transport,
    options: ClientOptions,
    notifier: Notifier,
    gate: ReRegistrationGate,
    /// Cancelled once, when the client stops or fails. Every loop token is a child of it.
    shutdown: CancellationToken,
    /// Serializes `start` and `stop`.
    op_lock: tokio::sync::Mutex<()>,
    state: Mutex<State>,
    registry: RegistryStore,
    closed: watch::Sender<ClosedState>,
}

/// Keeps one service instance registered with the discovery server.
///
/// `start` registers and schedules the heartbeat loop and, if enabled, the registry
/// poller. When either loop fails the client re-registers and resumes both loops with
/// the new identity. If registration is exhausted the client terminates: an
/// `Error` event is emitted and `closed` resolves with the error. `stop` cancels
/// everything in flight and deregisters.
#[derive(Clone)]
pub struct DiscoveryClient {
    inner: Arc<Inner>,
}

impl DiscoveryClient {
    pub fn new(transport: Transport, options: ClientOptions) -> Self {
        let registrar = Registrar::new(
            transport.clone(),
            options.descriptor.clone(),
            options.max_attempts,
            options.retry_interval,
        );
        let (closed, _) = watch::channel(ClosedState::Open);

        Self {
            inner: Arc::new(Inner {
                registrar,
                transport,
                options,
                notifier: Notifier::new(),
                gate: ReRegistrationGate::new(),
                shutdown: CancellationToken::new(),
                op_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(State {
                    lifecycle: Lifecycle::Stopped,
                    identity: None,
                    loops: None,
                    reregistration: None,
                }),
                registry: Arc::new(RwLock::new(Arc::new(RegistryCache::default()))),
                closed,
            }),
        }
    }

    /// Register and start the periodic loops.
    ///
    /// A client can only be started once. Calling `start` again returns
    /// `ClientError::AlreadyStarted`, or `ClientError::Stopped` once it has been stopped.
    pub async fn start(&self) -> Result<Identity, ClientError> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;

        if inner.shutdown.is_cancelled() {
            return Err(ClientError::Stopped);
        }

        {
            let mut state = inner.lock_state();
            if state.lifecycle != Lifecycle::Stopped {
                return Err(ClientError::AlreadyStarted);
            }
            state.lifecycle = Lifecycle::Registering;
        }

        info!("registering service {}", inner.options.descriptor.name);

        match inner.registrar.register(&inner.shutdown).await {
            Ok(identity) => {
                inner.activate(identity.clone());
                Ok(identity)
            }
            Err(ClientError::Stopped) => Err(ClientError::Stopped),
            Err(error) => {
                inner.fail(error.clone());
                Err(error)
            }
        }
    }

    /// Cancel the loops and any re-registration in flight, wait for them to finish,
    /// then deregister the current identity. Calling `stop` more than once is harmless.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();

        let _op = inner.op_lock.lock().await;

        let reregistration = inner.lock_state().reregistration.take();
        if let Some(handle) = reregistration {
            if let Err(error) = handle.await {
                warn!("re-registration terminated abnormally: {}", error);
            }
        }

        let loops = inner.lock_state().loops.take();
        if let Some(loops) = loops {
            loops.shutdown().await;
        }

        let identity = {
            let mut state = inner.lock_state();
            state.lifecycle = Lifecycle::Stopped;
            state.identity.take()
        };

        if let Some(identity) = identity {
            inner.registrar.deregister(&identity).await;
            inner.notifier.emit(ClientEvent::Deregistered);
        }

        inner.closed.send_if_modified(|closed| match closed {
            ClosedState::Open => {
                *closed = ClosedState::Stopped;
                true
            }
            _ => false,
        });

        info!("discovery client stopped");
    }

    /// Resolves once the client has terminated. Returns the fatal error if it terminated
    /// because registration was exhausted, `None` if it was stopped.
    pub async fn closed(&self) -> Option<ClientError> {
        let mut receiver = self.inner.closed.subscribe();

        let closed = receiver
            .wait_for(|closed| !matches!(closed, ClosedState::Open))
            .await
            .ok()?;

        match &*closed {
            ClosedState::Failed(error) => Some(error.clone()),
            _ => None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.notifier.subscribe()
    }

    pub fn state(&self) -> Lifecycle {
        self.inner.lock_state().lifecycle
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.lock_state().identity.clone()
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.inner.options.descriptor
    }

    /// The registry as of the last successful poll.
    pub fn registry(&self) -> Arc<RegistryCache> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn instances(&self, service: &str) -> Vec<InstanceRecord> {
        self.registry().instances(service).to_vec()
    }

    pub fn find_instance(&self, instance_id: &str) -> Option<InstanceRecord> {
        self.registry().find_instance(instance_id).cloned()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a fresh identity and schedule the loops for it. If the client is shutting
    /// down, the identity is kept for deregistration but no loop is started.
    fn activate(self: &Arc<Self>, identity: Identity) {
        {
            let mut state = self.lock_state();
            state.identity = Some(identity.clone());

            if !self.shutdown.is_cancelled() {
                let token = self.shutdown.child_token();
                let mut handles = Vec::with_capacity(2);

                let heartbeat = Arc::new(Heartbeat::new(
                    self.transport.clone(),
                    identity.clone(),
                    self.notifier.clone(),
                ));
                handles.push(self.spawn_loop(
                    "heartbeat",
                    self.options.descriptor.heartbeat_interval,
                    token.clone(),
                    move || {
                        let heartbeat = heartbeat.clone();
                        async move { heartbeat.beat().await }
                    },
                ));

                if self.options.fetch_registry {
                    let poller = Arc::new(RegistryPoller::new(
                        self.transport.clone(),
                        &self.options.fetch_registry_filter,
                        self.registry.clone(),
                        self.notifier.clone(),
                    ));
                    handles.push(self.spawn_loop(
                        "registry poller",
                        self.options.fetch_registry_interval,
                        token.clone(),
                        move || {
                            let poller = poller.clone();
                            async move { poller.poll().await }
                        },
                    ));
                }

                state.loops = Some(Loops { token, handles });
                state.lifecycle = Lifecycle::Active;
            }
        }

        self.notifier.emit(ClientEvent::Registered(identity));
    }

    fn spawn_loop<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period: time::Duration,
        token: CancellationToken,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ClientError>> + Send + 'static,
    {
        let inner: Weak<Inner> = Arc::downgrade(self);
        let gate = self.gate.clone();

        tokio::spawn(async move {
            if let Some(error) = run_periodic(name, period, token, gate, tick).await {
                if let Some(inner) = inner.upgrade() {
                    inner.reregister(error);
                }
            }
        })
    }

    /// Kick off a re-registration unless one is already running or the client is
    /// shutting down.
    fn reregister(self: &Arc<Self>, cause: ClientError) {
        let Some(guard) = self.gate.try_acquire() else {
            debug!("re-registration already in flight, ignoring: {}", cause);
            return;
        };

        let mut state = self.lock_state();
        if self.shutdown.is_cancelled() {
            return;
        }

        warn!("lost registration, re-registering: {}", cause);
        state.lifecycle = Lifecycle::ReRegistering;

        let inner = self.clone();
        state.reregistration = Some(tokio::spawn(async move {
            let _guard = guard;
            inner.run_reregistration().await;
        }));
    }

    async fn run_reregistration(self: &Arc<Self>) {
        metrics::counter!("discovery_reregistrations_total").increment(1);

        let loops = self.lock_state().loops.take();
        if let Some(loops) = loops {
            loops.shutdown().await;
        }
        self.lock_state().identity = None;

        match self.registrar.register(&self.shutdown).await {
            Ok(identity) => self.activate(identity),
            Err(ClientError::Stopped) => debug!("re-registration abandoned, client is stopping"),
            Err(error) => self.fail(error),
        }
    }

    /// Terminate the client after an unrecoverable error.
    fn fail(&self, error: ClientError) {
        error!("discovery client terminated: {}", error);
        self.shutdown.cancel();

        {
            let mut state = self.lock_state();
            state.lifecycle = Lifecycle::Stopped;
            state.identity = None;
        }

        self.notifier.emit(ClientEvent::Error(error.clone()));
        self.closed.send_replace(ClosedState::Failed(error));
    }
}
