use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::Notify;

use discovery_client::client::{ClientOptions, DiscoveryClient};
use discovery_client::events::ClientEvent;
use discovery_client::service::ServiceDescriptor;
use discovery_common::endpoint::{DiscoveryEndpoint, Protocol};
use discovery_common::retry::RetryPolicy;
use discovery_common::transport::Transport;

/// What the mock discovery server has seen, and how it should misbehave.
#[derive(Default)]
pub struct Discovery {
    /// Every call to /register, successful or not.
    pub register_attempts: AtomicUsize,
    /// Registrations that were assigned an identity.
    pub registrations: AtomicUsize,
    /// Fail /register with a 500 once this many identities were assigned. 0 never fails.
    pub register_fail_after: AtomicUsize,
    /// Instance ids, in the order heartbeats were received.
    pub heartbeats: Mutex<Vec<String>>,
    /// Heartbeats from these instances are answered with 401.
    pub rejected_instances: Mutex<HashSet<String>>,
    /// Delay before answering a heartbeat.
    pub heartbeat_delay_ms: AtomicU64,
    pub polls: AtomicUsize,
    /// Polls fail with a 500 until this many identities were assigned.
    pub poll_fail_before: AtomicUsize,
    pub registry: Mutex<Value>,
    pub deregistrations: Mutex<Vec<String>>,
}

impl Discovery {
    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.lock().unwrap().len()
    }

    pub fn heartbeats_from(&self, instance_id: &str) -> usize {
        self.heartbeats
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == instance_id)
            .count()
    }

    pub fn deregistered(&self) -> Vec<String> {
        self.deregistrations.lock().unwrap().clone()
    }

    pub fn set_registry(&self, registry: Value) {
        *self.registry.lock().unwrap() = registry;
    }
}

async fn register(
    State(discovery): State<Arc<Discovery>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    discovery.register_attempts.fetch_add(1, Ordering::SeqCst);

    let fail_after = discovery.register_fail_after.load(Ordering::SeqCst);
    if fail_after > 0 && discovery.registrations.load(Ordering::SeqCst) >= fail_after {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "unavailable"})),
        );
    }

    if body.get("name").is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing name"})),
        );
    }

    let n = discovery.registrations.fetch_add(1, Ordering::SeqCst) + 1;
    (
        StatusCode::OK,
        Json(json!({"serviceId": "svc-1", "instanceId": format!("inst-{n}")})),
    )
}

async fn heartbeat(
    State(discovery): State<Arc<Discovery>>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    let Some(instance_id) = params.get("instanceId").cloned() else {
        return StatusCode::BAD_REQUEST;
    };
    discovery
        .heartbeats
        .lock()
        .unwrap()
        .push(instance_id.clone());

    let delay = discovery.heartbeat_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(time::Duration::from_millis(delay)).await;
    }

    if discovery
        .rejected_instances
        .lock()
        .unwrap()
        .contains(&instance_id)
    {
        StatusCode::UNAUTHORIZED
    } else {
        StatusCode::OK
    }
}

async fn registry(State(discovery): State<Arc<Discovery>>) -> impl IntoResponse {
    discovery.polls.fetch_add(1, Ordering::SeqCst);

    let registrations = discovery.registrations.load(Ordering::SeqCst);
    if registrations < discovery.poll_fail_before.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(Value::Null));
    }

    let registry = discovery.registry.lock().unwrap().clone();
    (StatusCode::OK, Json(registry))
}

async fn deregister(
    State(discovery): State<Arc<Discovery>>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    match params.get("instanceId") {
        Some(instance_id) => {
            discovery
                .deregistrations
                .lock()
                .unwrap()
                .push(instance_id.clone());
            StatusCode::OK
        }
        None => StatusCode::BAD_REQUEST,
    }
}

pub struct ServerHandle {
    pub addr: SocketAddr,
    pub discovery: Arc<Discovery>,
    shutdown: Arc<Notify>,
}

impl ServerHandle {
    pub async fn start() -> ServerHandle {
        let discovery = Arc::new(Discovery::default());
        discovery.set_registry(json!({}));

        let app = Router::new()
            .route("/bitmonx/register", post(register))
            .route("/bitmonx/deregister", delete(deregister))
            .route("/bitmonx/heartbeat", post(heartbeat))
            .route("/bitmonx/registry", get(registry))
            .with_state(discovery.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { notify.notified().await })
                .await
        });

        ServerHandle {
            addr,
            discovery,
            shutdown,
        }
    }

    pub fn client(&self, options: ClientOptions) -> DiscoveryClient {
        let endpoint = DiscoveryEndpoint::new(
            &self.addr.ip().to_string(),
            self.addr.port(),
            Protocol::Http,
            "/bitmonx",
        );
        let transport = Transport::new(
            endpoint,
            RetryPolicy::new(0, time::Duration::from_millis(10)),
            time::Duration::from_secs(5),
        )
        .expect("failed to build transport");

        DiscoveryClient::new(transport, options)
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}

/// Options with short periods, so loops tick several times within a test.
pub fn options(heartbeat_ms: u64, poll_ms: Option<u64>) -> ClientOptions {
    ClientOptions {
        descriptor: ServiceDescriptor {
            name: "orders".to_owned(),
            health_check_url: "/bitmonx/health".to_owned(),
            health_check_interval: time::Duration::from_secs(30),
            timeout: time::Duration::from_secs(5),
            heartbeat_interval: time::Duration::from_millis(heartbeat_ms),
        },
        max_attempts: 3,
        retry_interval: time::Duration::from_millis(20),
        fetch_registry: poll_ms.is_some(),
        fetch_registry_interval: time::Duration::from_millis(poll_ms.unwrap_or(30_000)),
        fetch_registry_filter: "ALL".to_owned(),
    }
}

/// Wait for the first event matching `predicate`, failing the test after two seconds.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<ClientEvent>,
    mut predicate: F,
) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(time::Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}
