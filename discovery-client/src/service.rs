use std::time;

use discovery_common::transport::RequestSpec;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Static metadata about the local service, sent to the discovery server on registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub health_check_url: String,
    pub health_check_interval: time::Duration,
    pub timeout: time::Duration,
    pub heartbeat_interval: time::Duration,
}

impl ServiceDescriptor {
    /// The registration body. Durations are sent in milliseconds.
    pub fn to_registration_body(&self) -> Value {
        json!({
            "name": self.name,
            "health_check_url": self.health_check_url,
            "health_check_interval": self.health_check_interval.as_millis() as u64,
            "timeout": self.timeout.as_millis() as u64,
            "heartbeat": {
                "interval": self.heartbeat_interval.as_millis() as u64,
            },
        })
    }
}

/// The ids the discovery server assigned to this instance when it registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "serviceId")]
    pub service_id: String,
    #[serde(rename = "instanceId")]
    pub instance_id: String,
}

impl Identity {
    pub fn new(service_id: &str, instance_id: &str) -> Self {
        Self {
            service_id: service_id.to_owned(),
            instance_id: instance_id.to_owned(),
        }
    }

    /// Add the query parameters identifying this instance on heartbeat and deregister calls.
    pub fn tag(&self, spec: RequestSpec) -> RequestSpec {
        spec.query("serviceId", &self.service_id)
            .query("instanceId", &self.instance_id)
    }
}
