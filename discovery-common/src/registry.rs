use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One service instance as reported by the discovery server.
/// Only the instance id is interpreted; everything else is kept as sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Local copy of the discovery server's registry: service name to known instances.
/// A poll replaces the whole cache, entries are never merged across polls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistryCache {
    services: HashMap<String, Vec<InstanceRecord>>,
}

impl RegistryCache {
    pub fn new(services: HashMap<String, Vec<InstanceRecord>>) -> Self {
        Self { services }
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Instances registered under `service`, empty if the service is unknown.
    pub fn instances(&self, service: &str) -> &[InstanceRecord] {
        self.services
            .get(service)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Look an instance up by its id across all services.
    pub fn find_instance(&self, instance_id: &str) -> Option<&InstanceRecord> {
        self.services
            .values()
            .flatten()
            .find(|instance| instance.instance_id == instance_id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_deserialize_registry_snapshot() {
        let payload = json!({
            "orders": [
                {"instanceId": "orders-1", "host": "10.0.0.1", "port": 8080},
                {"instanceId": "orders-2", "host": "10.0.0.2", "port": 8080}
            ],
            "billing": [
                {"instanceId": "billing-1"}
            ]
        });

        let cache: RegistryCache = serde_json::from_value(payload).expect("failed to parse");

        assert_eq!(cache.instances("orders").len(), 2);
        assert_eq!(cache.instances("billing").len(), 1);
        assert!(cache.instances("shipping").is_empty());

        let instance = cache.find_instance("orders-2").expect("instance not found");
        assert_eq!(instance.attributes.get("host"), Some(&json!("10.0.0.2")));
        assert!(cache.find_instance("missing").is_none());
    }

    #[test]
    fn test_serialize_round_trips_attributes() {
        let payload = json!({"orders": [{"instanceId": "orders-1", "zone": "eu"}]});

        let cache: RegistryCache = serde_json::from_value(payload.clone()).unwrap();

        assert_eq!(serde_json::to_value(&cache).unwrap(), payload);
    }
}
