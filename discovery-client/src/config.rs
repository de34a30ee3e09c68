use std::str::FromStr;
use std::time;

use discovery_common::endpoint::{DiscoveryEndpoint, Protocol};
use discovery_common::retry::RetryPolicy;
use envconfig::Envconfig;

use crate::service::ServiceDescriptor;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub discovery: DiscoveryConfig,

    #[envconfig(nested = true)]
    pub service: ServiceConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct DiscoveryConfig {
    #[envconfig(from = "DISCOVERY_SERVER_HOST", default = "localhost")]
    pub server_host: String,

    #[envconfig(from = "DISCOVERY_SERVER_PORT", default = "5000")]
    pub server_port: u16,

    #[envconfig(from = "DISCOVERY_SERVER_PROTOCOL", default = "http")]
    pub server_protocol: Protocol,

    #[envconfig(from = "DISCOVERY_SERVER_BASE_PATH", default = "/bitmonx")]
    pub server_base_path: String,

    #[envconfig(from = "DISCOVERY_MAX_ATTEMPTS", default = "10")]
    pub max_attempts: u32,

    #[envconfig(from = "DISCOVERY_RETRY_INTERVAL_MS", default = "1000")]
    pub retry_interval: EnvMsDuration,

    #[envconfig(from = "DISCOVERY_FETCH_REGISTRY", default = "true")]
    pub fetch_registry: bool,

    #[envconfig(from = "DISCOVERY_FETCH_REGISTRY_INTERVAL_MS", default = "30000")]
    pub fetch_registry_interval: EnvMsDuration,

    #[envconfig(from = "DISCOVERY_FETCH_REGISTRY_FILTER", default = "ALL")]
    pub fetch_registry_filter: NonEmptyString,
}

impl DiscoveryConfig {
    pub fn endpoint(&self) -> DiscoveryEndpoint {
        DiscoveryEndpoint::new(
            &self.server_host,
            self.server_port,
            self.server_protocol,
            &self.server_base_path,
        )
    }

    /// The policy for individual requests. Registration reuses `max_attempts` and
    /// `retry_interval` for its own outer loop, with a fixed interval.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.retry_interval.0)
    }
}

#[derive(Envconfig, Clone)]
pub struct ServiceConfig {
    #[envconfig(from = "SERVICE_NAME", default = "service")]
    pub name: NonEmptyString,

    #[envconfig(from = "SERVICE_HEALTH_CHECK_URL", default = "/bitmonx/health")]
    pub health_check_url: String,

    #[envconfig(from = "SERVICE_HEALTH_CHECK_INTERVAL_MS", default = "30000")]
    pub health_check_interval: EnvMsDuration,

    #[envconfig(from = "SERVICE_TIMEOUT_MS", default = "30000")]
    pub timeout: EnvMsDuration,

    #[envconfig(from = "SERVICE_HEARTBEAT_INTERVAL_MS", default = "30000")]
    pub heartbeat_interval: EnvMsDuration,
}

impl ServiceConfig {
    pub fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            name: self.name.as_str().to_owned(),
            health_check_url: self.health_check_url.clone(),
            health_check_interval: self.health_check_interval.0,
            timeout: self.timeout.0,
            heartbeat_interval: self.heartbeat_interval.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
