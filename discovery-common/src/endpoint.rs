use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use url::Url;

/// Scheme used to reach the discovery server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a supported protocol, expected http or https")]
pub struct ParseProtocolError(String);

impl FromStr for Protocol {
    type Err = ParseProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            invalid => Err(ParseProtocolError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

/// Connection information for the discovery server. Fixed for the lifetime of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Prefix every discovery route is mounted under, e.g. `/bitmonx`.
    pub base_path: String,
}

impl DiscoveryEndpoint {
    pub fn new(host: &str, port: u16, protocol: Protocol, base_path: &str) -> Self {
        Self {
            host: host.to_owned(),
            port,
            protocol,
            base_path: base_path.to_owned(),
        }
    }

    /// Build the full URL of a discovery route, e.g. `http://host:port/bitmonx/heartbeat?...`.
    pub fn url(&self, path: &str, query: &[(String, String)]) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!("{}://{}:{}", self.protocol, self.host, self.port))?;

        let base_path = self.base_path.trim_end_matches('/');
        url.set_path(&format!("{}{}", base_path, path));

        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_protocol() {
        assert_eq!("http".parse::<Protocol>(), Ok(Protocol::Http));
        assert_eq!("HTTPS".parse::<Protocol>(), Ok(Protocol::Https));
        assert!("ftp".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_url_with_base_path_and_query() {
        let endpoint = DiscoveryEndpoint::new("localhost", 5000, Protocol::Http, "/bitmonx/");
        let query = vec![
            ("serviceId".to_owned(), "svc".to_owned()),
            ("instanceId".to_owned(), "inst-1".to_owned()),
        ];

        let url = endpoint
            .url("/heartbeat", &query)
            .expect("failed to build url");

        assert_eq!(
            url.as_str(),
            "http://localhost:5000/bitmonx/heartbeat?serviceId=svc&instanceId=inst-1"
        );
    }

    #[test]
    fn test_url_without_query() {
        let endpoint = DiscoveryEndpoint::new("discovery.local", 443, Protocol::Https, "");

        let url = endpoint.url("/registry", &[]).expect("failed to build url");

        assert_eq!(url.as_str(), "https://discovery.local/registry");
    }
}
