//! Identity of an RPC service (`ServiceMetadata`) and its registered
//! addresses (`Endpoint`).

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::{Error, Result};

/// Identity of an RPC service: `{service_name, namespace, version}`.
///
/// Immutable after construction. Two instances are equal iff their
/// [`ServiceMetadata::unique_key`] matches.
#[derive(Debug, Clone)]
pub struct ServiceMetadata {
    service_name: String,
    namespace: String,
    version: String,
    unique_key: String,
}

impl ServiceMetadata {
    pub fn new(
        namespace: impl Into<String>,
        service_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into();
        let service_name = service_name.into();
        let version = version.into();
        let unique_key = format!("/{namespace}/{service_name}/{version}");
        Self {
            service_name,
            namespace,
            version,
            unique_key,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// `/{namespace}/{service_name}/{version}` — leading slash, no trailing.
    pub fn unique_key(&self) -> &str {
        &self.unique_key
    }

    /// `{unique_key}/{host}:{port}` — the registered-endpoint key format of
    /// spec §6, shared by the KV-lease backend and the Registrar.
    pub fn instance_key(&self, endpoint: &Endpoint) -> String {
        format!("{}/{}", self.unique_key, endpoint.as_str())
    }
}

impl PartialEq for ServiceMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.unique_key == other.unique_key
    }
}
impl Eq for ServiceMetadata {}

impl Hash for ServiceMetadata {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique_key.hash(state);
    }
}

impl fmt::Display for ServiceMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unique_key)
    }
}

/// A `host:port` reachable address of a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(String);

impl Endpoint {
    /// Parses `s` as `host:port`, skipping (returning an error for) anything
    /// that doesn't split cleanly — the same rule the KV-lease backend uses
    /// to silently skip malformed child keys.
    pub fn parse(s: &str) -> Result<Self> {
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self(s.to_string()))
            }
            _ => Err(Error::InvalidEndpoint(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn host(&self) -> &str {
        self.0.rsplit_once(':').expect("validated at parse").0
    }

    pub fn port(&self) -> u16 {
        self.0
            .rsplit_once(':')
            .expect("validated at parse")
            .1
            .parse()
            .expect("validated at parse")
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for Endpoint {
    type Error = Error;
    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = Error;
    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_key_is_deterministic() {
        let md = ServiceMetadata::new("ns", "Echo", "v1");
        assert_eq!(md.unique_key(), "/ns/Echo/v1");
    }

    #[test]
    fn metadata_equality_delegates_to_unique_key() {
        let a = ServiceMetadata::new("ns", "Echo", "v1");
        let b = ServiceMetadata::new("ns", "Echo", "v1");
        assert_eq!(a, b);
    }

    #[test]
    fn endpoint_rejects_unparsable_host_port() {
        assert!(Endpoint::parse("not-an-endpoint").is_err());
        assert!(Endpoint::parse("10.0.0.1").is_err());
        assert!(Endpoint::parse("10.0.0.1:abc").is_err());
    }

    #[test]
    fn endpoint_accepts_host_port() {
        let ep = Endpoint::parse("10.0.0.1:7000").unwrap();
        assert_eq!(ep.host(), "10.0.0.1");
        assert_eq!(ep.port(), 7000);
    }
}
