//! Endpoints and remote references

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use super::{DgcError, ObjectId};

/// Identity of the socket factory used to reach an endpoint.
///
/// Two endpoints with the same address but different factories are
/// reached over differently-constructed sockets and are tracked apart by
/// the client ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FactoryId(pub u64);

/// Network endpoint of an exporting process
///
/// Equality and hashing consider host and port only; the factory is
/// compared by [`RemoteRef::deep_eq`] and by the client ledger key.
#[derive(Clone)]
pub struct Endpoint {
    host: Arc<str>,
    port: u16,
    factory: Option<FactoryId>,
}

impl Endpoint {
    /// Create an endpoint reached with the default socket factory
    pub fn new(host: impl Into<Arc<str>>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            factory: None,
        }
    }

    /// Use a specific socket factory for this endpoint
    pub fn with_factory(mut self, factory: FactoryId) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Host name or address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Socket factory identity, if any
    pub fn factory(&self) -> Option<FactoryId> {
        self.factory
    }

    /// `host:port`, suitable for `tokio::net::lookup_host`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port && self.host == other.host
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.factory {
            Some(factory) => write!(f, "Endpoint({}:{}, csf={})", self.host, self.port, factory.0),
            None => write!(f, "Endpoint({}:{})", self.host, self.port),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = DgcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| DgcError::Config(format!("endpoint '{}' is missing a port", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| DgcError::Config(format!("endpoint '{}': {}", s, e)))?;
        if host.is_empty() {
            return Err(DgcError::Config(format!("endpoint '{}' is missing a host", s)));
        }
        Ok(Self::new(host, port))
    }
}

/// Reference to a specific remote object at a specific endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteRef {
    /// Object identifier within the exporting process
    pub id: ObjectId,
    /// Endpoint the object is exported on
    pub endpoint: Endpoint,
    /// Whether the object lives in this process
    pub is_local: bool,
}

impl RemoteRef {
    /// Create a reference to an object in another process
    pub fn new(id: ObjectId, endpoint: Endpoint) -> Self {
        Self {
            id,
            endpoint,
            is_local: false,
        }
    }

    /// Create a reference to an object exported by this process
    pub fn local(id: ObjectId, endpoint: Endpoint) -> Self {
        Self {
            id,
            endpoint,
            is_local: true,
        }
    }

    /// Stricter equality that also compares socket factory identity
    pub fn deep_eq(&self, other: &Self) -> bool {
        self == other && self.endpoint.factory == other.endpoint.factory
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}@{}{}]", self.id, self.endpoint, if self.is_local { " local" } else { "" })
    }
}
