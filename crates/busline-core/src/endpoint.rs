//! Endpoints, connection strings and credentials.
//!
//! A connection string has the shape
//!
//! ```text
//! Endpoint=sb://<namespace-host>/;SharedAccessKeyName=<name>;SharedAccessKey=<key>;EntityPath=<entity>
//! ```
//!
//! Keys are matched case-insensitively and unknown keys are ignored. The parsed
//! form is combined with an entity name into an immutable [`EndpointDescriptor`].

use crate::error::{Error, Result};
use std::fmt;
use url::Url;

const ENDPOINT_KEY: &str = "endpoint";
const SHARED_ACCESS_KEY_NAME_KEY: &str = "sharedaccesskeyname";
const SHARED_ACCESS_KEY_KEY: &str = "sharedaccesskey";
const SHARED_ACCESS_SIGNATURE_KEY: &str = "sharedaccesssignature";
const ENTITY_PATH_KEY: &str = "entitypath";

/// Credential presented to the transport handshake.
///
/// The client never validates or refreshes credentials itself; it only hands
/// them to the transport.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    SharedAccessKey { key_name: String, key: String },
    SharedAccessSignature(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::SharedAccessKey { key_name, .. } => f
                .debug_struct("SharedAccessKey")
                .field("key_name", key_name)
                .field("key", &"<redacted>")
                .finish(),
            Credential::SharedAccessSignature(_) => {
                f.debug_tuple("SharedAccessSignature").field(&"<redacted>").finish()
            }
        }
    }
}

/// Parsed key/value pairs of a connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStringProperties {
    /// Endpoint normalized to `sb://<host>/`.
    pub endpoint: String,
    /// Host part of the endpoint, used as the namespace name.
    pub namespace: String,
    pub shared_access_key_name: Option<String>,
    pub shared_access_key: Option<String>,
    pub shared_access_signature: Option<String>,
    pub entity_path: Option<String>,
}

impl ConnectionStringProperties {
    pub fn parse(connection_string: &str) -> Result<Self> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut signature = None;
        let mut entity_path = None;

        for segment in connection_string.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }

            // Values (keys, signatures) may themselves contain '='.
            let (name, value) = segment.split_once('=').ok_or_else(|| {
                Error::InvalidConnectionString(format!("segment '{}' is not key=value", segment))
            })?;
            let value = value.trim().to_string();

            match name.trim().to_ascii_lowercase().as_str() {
                ENDPOINT_KEY => endpoint = Some(value),
                SHARED_ACCESS_KEY_NAME_KEY => key_name = Some(value),
                SHARED_ACCESS_KEY_KEY => key = Some(value),
                SHARED_ACCESS_SIGNATURE_KEY => signature = Some(value),
                ENTITY_PATH_KEY => entity_path = Some(value),
                _ => {}
            }
        }

        let endpoint = endpoint
            .ok_or_else(|| Error::InvalidConnectionString("missing Endpoint".to_string()))?;
        let namespace = namespace_host(&endpoint)?;

        if key_name.is_some() != key.is_some() {
            return Err(Error::InvalidConnectionString(
                "SharedAccessKeyName and SharedAccessKey must be given together".to_string(),
            ));
        }

        Ok(Self {
            endpoint: format!("sb://{}/", namespace),
            namespace,
            shared_access_key_name: key_name,
            shared_access_key: key,
            shared_access_signature: signature,
            entity_path: entity_path.filter(|p| !p.is_empty()),
        })
    }

    /// Credential embedded in the connection string, if any.
    pub fn credential(&self) -> Option<Credential> {
        if let Some(signature) = &self.shared_access_signature {
            return Some(Credential::SharedAccessSignature(signature.clone()));
        }
        match (&self.shared_access_key_name, &self.shared_access_key) {
            (Some(key_name), Some(key)) => Some(Credential::SharedAccessKey {
                key_name: key_name.clone(),
                key: key.clone(),
            }),
            _ => None,
        }
    }
}

/// Where a client points: namespace endpoint, entity and optional session.
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    endpoint: String,
    namespace: String,
    entity_name: String,
    session_id: Option<String>,
}

impl EndpointDescriptor {
    /// Build a descriptor from an endpoint URI (or bare host) and an entity name.
    pub fn new(endpoint: &str, entity_name: impl Into<String>) -> Result<Self> {
        let entity_name = entity_name.into();
        if entity_name.trim().is_empty() {
            return Err(Error::InvalidArgument("entity name must not be empty".to_string()));
        }
        let namespace = namespace_host(endpoint)?;
        Ok(Self {
            endpoint: format!("sb://{}/", namespace),
            namespace,
            entity_name,
            session_id: None,
        })
    }

    /// Build a descriptor from a connection string.
    ///
    /// `entity_name` may be omitted when the connection string carries an
    /// `EntityPath`; when both are given they must agree.
    pub fn from_connection_string(
        connection_string: &str,
        entity_name: Option<&str>,
    ) -> Result<(Self, ConnectionStringProperties)> {
        let properties = ConnectionStringProperties::parse(connection_string)?;

        let entity = match (entity_name, properties.entity_path.as_deref()) {
            (Some(explicit), Some(path)) if explicit != path => {
                return Err(Error::InvalidConnectionString(format!(
                    "EntityPath '{}' conflicts with entity name '{}'",
                    path, explicit
                )))
            }
            (Some(explicit), _) => explicit.to_string(),
            (None, Some(path)) => path.to_string(),
            (None, None) => {
                return Err(Error::InvalidConnectionString(
                    "no entity name and no EntityPath".to_string(),
                ))
            }
        };

        let descriptor = Self::new(&properties.endpoint, entity)?;
        Ok((descriptor, properties))
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

/// Extract the host from `scheme://[userinfo@]host[:port]/path` or a bare host.
fn namespace_host(endpoint: &str) -> Result<String> {
    let trimmed = endpoint.trim();
    let parsed = if trimmed.contains("://") {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("sb://{}", trimmed))
    }
    .map_err(|e| Error::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;

    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(host.to_ascii_lowercase()),
        _ => Err(Error::InvalidEndpoint(endpoint.to_string())),
    }
}
