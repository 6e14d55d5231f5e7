//! Proxy-list source types and related implementations.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

/// An identifier for proxy-list sources.
///
/// This is essentially a newtype for a string.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct SourceId(pub(crate) String);

impl SourceId {
    /// Creates a new [`SourceId`].
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deref the [`SourceId`] to a `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for an external proxy-list source.
///
/// Sources provide the ability to discover candidate proxy addresses.
/// The two shapes in the wild are JSON APIs returning an array of
/// `{ip, port}` records, and plain-text lists with one `ip:port` per line.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxySourceConfig {
    /// A JSON API returning candidate records under a configurable key.
    Json(Arc<JsonSourceConfig>),
    /// A plain-text endpoint with one `ip:port` address per line.
    Plain(Arc<PlainSourceConfig>),
}

impl ProxySourceConfig {
    /// The unique identifier of this source.
    pub fn id(&self) -> &SourceId {
        match self {
            Self::Json(x) => &x.id,
            Self::Plain(x) => &x.id,
        }
    }

    /// Name of this source type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Json(..) => "json",
            Self::Plain(..) => "plain",
        }
    }

    /// The URL the candidate list is fetched from.
    pub fn url(&self) -> &Url {
        match self {
            Self::Json(x) => &x.url,
            Self::Plain(x) => &x.url,
        }
    }
}

/// Configuration for a JSON proxy-list API.
///
/// The response is expected to be an object with an array of candidate
/// records under `list_key`, each record carrying the address under
/// `ip_key`/`port_key`. The key names default to the most common API
/// shape (`proxies`, `ip`, `port`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JsonSourceConfig {
    /// Unique source identifier.
    pub id: SourceId,

    /// URL of the JSON endpoint.
    pub url: Url,

    /// Key of the array of candidate records in the response object.
    #[serde(default = "default_list_key")]
    pub list_key: String,

    /// Key of the IP address within a candidate record.
    #[serde(default = "default_ip_key")]
    pub ip_key: String,

    /// Key of the port within a candidate record.
    ///
    /// The value may be either a string or a number.
    #[serde(default = "default_port_key")]
    pub port_key: String,
}

fn default_list_key() -> String {
    "proxies".into()
}

fn default_ip_key() -> String {
    "ip".into()
}

fn default_port_key() -> String {
    "port".into()
}

/// Configuration for a plain-text proxy list.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PlainSourceConfig {
    /// Unique source identifier.
    pub id: SourceId,

    /// URL of the plain-text list.
    pub url: Url,
}
