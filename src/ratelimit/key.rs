//! Partition key extraction.
//!
//! A key extractor maps a request to the string that scopes its budget.
//! Extraction is pure: identical request attributes always yield the same key.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use http::{Extensions, HeaderMap, Request, Uri};
use serde::{Deserialize, Serialize};

/// Key used when every request shares one bucket.
pub const GLOBAL_KEY: &str = "global";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// The connection's peer address, inserted into request extensions by the
/// server accepting the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// The caller identity established by an upstream authentication step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedClient(pub String);

/// Borrowed view of the request attributes a key extractor may read.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    uri: &'a Uri,
    headers: &'a HeaderMap,
    extensions: &'a Extensions,
}

impl<'a> RequestView<'a> {
    /// Build a view from its parts.
    pub fn new(uri: &'a Uri, headers: &'a HeaderMap, extensions: &'a Extensions) -> Self {
        Self {
            uri,
            headers,
            extensions,
        }
    }

    /// The request path, without the query string.
    pub fn path(&self) -> &'a str {
        self.uri.path()
    }

    /// A header value, lossily decoded as UTF-8. Empty if absent.
    pub fn header(&self, name: &str) -> String {
        self.headers
            .get(name)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .unwrap_or_default()
    }

    /// A typed request extension.
    pub fn extension<T: Send + Sync + 'static>(&self) -> Option<&'a T> {
        self.extensions.get::<T>()
    }

    /// The client address, preferring proxy headers over the peer address.
    ///
    /// Forwarded headers are client-controlled; behind an untrusted proxy a
    /// client can choose its own key.
    pub fn client_addr(&self) -> String {
        let forwarded = self
            .headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let Some(addr) = forwarded {
            return addr.to_string();
        }

        let real_ip = self
            .headers
            .get(X_REAL_IP)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let Some(addr) = real_ip {
            return addr.to_string();
        }

        self.extension::<ClientAddr>()
            .map(|ClientAddr(addr)| addr.ip().to_string())
            .unwrap_or_default()
    }
}

impl<'a, B> From<&'a Request<B>> for RequestView<'a> {
    fn from(req: &'a Request<B>) -> Self {
        Self::new(req.uri(), req.headers(), req.extensions())
    }
}

/// A caller-supplied key function.
pub type KeyFn = Arc<dyn Fn(&RequestView<'_>) -> String + Send + Sync>;

/// Strategy for deriving a partition key from a request.
///
/// In configuration a strategy is written as a string: `global`,
/// `client_addr`, `path`, `client_addr_and_path`, `authenticated_client` or
/// `header:<name>`.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeyExtractor {
    /// One bucket for all traffic
    #[default]
    Global,
    /// Per client address
    ClientAddr,
    /// Per request path, shared by all clients
    Path,
    /// Per client address and path
    ClientAddrAndPath,
    /// Per authenticated identity; empty if authentication has not run
    AuthenticatedClient,
    /// The named header's value verbatim; empty if absent
    Header(String),
    /// Caller-supplied function; not expressible in configuration
    Custom(KeyFn),
}

const HEADER_PREFIX: &str = "header:";

impl TryFrom<String> for KeyExtractor {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.trim() {
            "global" => Ok(KeyExtractor::Global),
            "client_addr" => Ok(KeyExtractor::ClientAddr),
            "path" => Ok(KeyExtractor::Path),
            "client_addr_and_path" => Ok(KeyExtractor::ClientAddrAndPath),
            "authenticated_client" => Ok(KeyExtractor::AuthenticatedClient),
            other => match other.strip_prefix(HEADER_PREFIX).map(str::trim) {
                Some(name) if !name.is_empty() => Ok(KeyExtractor::Header(name.to_string())),
                _ => Err(format!("unknown key strategy: {:?}", other)),
            },
        }
    }
}

impl From<KeyExtractor> for String {
    fn from(extractor: KeyExtractor) -> Self {
        match extractor {
            KeyExtractor::Global => "global".to_string(),
            KeyExtractor::ClientAddr => "client_addr".to_string(),
            KeyExtractor::Path => "path".to_string(),
            KeyExtractor::ClientAddrAndPath => "client_addr_and_path".to_string(),
            KeyExtractor::AuthenticatedClient => "authenticated_client".to_string(),
            KeyExtractor::Header(name) => format!("{}{}", HEADER_PREFIX, name),
            KeyExtractor::Custom(_) => "custom".to_string(),
        }
    }
}

impl KeyExtractor {
    /// Wrap a closure as a key extractor.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&RequestView<'_>) -> String + Send + Sync + 'static,
    {
        KeyExtractor::Custom(Arc::new(f))
    }

    /// Derive the partition key for a request.
    pub fn extract<B>(&self, req: &Request<B>) -> String {
        self.extract_view(&RequestView::from(req))
    }

    /// Derive the partition key from a request view.
    pub fn extract_view(&self, view: &RequestView<'_>) -> String {
        match self {
            KeyExtractor::Global => GLOBAL_KEY.to_string(),
            KeyExtractor::ClientAddr => view.client_addr(),
            KeyExtractor::Path => view.path().to_string(),
            KeyExtractor::ClientAddrAndPath => {
                format!("{}:{}", view.client_addr(), view.path())
            }
            KeyExtractor::AuthenticatedClient => view
                .extension::<AuthenticatedClient>()
                .map(|AuthenticatedClient(id)| id.clone())
                .unwrap_or_default(),
            KeyExtractor::Header(name) => view.header(name),
            KeyExtractor::Custom(f) => f(view),
        }
    }
}

impl fmt::Debug for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyExtractor::Global => write!(f, "Global"),
            KeyExtractor::ClientAddr => write!(f, "ClientAddr"),
            KeyExtractor::Path => write!(f, "Path"),
            KeyExtractor::ClientAddrAndPath => write!(f, "ClientAddrAndPath"),
            KeyExtractor::AuthenticatedClient => write!(f, "AuthenticatedClient"),
            KeyExtractor::Header(name) => f.debug_tuple("Header").field(name).finish(),
            KeyExtractor::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}
