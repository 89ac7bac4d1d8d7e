use std::collections::BTreeSet;
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;

use http::{header::HeaderName, HeaderMap, HeaderValue};

/// Headers grpc-web clients may always send, on top of whatever the caller
/// allows.
pub(crate) const INTERNAL_REQUEST_HEADERS_WHITELIST: &[&str] = &[
    // gRPC-Web user-agent indicator
    "u-a",
];

pub(crate) const STANDARD_REQUEST_HEADERS: &[&str] =
    &["x-grpc-web", "content-type", "x-user-agent", "grpc-timeout"];

pub(crate) type OriginPredicate = dyn Fn(&str) -> bool + Send + Sync;
pub(crate) type EndpointsFn = dyn Fn() -> Vec<String> + Send + Sync;
pub(crate) type WebsocketOriginFn = dyn Fn(&HeaderMap) -> bool + Send + Sync;

/// Which `Origin` values are admitted by the CORS gate.
///
/// Since the bridge always allows credentials it never answers with a
/// wildcard; permitted origins are echoed back verbatim.
#[derive(Clone)]
pub enum AllowedOrigins {
    /// Admit every origin.
    Any,
    /// Admit exactly this set of origins.
    #[allow(clippy::mutable_key_type)]
    Only(BTreeSet<HeaderValue>),
    /// Admit origins for which the predicate returns `true`.
    Predicate(Arc<OriginPredicate>),
}

impl AllowedOrigins {
    pub(crate) fn is_allowed(&self, origin: &HeaderValue) -> bool {
        match self {
            AllowedOrigins::Any => true,
            AllowedOrigins::Only(origins) => origins.contains(origin),
            AllowedOrigins::Predicate(f) => origin.to_str().map(|o| f(o)).unwrap_or(false),
        }
    }
}

impl fmt::Debug for AllowedOrigins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllowedOrigins::Any => f.write_str("Any"),
            AllowedOrigins::Only(origins) => f.debug_tuple("Only").field(origins).finish(),
            AllowedOrigins::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

/// Configuration for the bridge.
///
/// The defaults mirror a locked-down deployment: no cross-origin callers
/// (same-origin requests need no CORS), preflights only for registered
/// endpoints, no WebSocket transport. Every knob is opt-in.
#[derive(Clone)]
pub struct Options {
    pub(crate) allowed_origins: AllowedOrigins,
    pub(crate) allowed_request_headers: Vec<HeaderName>,
    pub(crate) cors_for_registered_endpoints_only: bool,
    pub(crate) endpoints_fn: Option<Arc<EndpointsFn>>,
    pub(crate) allow_non_root_resources: bool,
    pub(crate) enable_websockets: bool,
    pub(crate) websocket_origin_fn: Option<Arc<WebsocketOriginFn>>,
}

impl Options {
    pub fn new() -> Options {
        Options {
            allowed_origins: AllowedOrigins::Only(BTreeSet::new()),
            allowed_request_headers: Vec::new(),
            cors_for_registered_endpoints_only: true,
            endpoints_fn: None,
            allow_non_root_resources: false,
            enable_websockets: false,
            websocket_origin_fn: None,
        }
    }

    /// Admit any origin.
    pub fn allow_all_origins(self) -> Options {
        Options {
            allowed_origins: AllowedOrigins::Any,
            ..self
        }
    }

    /// Admit only the given set of origins.
    ///
    /// ## Example
    ///
    /// ```
    /// grpcweb_bridge::Options::new().allow_origins(vec!["https://app.example"]);
    /// ```
    pub fn allow_origins<I>(self, origins: I) -> Options
    where
        I: IntoIterator,
        HeaderValue: TryFrom<I::Item>,
    {
        #[allow(clippy::mutable_key_type)]
        let origins = origins
            .into_iter()
            .map(|v| match TryFrom::try_from(v) {
                Ok(origin) => origin,
                Err(_) => panic!("invalid origin"),
            })
            .collect();

        Options {
            allowed_origins: AllowedOrigins::Only(origins),
            ..self
        }
    }

    /// Admit origins for which `predicate` returns `true`.
    pub fn origin_fn<F>(self, predicate: F) -> Options
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Options {
            allowed_origins: AllowedOrigins::Predicate(Arc::new(predicate)),
            ..self
        }
    }

    /// Additional request headers clients may send, on top of the standard
    /// grpc-web set.
    pub fn allowed_request_headers<I>(mut self, headers: I) -> Options
    where
        I: IntoIterator,
        HeaderName: TryFrom<I::Item>,
    {
        let iter = headers
            .into_iter()
            .map(|header| match TryFrom::try_from(header) {
                Ok(header) => header,
                Err(_) => panic!("invalid header"),
            });

        self.allowed_request_headers.extend(iter);
        self
    }

    /// When `true` (the default), CORS preflights are answered only for
    /// endpoints reported by [`Options::endpoints_fn`]. Without an endpoints
    /// source this rejects every preflight.
    pub fn cors_for_registered_endpoints_only(self, only: bool) -> Options {
        Options {
            cors_for_registered_endpoints_only: only,
            ..self
        }
    }

    /// Supplies the set of registered `/<service>/<method>` endpoint paths.
    ///
    /// The function is consulted per preflight; the bridge does not cache
    /// its result.
    pub fn endpoints_fn<F>(self, f: F) -> Options
    where
        F: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        Options {
            endpoints_fn: Some(Arc::new(f)),
            ..self
        }
    }

    /// When `true`, the gRPC endpoint is extracted from the tail of the URL
    /// (the last `/package.Service/Method` segment pair), allowing the
    /// bridge to be mounted under a path prefix.
    pub fn allow_non_root_resources(self, allow: bool) -> Options {
        Options {
            allow_non_root_resources: allow,
            ..self
        }
    }

    /// Enables the WebSocket transport for bidirectional streaming RPCs.
    pub fn enable_websockets(self, enable: bool) -> Options {
        Options {
            enable_websockets: enable,
            ..self
        }
    }

    /// Origin check applied to WebSocket upgrades. The default accepts a
    /// request iff its `Origin` authority equals its `Host` header.
    pub fn websocket_origin_fn<F>(self, predicate: F) -> Options
    where
        F: Fn(&HeaderMap) -> bool + Send + Sync + 'static,
    {
        Options {
            websocket_origin_fn: Some(Arc::new(predicate)),
            ..self
        }
    }

    /// The full allow-list answered on preflights: caller-supplied headers,
    /// the internal whitelist and the standard grpc-web set.
    pub(crate) fn all_allowed_request_headers(&self) -> Vec<HeaderName> {
        let mut headers = self.allowed_request_headers.clone();
        headers.extend(
            INTERNAL_REQUEST_HEADERS_WHITELIST
                .iter()
                .chain(STANDARD_REQUEST_HEADERS)
                .copied()
                .map(HeaderName::from_static),
        );
        headers
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::new()
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("allowed_origins", &self.allowed_origins)
            .field("allowed_request_headers", &self.allowed_request_headers)
            .field(
                "cors_for_registered_endpoints_only",
                &self.cors_for_registered_endpoints_only,
            )
            .field("allow_non_root_resources", &self.allow_non_root_resources)
            .field("enable_websockets", &self.enable_websockets)
            .finish()
    }
}
