use std::sync::Arc;
use std::time::Duration;

use http::{header, HeaderMap, HeaderValue, Method};
use tracing::debug;

use self::headers::*;
use crate::options::{AllowedOrigins, Options};

pub(crate) mod headers {
    pub(crate) use http::header::ACCESS_CONTROL_ALLOW_CREDENTIALS as ALLOW_CREDENTIALS;
    pub(crate) use http::header::ACCESS_CONTROL_ALLOW_HEADERS as ALLOW_HEADERS;
    pub(crate) use http::header::ACCESS_CONTROL_ALLOW_METHODS as ALLOW_METHODS;
    pub(crate) use http::header::ACCESS_CONTROL_ALLOW_ORIGIN as ALLOW_ORIGIN;
    pub(crate) use http::header::ACCESS_CONTROL_MAX_AGE as MAX_AGE;
    pub(crate) use http::header::ACCESS_CONTROL_REQUEST_HEADERS as REQUEST_HEADERS;
    pub(crate) use http::header::ACCESS_CONTROL_REQUEST_METHOD as REQUEST_METHOD;
    pub(crate) use http::header::ORIGIN;
}

const ALLOWED_METHODS: &[Method; 2] = &[Method::POST, Method::OPTIONS];

// Ten minutes, so browsers don't re-issue a preflight for every call
// (Chromium caps lower, but asking costs nothing).
const MAX_AGE_SECS: Duration = Duration::from_secs(600);

/// Answers grpc-web CORS preflights and decorates actual responses.
///
/// Credentials are always allowed, which is why permitted origins are echoed
/// back instead of a wildcard. `access-control-expose-headers` is never set:
/// the response interceptor rewrites responses and must not be constrained
/// by an exposure list.
#[derive(Debug, Clone)]
pub(crate) struct Cors {
    cache: Arc<Cache>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Error {
    OriginNotAllowed,
    MethodNotAllowed,
    HeaderNotAllowed,
}

#[derive(Debug)]
struct Cache {
    allowed_origins: AllowedOrigins,
    // joined allow-list for the preflight response
    allow_headers: HeaderValue,
    // lowercase names for validating access-control-request-headers
    allowed_header_names: Vec<String>,
    allow_methods: HeaderValue,
    allow_credentials: HeaderValue,
    max_age: HeaderValue,
}

impl Cors {
    pub(crate) fn new(options: &Options) -> Cors {
        let allowed = options.all_allowed_request_headers();

        let allow_headers = join_header_value(&allowed).expect("header names are valid values");
        let allowed_header_names = allowed.iter().map(|name| name.as_str().to_owned()).collect();

        let cache = Arc::new(Cache {
            allowed_origins: options.allowed_origins.clone(),
            allow_headers,
            allowed_header_names,
            allow_methods: HeaderValue::from_static("POST,OPTIONS"),
            allow_credentials: HeaderValue::from_static("true"),
            max_age: HeaderValue::from(MAX_AGE_SECS.as_secs()),
        });

        Cors { cache }
    }

    /// Validates a preflight and produces its response headers. The wrapped
    /// service is never involved.
    pub(crate) fn preflight(&self, req_headers: &HeaderMap) -> Result<HeaderMap, Error> {
        let origin = match req_headers.get(ORIGIN) {
            Some(origin) if self.is_origin_allowed(origin) => origin,
            _ => return Err(Error::OriginNotAllowed),
        };

        if !self.is_method_allowed(req_headers.get(REQUEST_METHOD)) {
            return Err(Error::MethodNotAllowed);
        }

        self.check_request_headers(req_headers)?;

        let mut headers = self.common_headers(origin.clone());
        headers.insert(ALLOW_METHODS, self.cache.allow_methods.clone());
        headers.insert(ALLOW_HEADERS, self.cache.allow_headers.clone());
        headers.insert(MAX_AGE, self.cache.max_age.clone());

        Ok(headers)
    }

    /// CORS headers for an actual grpc-web request. A missing `origin` means
    /// a same-origin caller and gets no headers at all.
    pub(crate) fn simple(&self, req_headers: &HeaderMap) -> Result<HeaderMap, Error> {
        match req_headers.get(header::ORIGIN) {
            Some(origin) if self.is_origin_allowed(origin) => {
                Ok(self.common_headers(origin.clone()))
            }
            Some(_) => Err(Error::OriginNotAllowed),
            None => Ok(HeaderMap::new()),
        }
    }

    fn common_headers(&self, origin: HeaderValue) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ALLOW_ORIGIN, origin);
        headers.insert(ALLOW_CREDENTIALS, self.cache.allow_credentials.clone());
        headers
    }

    fn is_origin_allowed(&self, origin: &HeaderValue) -> bool {
        self.cache.allowed_origins.is_allowed(origin)
    }

    fn is_method_allowed(&self, header: Option<&HeaderValue>) -> bool {
        match header {
            Some(value) => match Method::from_bytes(value.as_bytes()) {
                Ok(method) => ALLOWED_METHODS.contains(&method),
                Err(_) => {
                    debug!("access-control-request-method {:?} is not valid", value);
                    false
                }
            },
            None => {
                debug!("access-control-request-method is missing");
                false
            }
        }
    }

    fn check_request_headers(&self, req_headers: &HeaderMap) -> Result<(), Error> {
        for value in req_headers.get_all(REQUEST_HEADERS) {
            let list = value.to_str().map_err(|_| Error::HeaderNotAllowed)?;

            for name in list.split(',') {
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }

                let allowed = self
                    .cache
                    .allowed_header_names
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(name));

                if !allowed {
                    debug!(header = %name, "request header not allowed");
                    return Err(Error::HeaderNotAllowed);
                }
            }
        }

        Ok(())
    }
}

fn join_header_value<I>(values: I) -> Result<HeaderValue, header::InvalidHeaderValue>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut values = values.into_iter();
    let mut value = Vec::new();

    if let Some(v) = values.next() {
        value.extend(v.as_ref().as_bytes());
    }
    for v in values {
        value.push(b',');
        value.extend(v.as_ref().as_bytes());
    }
    HeaderValue::from_bytes(&value)
}
