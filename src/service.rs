use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Version};
use http_body::Body;
use tonic::body::{empty_body, BoxBody};
use tonic::server::NamedService;
use tonic::Code;
use tower_service::Service;
use tracing::{debug, trace};

use crate::call::content_types::{coerce_content_type, is_grpc_web};
use crate::call::{Encoding, GrpcWebCall};
use crate::cors::Cors;
use crate::options::Options;
use crate::{box_body, websocket, BoxError};

const GRPC_STATUS: &str = "grpc-status";
const GRPC_MESSAGE: &str = "grpc-message";

type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

/// Service wrapping a gRPC handler with grpc-web compatibility.
///
/// Incoming grpc-web requests are rewritten into the native gRPC form and
/// handed to the wrapped service; its responses are rewritten back, with the
/// gRPC status re-encoded as a trailing in-body frame. CORS preflights for
/// grpc-web calls are answered directly, WebSocket upgrades are tunnelled
/// when enabled, and all other traffic passes through untouched.
#[derive(Debug, Clone)]
pub struct GrpcWebBridge<S> {
    inner: S,
    options: Options,
    cors: Cors,
}

impl<S> GrpcWebBridge<S> {
    /// Wrap `inner` with the default, locked-down [`Options`].
    pub fn new(inner: S) -> Self {
        Self::with_options(inner, Options::new())
    }

    pub fn with_options(inner: S, options: Options) -> Self {
        let cors = Cors::new(&options);
        GrpcWebBridge {
            inner,
            options,
            cors,
        }
    }

    /// True iff `req` carries grpc-web framing: a POST whose content-type
    /// starts with `application/grpc-web`.
    pub fn is_grpc_web_request<B>(&self, req: &Request<B>) -> bool {
        req.method() == Method::POST && is_grpc_web(req.headers())
    }

    /// True iff `req` is a CORS preflight for a grpc-web call that this
    /// bridge is willing to answer.
    pub fn is_acceptable_grpc_cors_preflight<B>(&self, req: &Request<B>) -> bool {
        if req.method() != Method::OPTIONS || !requests_grpc_web_header(req.headers()) {
            return false;
        }

        if self.options.cors_for_registered_endpoints_only {
            return self.is_registered_endpoint(req);
        }

        true
    }

    /// True iff `req` is a WebSocket upgrade advertising the grpc-web
    /// sub-protocol.
    pub fn is_grpc_websocket_request<B>(&self, req: &Request<B>) -> bool {
        websocket::is_grpc_websocket_request(req)
    }

    fn endpoint<'a, B>(&self, req: &'a Request<B>) -> &'a str {
        let path = req.uri().path();
        if self.options.allow_non_root_resources {
            grpc_endpoint(path)
        } else {
            path
        }
    }

    fn is_registered_endpoint<B>(&self, req: &Request<B>) -> bool {
        let endpoints = match &self.options.endpoints_fn {
            Some(f) => f(),
            None => return false,
        };

        let requested = self.endpoint(req);
        endpoints.iter().any(|endpoint| endpoint == requested)
    }
}

impl<S, ReqBody> Service<Request<ReqBody>> for GrpcWebBridge<S>
where
    S: Service<Request<BoxBody>, Response = Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + Send + 'static,
    ReqBody: Body<Data = Bytes> + Send + 'static,
    ReqBody::Error: Into<BoxError>,
{
    type Response = Response<BoxBody>;
    type Error = S::Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if self.options.enable_websockets && self.is_grpc_websocket_request(&req) {
            trace!(kind = "websocket", path = ?req.uri().path());

            let inner = self.inner.clone();
            let options = self.options.clone();
            let endpoint = self.endpoint(&req).to_owned();

            return Box::pin(async move {
                Ok(websocket::serve(inner, options, endpoint, req).await)
            });
        }

        if self.is_acceptable_grpc_cors_preflight(&req) {
            trace!(kind = "preflight", path = ?req.uri().path());

            let res = match self.cors.preflight(req.headers()) {
                Ok(headers) => {
                    let mut res = immediate_response(StatusCode::NO_CONTENT);
                    res.headers_mut().extend(headers);
                    res
                }
                Err(err) => {
                    debug!(kind = "preflight", ?err);
                    immediate_response(StatusCode::FORBIDDEN)
                }
            };

            return Box::pin(async move { Ok(res) });
        }

        if self.is_grpc_web_request(&req) {
            let encoding = Encoding::from_content_type(req.headers());
            trace!(kind = "grpc-web", path = ?req.uri().path(), ?encoding);

            let cors_headers = match self.cors.simple(req.headers()) {
                Ok(headers) => headers,
                Err(err) => {
                    debug!(kind = "grpc-web", ?err);
                    let res = immediate_response(StatusCode::FORBIDDEN);
                    return Box::pin(async move { Ok(res) });
                }
            };

            // The response content-type mirrors the request's exactly.
            let web_content_type = req
                .headers()
                .get(header::CONTENT_TYPE)
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static("application/grpc-web+proto"));

            let endpoint = self.endpoint(&req).to_owned();
            let fut = self.inner.call(coerce_request(req, encoding, endpoint));

            return Box::pin(async move {
                let res = fut.await?;
                let mut res = coerce_response(res, encoding, web_content_type);
                res.headers_mut().extend(cors_headers);
                Ok(res)
            });
        }

        // Not for us; the bridge is transparent to everything else.
        debug!(
            kind = "other",
            content_type = ?req.headers().get(header::CONTENT_TYPE)
        );
        let fut = self.inner.call(req.map(box_body));
        Box::pin(fut)
    }
}

impl<S: NamedService> NamedService for GrpcWebBridge<S> {
    const NAME: &'static str = S::NAME;
}

pub(crate) fn immediate_response(status: StatusCode) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .body(empty_body())
        .unwrap()
}

/// Rebuilds a grpc-web request as the HTTP/2 gRPC request the wrapped
/// service expects. Transformations are streaming; the body is never
/// buffered.
fn coerce_request<B>(mut req: Request<B>, encoding: Encoding, endpoint: String) -> Request<BoxBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    *req.version_mut() = Version::HTTP_2;

    if let Some(content_type) = coerce_content_type(req.headers()) {
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            req.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }

    // content-length describes the encoded HTTP/1.1 payload, not the sum of
    // the decoded DATA frames; dropping it switches to streaming.
    req.headers_mut().remove(header::CONTENT_LENGTH);

    req.headers_mut()
        .insert(header::TE, HeaderValue::from_static("trailers"));

    if req.uri().path() != endpoint {
        rewrite_path(&mut req, &endpoint);
    }

    req.map(|b| box_body(GrpcWebCall::request(b, encoding)))
}

/// Rewrites a gRPC response into its grpc-web form: the status trailer moves
/// into a terminal in-body frame, failing HTTP statuses collapse to 200 with
/// the failure expressed as a gRPC code.
fn coerce_response(
    res: Response<BoxBody>,
    encoding: Encoding,
    web_content_type: HeaderValue,
) -> Response<BoxBody> {
    let (mut parts, body) = res.into_parts();

    let fallback = response_trailers_fallback(&mut parts);

    // Trailers travel in-band from here on.
    parts.headers.remove(header::TRAILER);
    parts.headers.remove(header::CONTENT_LENGTH);
    parts
        .headers
        .insert(header::CONTENT_TYPE, web_content_type);

    let body = GrpcWebCall::response(body, encoding, fallback).boxed_unsync();
    Response::from_parts(parts, body)
}

/// Pulls `grpc-status`/`grpc-message` out of the response head and, for
/// failing HTTP statuses, derives a gRPC code; the result seeds the
/// synthesized trailers frame. A failing status is flattened to 200.
pub(crate) fn response_trailers_fallback(parts: &mut http::response::Parts) -> HeaderMap {
    // Trailers-only upstream responses put the status in the headers; fold
    // it into the synthesized trailers frame instead.
    let mut fallback = HeaderMap::new();
    for name in [GRPC_STATUS, GRPC_MESSAGE] {
        if let Some(value) = parts.headers.remove(name) {
            fallback.insert(http::header::HeaderName::from_static(name), value);
        }
    }

    if parts.status.is_client_error() || parts.status.is_server_error() {
        if !fallback.contains_key(GRPC_STATUS) {
            let code = code_from_http(parts.status);
            fallback.insert(
                http::header::HeaderName::from_static(GRPC_STATUS),
                HeaderValue::from_str(&(code as i32).to_string())
                    .expect("integer is a valid header value"),
            );
            if let Ok(message) = HeaderValue::from_str(&format!(
                "grpc-status header missing, mapped from HTTP status code {}",
                parts.status.as_u16()
            )) {
                fallback.insert(http::header::HeaderName::from_static(GRPC_MESSAGE), message);
            }
        }
        // grpc-web signals RPC failure in the trailers frame, not the HTTP
        // status.
        parts.status = StatusCode::OK;
    }

    fallback
}

fn rewrite_path<B>(req: &mut Request<B>, endpoint: &str) {
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{}?{}", endpoint, query),
        None => endpoint.to_owned(),
    };

    let mut parts = req.uri().clone().into_parts();
    match path_and_query.parse() {
        Ok(pq) => parts.path_and_query = Some(pq),
        Err(_) => return,
    }

    if let Ok(uri) = http::Uri::from_parts(parts) {
        *req.uri_mut() = uri;
    }
}

/// Locates the `/package.Service/Method` suffix beneath an arbitrary mount
/// prefix: the last two path segments, provided the first of them contains a
/// dot.
pub(crate) fn grpc_endpoint(path: &str) -> &str {
    if let Some(i) = path.rfind('/') {
        if i > 0 {
            if let Some(j) = path[..i].rfind('/') {
                let service = &path[j + 1..i];
                if service.contains('.') {
                    return &path[j..];
                }
            }
        }
    }
    path
}

fn requests_grpc_web_header(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|list| list.split(','))
        .any(|name| name.trim().eq_ignore_ascii_case("x-grpc-web"))
}

// https://github.com/grpc/grpc/blob/master/doc/http-grpc-status-mapping.md
fn code_from_http(status: StatusCode) -> Code {
    match status {
        StatusCode::BAD_REQUEST => Code::Internal,
        StatusCode::UNAUTHORIZED => Code::Unauthenticated,
        StatusCode::FORBIDDEN => Code::PermissionDenied,
        StatusCode::NOT_FOUND => Code::Unimplemented,
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => Code::Unavailable,
        _ => Code::Unknown,
    }
}
