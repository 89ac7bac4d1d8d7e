use std::future::poll_fn;

use base64::Engine as _;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use hyper::upgrade::Upgraded;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, Role};
use tokio_tungstenite::WebSocketStream;
use tonic::body::BoxBody;
use tower_service::Service;
use tracing::{debug, warn};

use crate::call::{Encoding, GrpcWebCall};
use crate::options::Options;
use crate::service::{immediate_response, response_trailers_fallback};
use crate::{box_body, BoxError};

/// Sub-protocol token negotiated at upgrade time.
pub(crate) const SUBPROTOCOL: &str = "grpc-websockets";

const WEBSOCKET_HANDSHAKE_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// 1-byte prefix of every client message after the header block: `0` marks a
// payload carrying a gRPC frame, a bare `1` marks the client half-close.
const PAYLOAD: u8 = 0;
const FINISH_SEND: u8 = 1;

// Depth of the socket-to-handler and handler-to-socket pipes; enough to keep
// both sides busy, small enough to give backpressure.
const PIPE_DEPTH: usize = 16;

/// True iff `req` is a WebSocket upgrade advertising the grpc-web
/// sub-protocol.
pub(crate) fn is_grpc_websocket_request<B>(req: &Request<B>) -> bool {
    token_list_contains(req.headers(), header::CONNECTION, "upgrade")
        && matches!(
            req.headers().get(header::UPGRADE).and_then(|v| v.to_str().ok()),
            Some(upgrade) if upgrade.eq_ignore_ascii_case("websocket")
        )
        && token_list_contains(req.headers(), header::SEC_WEBSOCKET_PROTOCOL, SUBPROTOCOL)
}

/// Answers the upgrade handshake and tunnels a single RPC over the socket.
///
/// The wrapped service runs concurrently with the socket reader; a client
/// disconnect drops the in-flight call.
pub(crate) async fn serve<S, B>(
    inner: S,
    options: Options,
    endpoint: String,
    req: Request<B>,
) -> Response<BoxBody>
where
    S: Service<Request<BoxBody>, Response = Response<BoxBody>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + Send,
    B: Send + 'static,
{
    if !origin_allowed(&options, req.headers()) {
        debug!(origin = ?req.headers().get(header::ORIGIN), "websocket origin rejected");
        return immediate_response(StatusCode::FORBIDDEN);
    }

    let accept = match req.headers().get(header::SEC_WEBSOCKET_KEY) {
        Some(key) => derive_accept_key(key.as_bytes()),
        None => return immediate_response(StatusCode::BAD_REQUEST),
    };

    // Only the endpoint path matters to the wrapped service.
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{}?{}", endpoint, query),
        None => endpoint,
    };
    let uri: Uri = match path_and_query.parse() {
        Ok(uri) => uri,
        Err(_) => return immediate_response(StatusCode::BAD_REQUEST),
    };

    let on_upgrade = hyper::upgrade::on(req);

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                tunnel(inner, ws, uri).await;
            }
            Err(err) => debug!(%err, "websocket upgrade failed"),
        }
    });

    let mut res = immediate_response(StatusCode::SWITCHING_PROTOCOLS);
    let headers = res.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(SUBPROTOCOL),
    );
    if let Ok(accept) = HeaderValue::from_str(&accept) {
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    }
    res
}

async fn tunnel<S>(mut inner: S, ws: WebSocketStream<Upgraded>, uri: Uri)
where
    S: Service<Request<BoxBody>, Response = Response<BoxBody>>,
    S::Error: Into<BoxError>,
{
    let (sink, mut stream) = ws.split();

    // A single task owns the sink so the close frame goes out exactly once,
    // no matter which side asks for it first.
    let (out_tx, out_rx) = mpsc::channel::<Message>(PIPE_DEPTH);
    let sender = tokio::spawn(forward_messages(out_rx, sink));

    // The first message carries the request headers.
    let req_headers = loop {
        match stream.next().await {
            Some(Ok(Message::Binary(block))) => match parse_header_block(&block) {
                Ok(headers) => break headers,
                Err(err) => {
                    debug!(%err, "bad websocket header block");
                    send_close(&out_tx, CloseCode::Protocol, "bad header block").await;
                    drop(out_tx);
                    let _ = sender.await;
                    return;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            _ => {
                send_close(&out_tx, CloseCode::Protocol, "expected header block").await;
                drop(out_tx);
                let _ = sender.await;
                return;
            }
        }
    };

    let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, tonic::Status>>(PIPE_DEPTH);
    let body = hyper::Body::wrap_stream(ReceiverStream::new(body_rx));

    let mut request = Request::new(box_body(body));
    *request.method_mut() = Method::POST;
    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_2;
    *request.headers_mut() = req_headers;
    request.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc+proto"),
    );
    request.headers_mut().remove(header::CONTENT_LENGTH);
    request
        .headers_mut()
        .insert(header::TE, HeaderValue::from_static("trailers"));

    let reader = read_frames(&mut stream, body_tx, out_tx.clone());
    let writer = write_frames(&mut inner, request, out_tx.clone());

    tokio::select! {
        // RPC finished; the trailers frame and close frame are queued.
        _ = writer => {}
        // Client went away; dropping the writer cancels the in-flight call.
        _ = reader => {}
    }

    drop(out_tx);
    let _ = sender.await;
}

async fn forward_messages(
    mut rx: mpsc::Receiver<Message>,
    mut sink: SplitSink<WebSocketStream<Upgraded>, Message>,
) {
    while let Some(message) = rx.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() {
            return;
        }
        if is_close {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Socket → handler. Feeds payload frames into the request body pipe; a
/// finishSend marker half-closes it. Returns when the client closes the
/// socket or violates the framing.
async fn read_frames(
    stream: &mut SplitStream<WebSocketStream<Upgraded>>,
    body_tx: mpsc::Sender<Result<Bytes, tonic::Status>>,
    out_tx: mpsc::Sender<Message>,
) {
    let mut body_tx = Some(body_tx);

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(data)) => match data.split_first() {
                Some((&FINISH_SEND, _)) => {
                    // Half-close: dropping the sender ends the request body.
                    body_tx.take();
                }
                Some((&PAYLOAD, frame)) => {
                    let failed = match &body_tx {
                        Some(tx) => tx.send(Ok(Bytes::copy_from_slice(frame))).await.is_err(),
                        None => false,
                    };
                    if failed {
                        // The handler stopped reading; keep draining the
                        // socket so its close frame is still observed.
                        body_tx.take();
                    }
                }
                _ => {
                    send_close(&out_tx, CloseCode::Protocol, "invalid frame marker").await;
                    return;
                }
            },
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) | Err(_) => return,
            Ok(_) => {
                send_close(&out_tx, CloseCode::Protocol, "expected binary message").await;
                return;
            }
        }
    }
}

/// Handler → socket. Runs the wrapped service and forwards every produced
/// frame as one binary message, the trailers frame last, then queues the
/// close frame.
async fn write_frames<S>(inner: &mut S, request: Request<BoxBody>, out_tx: mpsc::Sender<Message>)
where
    S: Service<Request<BoxBody>, Response = Response<BoxBody>>,
    S::Error: Into<BoxError>,
{
    if let Err(err) = poll_fn(|cx| inner.poll_ready(cx)).await {
        let err: BoxError = err.into();
        debug!(%err, "wrapped service not ready");
        send_close(&out_tx, CloseCode::Error, "internal error").await;
        return;
    }

    let response = match inner.call(request).await {
        Ok(response) => response,
        Err(err) => {
            let err: BoxError = err.into();
            debug!(%err, "wrapped service failed");
            send_close(&out_tx, CloseCode::Error, "internal error").await;
            return;
        }
    };

    let (mut parts, body) = response.into_parts();
    let fallback = response_trailers_fallback(&mut parts);

    let mut frames = Box::pin(GrpcWebCall::response(body, Encoding::None, fallback));

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(frame) => {
                if out_tx.send(Message::Binary(frame.to_vec())).await.is_err() {
                    return;
                }
            }
            Err(status) => {
                debug!(code = ?status.code(), "response stream failed");
                break;
            }
        }
    }

    send_close(&out_tx, CloseCode::Normal, "").await;
}

async fn send_close(out_tx: &mpsc::Sender<Message>, code: CloseCode, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = out_tx.send(Message::Close(Some(frame))).await;
}

fn origin_allowed(options: &Options, headers: &HeaderMap) -> bool {
    match &options.websocket_origin_fn {
        Some(f) => f(headers),
        None => origin_matches_host(headers),
    }
}

// Default policy: the Origin authority must equal the Host header.
fn origin_matches_host(headers: &HeaderMap) -> bool {
    let origin = match headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        Some(origin) => origin,
        None => return false,
    };
    let host = match headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
        Some(host) => host,
        None => return false,
    };

    match origin.parse::<Uri>() {
        Ok(uri) => uri
            .authority()
            .map(|authority| authority.as_str() == host)
            .unwrap_or(false),
        Err(err) => {
            warn!(%err, "invalid websocket origin header");
            false
        }
    }
}

fn derive_accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WEBSOCKET_HANDSHAKE_MAGIC.as_bytes());
    crate::util::base64::STANDARD.encode(sha1.finalize())
}

/// Parses the `name: value\r\n` block the first client message carries.
fn parse_header_block(block: &[u8]) -> Result<HeaderMap, BoxError> {
    let text = std::str::from_utf8(block)?;

    let mut headers = HeaderMap::new();
    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or("header line without separator")?;
        headers.append(
            HeaderName::try_from(name.trim())?,
            HeaderValue::try_from(value.trim())?,
        );
    }

    Ok(headers)
}

fn token_list_contains(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|list| list.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}
