use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use base64::Engine as _;
use bytes::Bytes;
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD,
    CONTENT_LENGTH, CONTENT_TYPE, ORIGIN,
};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Version};
use http_body::Body as HttpBody;
use hyper::service::make_service_fn;
use tonic::body::BoxBody;
use tonic::Status;
use tower_layer::Layer;
use tower_service::Service;

use grpcweb_bridge::{GrpcWebLayer, Options};

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8];
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Response body yielding a fixed set of frames, then trailers.
struct FrameBody {
    chunks: VecDeque<Bytes>,
    trailers: Option<HeaderMap>,
}

impl FrameBody {
    fn new(chunks: Vec<Vec<u8>>, trailers: Option<HeaderMap>) -> Self {
        FrameBody {
            chunks: chunks.into_iter().map(Bytes::from).collect(),
            trailers,
        }
    }

    fn boxed(self) -> BoxBody {
        HttpBody::boxed_unsync(self)
    }
}

impl HttpBody for FrameBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_data(
        mut self: Pin<&mut Self>,
        _: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        Poll::Ready(self.chunks.pop_front().map(Ok))
    }

    fn poll_trailers(
        mut self: Pin<&mut Self>,
        _: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        Poll::Ready(Ok(self.trailers.take()))
    }
}

#[derive(Debug, Default, Clone)]
struct Captured {
    version: Option<Version>,
    content_type: Option<String>,
    te: Option<String>,
    had_content_length: bool,
    path: Option<String>,
    body: Vec<u8>,
}

/// Mock gRPC handler:
///
/// * `POST /svc.Svc/Echo` — one data frame `\x03\x04`, trailer `grpc-status: 0`
/// * `POST /svc.Svc/NotFound` — trailers-only failure in the response headers
/// * `POST /svc.Svc/Broken` — HTTP 404, nothing else
/// * everything else — plain HTTP 200 `ok` with an `x-handler` marker
#[derive(Clone)]
struct Svc {
    captured: Arc<Mutex<Captured>>,
}

impl Svc {
    fn new() -> (Self, Arc<Mutex<Captured>>) {
        let captured = Arc::new(Mutex::new(Captured::default()));
        (
            Svc {
                captured: captured.clone(),
            },
            captured,
        )
    }
}

impl Service<Request<BoxBody>> for Svc {
    type Response = Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<BoxBody>) -> Self::Future {
        let captured = self.captured.clone();

        Box::pin(async move {
            let path = req.uri().path().to_owned();
            {
                let header = |name: &str| {
                    req.headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .map(ToOwned::to_owned)
                };

                let mut cap = captured.lock().unwrap();
                cap.version = Some(req.version());
                cap.content_type = header("content-type");
                cap.te = header("te");
                cap.had_content_length = req.headers().contains_key(CONTENT_LENGTH);
                cap.path = Some(path.clone());
            }

            let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
            captured.lock().unwrap().body = body.to_vec();

            let res = match path.as_str() {
                "/svc.Svc/Echo" => {
                    let mut trailers = HeaderMap::new();
                    trailers.insert("grpc-status", HeaderValue::from_static("0"));
                    Response::new(FrameBody::new(vec![frame(&[3, 4])], Some(trailers)).boxed())
                }
                "/svc.Svc/NotFound" => Response::builder()
                    .header("grpc-status", "5")
                    .header("grpc-message", "not found")
                    .body(FrameBody::new(vec![], None).boxed())
                    .unwrap(),
                "/svc.Svc/Broken" => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(FrameBody::new(vec![], None).boxed())
                    .unwrap(),
                _ => Response::builder()
                    .header("x-handler", "direct")
                    .body(FrameBody::new(vec![b"ok".to_vec()], None).boxed())
                    .unwrap(),
            };

            Ok(res)
        })
    }
}

fn permissive_options() -> Options {
    Options::new()
        .allow_all_origins()
        .endpoints_fn(|| vec!["/svc.Svc/Echo".to_owned(), "/svc.Svc/NotFound".to_owned()])
}

fn echo_request(content_type: &str, body: Vec<u8>) -> Request<hyper::Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/svc.Svc/Echo")
        .header(CONTENT_TYPE, content_type)
        .header(ORIGIN, "https://app.example")
        .body(hyper::Body::from(body))
        .unwrap()
}

async fn body_bytes(res: Response<BoxBody>) -> Bytes {
    hyper::body::to_bytes(res.into_body()).await.unwrap()
}

#[tokio::test]
async fn unary_ok_binary() {
    let (inner, captured) = Svc::new();
    let mut svc = GrpcWebLayer::with_options(permissive_options()).layer(inner);

    let req = echo_request("application/grpc-web+proto", frame(&[1, 2]));
    let res = svc.call(req).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[CONTENT_TYPE], "application/grpc-web+proto");
    assert_eq!(
        res.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://app.example"
    );
    assert_eq!(res.headers()[ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");

    let body = body_bytes(res).await;
    assert_eq!(
        &body[..],
        b"\x00\x00\x00\x00\x02\x03\x04\x80\x00\x00\x00\x0fgrpc-status:0\r\n"
    );

    // The rewritten request the handler saw.
    let cap = captured.lock().unwrap();
    assert_eq!(cap.version, Some(Version::HTTP_2));
    assert_eq!(cap.content_type.as_deref(), Some("application/grpc+proto"));
    assert_eq!(cap.te.as_deref(), Some("trailers"));
    assert!(!cap.had_content_length);
    assert_eq!(cap.body, frame(&[1, 2]));
}

#[tokio::test]
async fn unary_text_mode_matches_binary_mode() {
    let (inner, _) = Svc::new();
    let mut svc = GrpcWebLayer::with_options(permissive_options()).layer(inner.clone());

    let res = svc
        .call(echo_request("application/grpc-web+proto", frame(&[1, 2])))
        .await
        .unwrap();
    let binary_body = body_bytes(res).await;

    let mut svc = GrpcWebLayer::with_options(permissive_options()).layer(inner);
    let encoded = BASE64.encode(frame(&[1, 2])).into_bytes();
    let res = svc
        .call(echo_request("application/grpc-web-text", encoded))
        .await
        .unwrap();

    assert_eq!(res.headers()[CONTENT_TYPE], "application/grpc-web-text");

    let text_body = body_bytes(res).await;
    assert_eq!(BASE64.decode(&text_body[..]).unwrap(), binary_body);
}

#[tokio::test]
async fn preflight_accepted_for_registered_endpoint() {
    let (inner, captured) = Svc::new();
    let mut svc = GrpcWebLayer::with_options(permissive_options()).layer(inner);

    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri("/svc.Svc/Echo")
        .header(ORIGIN, "https://app.example")
        .header(ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(
            ACCESS_CONTROL_REQUEST_HEADERS,
            "content-type,x-grpc-web,x-user-agent",
        )
        .body(hyper::Body::empty())
        .unwrap();

    let res = svc.call(req).await.unwrap();

    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        res.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://app.example"
    );
    assert_eq!(res.headers()[ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    assert_eq!(res.headers()[ACCESS_CONTROL_MAX_AGE], "600");

    let allow = res.headers()[ACCESS_CONTROL_ALLOW_HEADERS].to_str().unwrap();
    assert!(allow.contains("x-grpc-web"));
    assert!(allow.contains("u-a"));

    // Preflights never reach the wrapped handler.
    assert!(captured.lock().unwrap().path.is_none());
}

#[tokio::test]
async fn preflight_rejected_for_unregistered_endpoint() {
    let (inner, _) = Svc::new();
    // registered-endpoints-only is the default, and no endpoints are exposed
    let options = Options::new().allow_all_origins();
    let mut svc = GrpcWebLayer::with_options(options).layer(inner);

    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri("/svc.Svc/Echo")
        .header(ORIGIN, "https://app.example")
        .header(ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(ACCESS_CONTROL_REQUEST_HEADERS, "content-type,x-grpc-web")
        .body(hyper::Body::empty())
        .unwrap();

    let res = svc.call(req).await.unwrap();

    assert!(!res.headers().contains_key(ACCESS_CONTROL_ALLOW_ORIGIN));
}

#[tokio::test]
async fn failing_rpc_is_a_single_trailers_frame() {
    let (inner, _) = Svc::new();
    let mut svc = GrpcWebLayer::with_options(permissive_options()).layer(inner);

    let mut req = echo_request("application/grpc-web+proto", Vec::new());
    *req.uri_mut() = "/svc.Svc/NotFound".parse().unwrap();

    let res = svc.call(req).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert!(!res.headers().contains_key("grpc-status"));

    let body = body_bytes(res).await;
    assert_eq!(body[0], 0x80);

    let len = u32::from_be_bytes(body[1..5].try_into().unwrap()) as usize;
    assert_eq!(body.len(), 5 + len, "exactly one trailers frame");

    let text = std::str::from_utf8(&body[5..]).unwrap();
    assert!(text.contains("grpc-status:5\r\n"));
    assert!(text.contains("grpc-message:not found\r\n"));
}

#[tokio::test]
async fn failing_http_status_still_ends_in_trailers() {
    let (inner, _) = Svc::new();
    let mut svc = GrpcWebLayer::with_options(permissive_options()).layer(inner);

    let mut req = echo_request("application/grpc-web+proto", Vec::new());
    *req.uri_mut() = "/svc.Svc/Broken".parse().unwrap();

    let res = svc.call(req).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);

    let body = body_bytes(res).await;
    assert_eq!(body[0], 0x80);
    let text = std::str::from_utf8(&body[5..]).unwrap();
    assert!(text.contains("grpc-status:12\r\n"), "{:?}", text);
}

#[tokio::test]
async fn unrelated_traffic_passes_through_verbatim() {
    let (inner, _) = Svc::new();
    let mut svc = GrpcWebLayer::with_options(permissive_options()).layer(inner);

    let req = Request::builder()
        .method(Method::GET)
        .uri("/healthz")
        .body(hyper::Body::empty())
        .unwrap();

    let res = svc.call(req).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["x-handler"], "direct");
    assert!(!res.headers().contains_key(ACCESS_CONTROL_ALLOW_ORIGIN));

    let body = body_bytes(res).await;
    assert_eq!(&body[..], b"ok");
}

mod websocket {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::protocol::Message;

    /// Streaming handler: echoes a fixed frame, then the raw request body as
    /// a second frame, then `grpc-status: 0`.
    #[derive(Clone)]
    struct StreamSvc;

    impl Service<Request<BoxBody>> for StreamSvc {
        type Response = Response<BoxBody>;
        type Error = Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<BoxBody>) -> Self::Future {
            Box::pin(async move {
                let body = hyper::body::to_bytes(req.into_body()).await.unwrap();

                let mut trailers = HeaderMap::new();
                trailers.insert("grpc-status", HeaderValue::from_static("0"));

                let frames = vec![frame(&[0xaa]), frame(&body)];
                Ok(Response::new(FrameBody::new(frames, Some(trailers)).boxed()))
            })
        }
    }

    #[tokio::test]
    async fn websocket_streaming_echo() {
        let options = Options::new().allow_all_origins().enable_websockets(true);
        let svc = GrpcWebLayer::with_options(options).layer(StreamSvc);

        let make = make_service_fn(move |_| {
            let svc = svc.clone();
            async move { Ok::<_, Infallible>(svc) }
        });

        let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
        let addr = server.local_addr();
        tokio::spawn(server);

        let mut req = format!("ws://{}/svc.Svc/Stream", addr)
            .into_client_request()
            .unwrap();
        req.headers_mut().insert(
            "sec-websocket-protocol",
            HeaderValue::from_static("grpc-websockets"),
        );
        req.headers_mut().insert(
            "origin",
            HeaderValue::from_str(&format!("http://{}", addr)).unwrap(),
        );

        let (mut ws, response) = tokio_tungstenite::connect_async(req).await.unwrap();
        assert_eq!(
            response
                .headers()
                .get("sec-websocket-protocol")
                .and_then(|v| v.to_str().ok()),
            Some("grpc-websockets")
        );

        // headers block, one payload frame, then half-close
        ws.send(Message::Binary(
            b"content-type: application/grpc-web+proto\r\n\r\n".to_vec(),
        ))
        .await
        .unwrap();

        let sent_frame = frame(&[1, 2]);
        let mut payload = vec![0u8];
        payload.extend_from_slice(&sent_frame);
        ws.send(Message::Binary(payload)).await.unwrap();
        ws.send(Message::Binary(vec![1])).await.unwrap();

        let first = expect_binary(&mut ws).await;
        assert_eq!(first, frame(&[0xaa]));

        // The second frame carries the client's bytes back, proving the
        // socket-to-handler pipe delivered them.
        let second = expect_binary(&mut ws).await;
        assert_eq!(second, frame(&sent_frame));

        let trailers = expect_binary(&mut ws).await;
        assert_eq!(trailers[0], 0x80);
        let text = std::str::from_utf8(&trailers[5..]).unwrap();
        assert!(text.contains("grpc-status:0\r\n"));

        match ws.next().await {
            Some(Ok(Message::Close(_))) | None => {}
            other => panic!("expected clean close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn websocket_upgrade_rejected_for_foreign_origin() {
        let options = Options::new().allow_all_origins().enable_websockets(true);
        let svc = GrpcWebLayer::with_options(options).layer(StreamSvc);

        let make = make_service_fn(move |_| {
            let svc = svc.clone();
            async move { Ok::<_, Infallible>(svc) }
        });

        let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
        let addr = server.local_addr();
        tokio::spawn(server);

        let mut req = format!("ws://{}/svc.Svc/Stream", addr)
            .into_client_request()
            .unwrap();
        req.headers_mut().insert(
            "sec-websocket-protocol",
            HeaderValue::from_static("grpc-websockets"),
        );
        req.headers_mut()
            .insert("origin", HeaderValue::from_static("https://evil.invalid"));

        // The handshake must fail: the server answers 403 instead of 101.
        assert!(tokio_tungstenite::connect_async(req).await.is_err());
    }

    async fn expect_binary<S>(ws: &mut S) -> Vec<u8>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return data,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("expected binary message, got {:?}", other),
            }
        }
    }
}
