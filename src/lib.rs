//! grpc-web protocol bridge for tower gRPC services.
//!
//! `grpcweb_bridge` wraps an existing gRPC service (or any HTTP handler that
//! speaks gRPC-over-HTTP/2) and exposes it to browsers through the [grpc-web]
//! protocol. Browsers cannot read HTTP/2 trailer frames, so the bridge
//! re-encodes the gRPC status as a trailing length-prefixed frame in the
//! response body, decodes the base64 text mode on the fly, answers the CORS
//! preflights grpc-web clients issue, and — since grpc-web over HTTP/1.1
//! cannot carry client streaming — optionally tunnels bidirectional RPCs over
//! a WebSocket sub-protocol.
//!
//! ## Wrapping a service
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let addr = "[::1]:50051".parse().unwrap();
//!     let greeter = GreeterServer::new(MyGreeter::default());
//!
//!     let options = Options::new()
//!         .allow_origins(vec!["https://app.example"])
//!         .enable_websockets(true);
//!
//!     Server::builder()
//!        .accept_http1(true)
//!        .layer(GrpcWebLayer::with_options(options))
//!        .add_service(greeter)
//!        .serve(addr)
//!        .await?;
//!
//!    Ok(())
//! }
//! ```
//!
//! ## Scope
//!
//! * The bridge translates the protocol; it never inspects or transforms RPC
//!   message payloads.
//! * Requests that are neither grpc-web, an acceptable grpc-web CORS
//!   preflight, nor a grpc-web WebSocket upgrade are forwarded to the wrapped
//!   service untouched.
//! * CORS is opt-in: the default [`Options`] allow no cross-origin callers.
//!
//! [grpc-web]: https://github.com/grpc/grpc/blob/master/doc/PROTOCOL-WEB.md

pub use call::GrpcWebCall;
pub use layer::GrpcWebLayer;
pub use options::{AllowedOrigins, Options};
pub use service::GrpcWebBridge;

mod call;
mod cors;
mod layer;
mod options;
mod service;
mod websocket;

use bytes::Bytes;
use http_body::Body;
use tonic::body::BoxBody;
use tonic::Status;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) fn box_body<B>(body: B) -> BoxBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(|err| {
        let err: BoxError = err.into();
        Status::internal(format!("grpcweb-bridge: {}", err))
    })
    .boxed_unsync()
}

pub(crate) mod util {
    pub(crate) mod base64 {
        use base64::{
            alphabet,
            engine::{
                general_purpose::{GeneralPurpose, GeneralPurposeConfig},
                DecodePaddingMode,
            },
        };

        pub(crate) const STANDARD: GeneralPurpose = GeneralPurpose::new(
            &alphabet::STANDARD,
            GeneralPurposeConfig::new()
                .with_encode_padding(true)
                .with_decode_padding_mode(DecodePaddingMode::Indifferent),
        );
    }
}
