use std::pin::Pin;
use std::task::{ready, Context, Poll};

use base64::Engine as _;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use http_body::{Body, SizeHint};
use pin_project::pin_project;
use tokio_stream::Stream;
use tonic::Status;

use self::content_types::*;
use crate::BoxError;

pub(crate) mod content_types {
    use http::{header::CONTENT_TYPE, HeaderMap};

    pub(crate) const GRPC: &str = "application/grpc";
    pub(crate) const GRPC_WEB: &str = "application/grpc-web";
    pub(crate) const GRPC_WEB_TEXT: &str = "application/grpc-web-text";

    /// A request carries grpc-web framing iff its content-type starts with
    /// `application/grpc-web`. This covers the text mode and any `+proto`,
    /// `+json`, … suffix.
    pub(crate) fn is_grpc_web(headers: &HeaderMap) -> bool {
        matches!(content_type(headers), Some(ct) if ct.starts_with(GRPC_WEB))
    }

    /// Rewrites `application/grpc-web[-text]<suffix>` into
    /// `application/grpc<suffix>`, keeping the suffix byte-for-byte.
    pub(crate) fn coerce_content_type(headers: &HeaderMap) -> Option<String> {
        let ct = content_type(headers)?;

        // `-text` is itself prefixed by the binary content-type, so it must
        // be stripped first.
        ct.strip_prefix(GRPC_WEB_TEXT)
            .or_else(|| ct.strip_prefix(GRPC_WEB))
            .map(|suffix| format!("{}{}", GRPC, suffix))
    }

    pub(crate) fn content_type(headers: &HeaderMap) -> Option<&str> {
        headers.get(CONTENT_TYPE).and_then(|val| val.to_str().ok())
    }
}

const BUFFER_SIZE: usize = 8 * 1024;

// A grpc frame header is u8 (flag) + u32 (message len)
const FRAME_HEADER_SIZE: usize = 5;

// 8th (MSB) bit of the 1st frame byte marks an uncompressed
// trailers block carried in the body
const GRPC_WEB_TRAILERS_BIT: u8 = 0b1000_0000;

const GRPC_STATUS: &str = "grpc-status";
const GRPC_MESSAGE: &str = "grpc-message";

#[derive(Copy, Clone, PartialEq, Debug)]
enum Direction {
    Decode,
    Encode,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Encoding {
    Base64,
    None,
}

/// Body adapter performing the grpc-web framing translation.
///
/// In the decode direction (requests) it turns a grpc-web body into the
/// native gRPC body the wrapped service expects, streaming the base64 text
/// mode through a 4-byte-aligned decoder. In the encode direction
/// (responses) it forwards the service's frames, base64-encodes them in text
/// mode through a 3-byte-aligned encoder, and terminates every stream with
/// exactly one trailers frame.
#[derive(Debug)]
#[pin_project]
pub struct GrpcWebCall<B> {
    #[pin]
    inner: B,
    // decode: undecoded base64 input; encode: unencoded remainder
    buf: BytesMut,
    direction: Direction,
    encoding: Encoding,
    poll_trailers: bool,
    fallback: Option<HeaderMap>,
}

impl<B> GrpcWebCall<B> {
    pub(crate) fn request(inner: B, encoding: Encoding) -> Self {
        Self::new(inner, Direction::Decode, encoding, None)
    }

    /// `fallback` supplies `grpc-status`/`grpc-message` for upstream
    /// responses that never produce body trailers (trailers-only responses,
    /// failing HTTP statuses). It is consulted only when the inner trailers
    /// are missing a status.
    pub(crate) fn response(inner: B, encoding: Encoding, fallback: HeaderMap) -> Self {
        Self::new(inner, Direction::Encode, encoding, Some(fallback))
    }

    fn new(inner: B, direction: Direction, encoding: Encoding, fallback: Option<HeaderMap>) -> Self {
        GrpcWebCall {
            inner,
            buf: BytesMut::with_capacity(match (direction, encoding) {
                (Direction::Encode, Encoding::Base64) => BUFFER_SIZE,
                _ => 0,
            }),
            direction,
            encoding,
            poll_trailers: direction == Direction::Encode,
            fallback,
        }
    }

    // Avoids handing the base64 decoder a slice it would consider invalid.
    #[inline]
    fn max_decodable(&self) -> usize {
        (self.buf.len() / 4) * 4
    }

    fn decode_chunk(mut self: Pin<&mut Self>) -> Result<Option<Bytes>, Status> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        // Split `buf` at the largest index that is a multiple of 4; the rest
        // stays buffered for the next attempt.
        let index = self.max_decodable();

        crate::util::base64::STANDARD
            .decode(self.as_mut().project().buf.split_to(index))
            .map(|decoded| Some(Bytes::from(decoded)))
            .map_err(internal_error)
    }
}

impl<B> GrpcWebCall<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    fn poll_decode(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Status>>> {
        match self.encoding {
            Encoding::Base64 => loop {
                if let Some(bytes) = self.as_mut().decode_chunk()? {
                    return Poll::Ready(Some(Ok(bytes)));
                }

                let mut this = self.as_mut().project();

                match ready!(this.inner.as_mut().poll_data(cx)) {
                    Some(Ok(data)) => this.buf.put(data),
                    Some(Err(e)) => return Poll::Ready(Some(Err(boxed_error(e)))),
                    None => {
                        return if this.buf.has_remaining() {
                            Poll::Ready(Some(Err(internal_error("malformed base64 request body"))))
                        } else {
                            Poll::Ready(None)
                        }
                    }
                }
            },

            Encoding::None => match ready!(self.project().inner.poll_data(cx)) {
                Some(res) => Poll::Ready(Some(res.map_err(boxed_error))),
                None => Poll::Ready(None),
            },
        }
    }

    fn poll_encode(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Status>>> {
        loop {
            let mut this = self.as_mut().project();

            match ready!(this.inner.as_mut().poll_data(cx)) {
                Some(Ok(data)) => match this.encoding {
                    Encoding::None => return Poll::Ready(Some(Ok(data))),
                    Encoding::Base64 => {
                        // Encode whole 3-byte groups only; the remainder is
                        // carried over so the body decodes as one continuous
                        // base64 stream. Padding appears once, on the final
                        // chunk.
                        this.buf.put(data);
                        let aligned = (this.buf.len() / 3) * 3;
                        if aligned == 0 {
                            continue;
                        }
                        let encoded =
                            crate::util::base64::STANDARD.encode(this.buf.split_to(aligned));
                        return Poll::Ready(Some(Ok(encoded.into_bytes().into())));
                    }
                },
                Some(Err(e)) => return Poll::Ready(Some(Err(boxed_error(e)))),
                None => break,
            }
        }

        let mut this = self.as_mut().project();

        if !*this.poll_trailers {
            return Poll::Ready(None);
        }

        match ready!(this.inner.as_mut().poll_trailers(cx)) {
            Ok(trailers) => {
                *this.poll_trailers = false;

                let mut trailers = trailers.unwrap_or_default();

                if !trailers.contains_key(GRPC_STATUS) {
                    if let Some(fallback) = this.fallback.take() {
                        for (name, value) in fallback.iter() {
                            if !trailers.contains_key(name) {
                                trailers.insert(name.clone(), value.clone());
                            }
                        }
                    }
                }

                // The upstream produced no status at all; per the protocol
                // the client must still see a terminal trailers frame.
                if !trailers.contains_key(GRPC_STATUS) {
                    trailers.insert(
                        HeaderName::from_static(GRPC_STATUS),
                        HeaderValue::from_static("2"),
                    );
                    trailers.insert(
                        HeaderName::from_static(GRPC_MESSAGE),
                        HeaderValue::from_static("internal error"),
                    );
                }

                let mut frame = make_trailers_frame(trailers);

                if *this.encoding == Encoding::Base64 {
                    let mut tail = this.buf.split().to_vec();
                    tail.extend(frame);
                    frame = crate::util::base64::STANDARD.encode(tail).into_bytes();
                }

                Poll::Ready(Some(Ok(frame.into())))
            }
            Err(e) => Poll::Ready(Some(Err(boxed_error(e)))),
        }
    }
}

impl<B> Body for GrpcWebCall<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = Status;

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        match self.direction {
            Direction::Decode => self.poll_decode(cx),
            Direction::Encode => self.poll_encode(cx),
        }
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        _: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap<HeaderValue>>, Self::Error>> {
        Poll::Ready(Ok(None))
    }

    fn is_end_stream(&self) -> bool {
        match self.direction {
            Direction::Decode => self.inner.is_end_stream(),
            // The trailers frame is still owed even when the inner body is
            // already exhausted.
            Direction::Encode => !self.poll_trailers,
        }
    }

    fn size_hint(&self) -> SizeHint {
        // Both directions change the byte count; an exact inner hint would
        // make hyper emit a wrong content-length.
        SizeHint::default()
    }
}

impl<B> Stream for GrpcWebCall<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Item = Result<Bytes, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Body::poll_data(self, cx)
    }
}

impl Encoding {
    pub(crate) fn from_content_type(headers: &HeaderMap) -> Encoding {
        match content_types::content_type(headers) {
            Some(ct) if ct.starts_with(GRPC_WEB_TEXT) => Encoding::Base64,
            _ => Encoding::None,
        }
    }
}

fn internal_error(e: impl std::fmt::Display) -> Status {
    Status::internal(format!("grpcweb-bridge: {}", e))
}

fn boxed_error(e: impl Into<BoxError>) -> Status {
    let e: BoxError = e.into();
    internal_error(e)
}

// Key-value pairs encoded as a HTTP/1 headers block
fn encode_trailers(trailers: HeaderMap) -> Vec<u8> {
    trailers.iter().fold(Vec::new(), |mut acc, (key, value)| {
        acc.put_slice(key.as_ref());
        acc.push(b':');
        acc.put_slice(value.as_bytes());
        acc.put_slice(b"\r\n");
        acc
    })
}

pub(crate) fn make_trailers_frame(trailers: HeaderMap) -> Vec<u8> {
    let trailers = encode_trailers(trailers);
    let len = trailers.len();
    assert!(len <= u32::MAX as usize);

    let mut frame = Vec::with_capacity(len + FRAME_HEADER_SIZE);
    frame.push(GRPC_WEB_TRAILERS_BIT);
    frame.put_u32(len as u32);
    frame.extend(trailers);

    frame
}
