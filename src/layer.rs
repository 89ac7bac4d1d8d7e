use tower_layer::Layer;

use crate::options::Options;
use crate::service::GrpcWebBridge;

/// Layer applying the grpc-web protocol bridge.
#[derive(Debug, Default, Clone)]
pub struct GrpcWebLayer {
    options: Options,
}

impl GrpcWebLayer {
    /// A bridge with the default, locked-down [`Options`].
    pub fn new() -> GrpcWebLayer {
        Self::default()
    }

    pub fn with_options(options: Options) -> GrpcWebLayer {
        GrpcWebLayer { options }
    }
}

impl<S> Layer<S> for GrpcWebLayer {
    type Service = GrpcWebBridge<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcWebBridge::with_options(inner, self.options.clone())
    }
}
