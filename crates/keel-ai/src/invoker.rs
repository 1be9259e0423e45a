use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::KeelAiError;
use crate::types::{ModelRequest, ModelResponse};

pub type ModelFuture = Pin<Box<dyn Future<Output = Result<ModelResponse, KeelAiError>> + Send>>;

/// Boundary to the language model. Implementations must tolerate being
/// invoked more than once for the same request when calls are retried.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, KeelAiError>;
}

#[async_trait]
impl<F> ModelInvoker for F
where
    F: Fn(ModelRequest) -> ModelFuture + Send + Sync + 'static,
{
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, KeelAiError> {
        (self)(request).await
    }
}

pub type ModelInvokerRef = Arc<dyn ModelInvoker>;
