use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{Delivery, Responder, Result};

/// Application logic of a worker, called once per decoded request.
///
/// The implementation owns the delivery: it must ack (or nack) it, and it
/// should call [`Responder::respond`] exactly when `qid` is present.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(
        &self,
        delivery: Delivery,
        payload: Value,
        qid: Option<String>,
        responder: Responder,
    ) -> Result<()>;
}

/// Adapter turning an async closure into a [`Dispatch`].
pub struct FnDispatch<F>(F);

#[async_trait]
impl<F, Fut> Dispatch for FnDispatch<F>
where
    F: Fn(Delivery, Value, Option<String>, Responder) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn dispatch(
        &self,
        delivery: Delivery,
        payload: Value,
        qid: Option<String>,
        responder: Responder,
    ) -> Result<()> {
        (self.0)(delivery, payload, qid, responder).await
    }
}

pub fn dispatch_fn<F, Fut>(f: F) -> Arc<dyn Dispatch>
where
    F: Fn(Delivery, Value, Option<String>, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnDispatch(f))
}
