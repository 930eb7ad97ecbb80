use crate::HandlerError;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;

/// Computes the reply body for one request body.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Bytes) -> Result<Bytes, HandlerError>;
}

/// Adapter turning an async closure into a [`RequestHandler`].
pub struct HandlerFn<F>(F);

/// Wrap `f` as a request handler.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> RequestHandler for HandlerFn<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Bytes) -> Result<Bytes, HandlerError> {
        (self.0)(request).await
    }
}

/// Replies with `fib(n)` for a decimal `n`.
pub struct FibonacciService;

impl FibonacciService {
    /// `None` once the result no longer fits in a u64 (n > 93).
    pub fn fib(n: u64) -> Option<u64> {
        let (mut a, mut b) = (0u64, Some(1u64));
        for _ in 0..n {
            let current = b?;
            b = a.checked_add(current);
            a = current;
        }
        Some(a)
    }
}

#[async_trait]
impl RequestHandler for FibonacciService {
    async fn handle(&self, request: Bytes) -> Result<Bytes, HandlerError> {
        let text = std::str::from_utf8(&request)
            .map_err(|e| HandlerError::InvalidRequest(e.to_string()))?;
        let n: u64 = text
            .trim()
            .parse()
            .map_err(|_| HandlerError::InvalidRequest(format!("not a number: {:?}", text)))?;

        let value = Self::fib(n)
            .ok_or_else(|| HandlerError::InvalidRequest(format!("fib({}) overflows u64", n)))?;
        Ok(Bytes::from(value.to_string()))
    }
}
