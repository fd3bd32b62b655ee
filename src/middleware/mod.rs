//! HTTP admission middleware for tower services.
//!
//! `AdmissionLayer` wraps any tower service over `http::Request`. Each
//! request is keyed and checked against the rate limiter; admitted requests
//! reach the inner service untouched, rejected ones get a 429 response and
//! never reach it.

mod rejection;

pub use rejection::{rejection_response, RejectionBody, RATE_LIMIT_EXCEEDED};

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{Request, Response};
use tower::{Layer, Service};
use tracing::debug;

use crate::ratelimit::{Decision, RateLimiter};

/// A layer that applies admission control using a [`RateLimiter`].
#[derive(Clone, Debug)]
pub struct AdmissionLayer {
    limiter: Arc<RateLimiter>,
}

impl AdmissionLayer {
    /// Create a new admission layer.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Middleware service that admits or rejects requests.
#[derive(Clone, Debug)]
pub struct AdmissionService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let limiter = self.limiter.clone();
        // Use the instance that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let key = limiter.partition_key(&req);
        let now_ms = limiter.now_ms();

        Box::pin(async move {
            if limiter.decide_key(&key, now_ms).await == Decision::Deny {
                debug!(
                    key = %key,
                    method = %req.method(),
                    path = %req.uri().path(),
                    "Request rejected by admission control"
                );
                return Ok(rejection_response());
            }

            inner.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{KeyExtractor, RateLimitConfig};
    use crate::store::MemoryStore;
    use http::StatusCode;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::util::BoxCloneService;
    use tower::{service_fn, ServiceExt};

    fn counting_service(
        calls: Arc<AtomicUsize>,
    ) -> BoxCloneService<Request<String>, Response<String>, Infallible> {
        BoxCloneService::new(service_fn(move |req: Request<String>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(Response::new(format!("echo {}", req.body())))
            }
        }))
    }

    fn request(ip: &str) -> Request<String> {
        Request::builder()
            .uri("/orders")
            .header("x-forwarded-for", ip)
            .body("payload".to_string())
            .unwrap()
    }

    fn limiter(capacity: u32) -> Arc<RateLimiter> {
        let config = RateLimitConfig::new(0.001, capacity).with_key(KeyExtractor::ClientAddr);
        Arc::new(RateLimiter::local(config).unwrap())
    }

    #[tokio::test]
    async fn test_allowed_request_passes_through_unchanged() {
        let calls = Arc::new(AtomicUsize::new(0));
        let svc = AdmissionLayer::new(limiter(1)).layer(counting_service(calls.clone()));

        let response = svc.oneshot(request("10.0.0.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), "echo payload");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denied_request_gets_429_and_skips_inner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let svc = AdmissionLayer::new(limiter(1)).layer(counting_service(calls.clone()));

        svc.clone().oneshot(request("10.0.0.1")).await.unwrap();
        let response = svc.clone().oneshot(request("10.0.0.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["code"], RATE_LIMIT_EXCEEDED);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A different client still has its own budget.
        let response = svc.oneshot(request("10.0.0.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_store_outage_lets_traffic_through() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let limiter = Arc::new(
            RateLimiter::distributed(RateLimitConfig::new(0.001, 1), store).unwrap(),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let svc = AdmissionLayer::new(limiter).layer(counting_service(calls.clone()));

        for _ in 0..5 {
            let response = svc.clone().oneshot(request("10.0.0.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_poll_ready_delegates_to_inner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut svc = AdmissionLayer::new(limiter(1)).layer(counting_service(calls));

        let mut task = tokio_test::task::spawn(());
        tokio_test::assert_ready_ok!(task.enter(|cx, _| svc.poll_ready(cx)));
    }
}
