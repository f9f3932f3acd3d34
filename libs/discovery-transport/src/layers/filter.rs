use http::Request;
use http::request::Parts;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// A hook that may rewrite request metadata before it is sent.
///
/// Filters run in registration order on every request, after the body has
/// been encoded and before the request reaches the connection pool.
pub trait RequestFilter: Send + Sync + fmt::Debug {
    fn filter(&self, request: &mut Parts);
}

/// Tower layer that runs a fixed chain of [`RequestFilter`]s
#[derive(Clone, Debug, Default)]
pub struct RequestFilterLayer {
    filters: Arc<[Arc<dyn RequestFilter>]>,
}

impl RequestFilterLayer {
    #[must_use]
    pub fn new(filters: Vec<Arc<dyn RequestFilter>>) -> Self {
        Self {
            filters: filters.into(),
        }
    }

    /// Number of filters in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl<S> Layer<S> for RequestFilterLayer {
    type Service = RequestFilterService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestFilterService {
            inner,
            filters: Arc::clone(&self.filters),
        }
    }
}

/// Service that applies request filters
#[derive(Clone, Debug)]
pub struct RequestFilterService<S> {
    inner: S,
    filters: Arc<[Arc<dyn RequestFilter>]>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RequestFilterService<S>
where
    S: Service<Request<ReqBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if self.filters.is_empty() {
            return self.inner.call(req);
        }
        let (mut parts, body) = req.into_parts();
        for filter in self.filters.iter() {
            filter.filter(&mut parts);
        }
        self.inner.call(Request::from_parts(parts, body))
    }
}
