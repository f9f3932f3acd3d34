//! Per-call metrics decoration of client factories.

use async_trait::async_trait;
use http::{Method, StatusCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::client::RegistryHttpClient;
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::factory::TransportClientFactory;
use crate::request::TransportRequest;
use crate::response::TransportResponse;

/// How a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// A response was received, whatever its status
    Status(StatusCode),
    /// The call failed; carries [`TransportError::kind`]
    Error(&'static str),
}

/// One observed call
#[derive(Debug, Clone)]
pub struct CallObservation {
    pub endpoint: Endpoint,
    pub method: Method,
    pub outcome: CallOutcome,
    pub latency: Duration,
}

impl CallObservation {
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self.outcome {
            CallOutcome::Status(status) => Some(status),
            CallOutcome::Error(_) => None,
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, CallOutcome::Error(_))
    }
}

/// Sink for call observations.
///
/// Called inline on the request path, so implementations must not block.
pub trait MetricsRecorder: Send + Sync {
    fn record(&self, observation: &CallObservation);
}

/// Recorder emitting one `tracing` event per call
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetricsRecorder;

impl MetricsRecorder for TracingMetricsRecorder {
    fn record(&self, observation: &CallObservation) {
        let latency_ms = u64::try_from(observation.latency.as_millis()).unwrap_or(u64::MAX);
        match observation.outcome {
            CallOutcome::Status(status) => tracing::debug!(
                target: "discovery_transport::metrics",
                endpoint = %observation.endpoint,
                method = %observation.method,
                status = status.as_u16(),
                latency_ms,
                "registry call completed"
            ),
            CallOutcome::Error(kind) => tracing::debug!(
                target: "discovery_transport::metrics",
                endpoint = %observation.endpoint,
                method = %observation.method,
                error = kind,
                latency_ms,
                "registry call failed"
            ),
        }
    }
}

/// Factory decorator whose clients report every call to a recorder.
///
/// Owns the wrapped factory; `shutdown` is forwarded to it once.
pub struct MetricsClientFactory<F> {
    inner: F,
    recorder: Arc<dyn MetricsRecorder>,
    shut_down: AtomicBool,
}

impl<F> MetricsClientFactory<F> {
    pub fn new(inner: F, recorder: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            inner,
            recorder,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Wrapped factory
    pub fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: std::fmt::Debug> std::fmt::Debug for MetricsClientFactory<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsClientFactory")
            .field("inner", &self.inner)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<F: TransportClientFactory> TransportClientFactory for MetricsClientFactory<F> {
    fn new_client(&self, endpoint: &Endpoint) -> Arc<dyn RegistryHttpClient> {
        Arc::new(MetricsCollectingClient {
            inner: self.inner.new_client(endpoint),
            recorder: Arc::clone(&self.recorder),
        })
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown();
        tracing::info!("metrics client factory shut down");
    }
}

/// Client recording status and latency of each call it forwards
pub struct MetricsCollectingClient {
    inner: Arc<dyn RegistryHttpClient>,
    recorder: Arc<dyn MetricsRecorder>,
}

#[async_trait]
impl RegistryHttpClient for MetricsCollectingClient {
    fn endpoint(&self) -> &Endpoint {
        self.inner.endpoint()
    }

    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let method = request.method().clone();
        let started = Instant::now();
        let result = self.inner.execute(request).await;

        let outcome = match &result {
            Ok(response) => CallOutcome::Status(response.status()),
            Err(err) => CallOutcome::Error(err.kind()),
        };
        self.recorder.record(&CallObservation {
            endpoint: self.inner.endpoint().clone(),
            method,
            outcome,
            latency: started.elapsed(),
        });
        result
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
pub(crate) mod tests {
    use super::*;
    use bytes::Bytes;
    use http::HeaderMap;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    use crate::codec::Codecs;

    /// Recorder keeping every observation
    #[derive(Default)]
    pub(crate) struct CollectingRecorder {
        observations: Mutex<Vec<CallObservation>>,
    }

    impl CollectingRecorder {
        pub(crate) fn observations(&self) -> Vec<CallObservation> {
            self.observations.lock().clone()
        }
    }

    impl MetricsRecorder for CollectingRecorder {
        fn record(&self, observation: &CallObservation) {
            self.observations.lock().push(observation.clone());
        }
    }

    /// Client answering from a fixed script
    struct ScriptedClient {
        endpoint: Endpoint,
        fail: bool,
    }

    #[async_trait]
    impl RegistryHttpClient for ScriptedClient {
        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }

        async fn execute(
            &self,
            _request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            if self.fail {
                return Err(TransportError::ConnectTimeout(Duration::from_secs(5)));
            }
            Ok(TransportResponse::new(
                StatusCode::NO_CONTENT,
                HeaderMap::new(),
                Bytes::new(),
                Codecs::default(),
            ))
        }
    }

    #[derive(Default)]
    struct ScriptedFactory {
        fail: bool,
        shutdowns: AtomicUsize,
    }

    impl TransportClientFactory for ScriptedFactory {
        fn new_client(&self, endpoint: &Endpoint) -> Arc<dyn RegistryHttpClient> {
            Arc::new(ScriptedClient {
                endpoint: endpoint.clone(),
                fail: self.fail,
            })
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("http://registry-1:8761/eureka/v2").unwrap()
    }

    #[tokio::test]
    async fn test_each_failure_recorded() {
        let recorder = Arc::new(CollectingRecorder::default());
        let factory = MetricsClientFactory::new(
            ScriptedFactory {
                fail: true,
                ..ScriptedFactory::default()
            },
            recorder.clone(),
        );
        let client = factory.new_client(&endpoint());

        for _ in 0..3 {
            let err = client.get("apps/").await.unwrap_err();
            assert!(err.is_timeout());
        }

        let observations = recorder.observations();
        assert_eq!(observations.len(), 3);
        for observation in &observations {
            assert_eq!(observation.outcome, CallOutcome::Error("connect_timeout"));
            assert_eq!(observation.method, Method::GET);
            assert_eq!(observation.endpoint, endpoint());
        }
    }

    #[tokio::test]
    async fn test_status_recorded_and_response_untouched() {
        let recorder = Arc::new(CollectingRecorder::default());
        let factory = MetricsClientFactory::new(ScriptedFactory::default(), recorder.clone());
        let client = factory.new_client(&endpoint());
        assert_eq!(client.endpoint(), &endpoint());

        let response = client.delete("apps/BILLING/i-42").await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.body().is_empty());

        let observations = recorder.observations();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].status(), Some(StatusCode::NO_CONTENT));
        assert_eq!(observations[0].method, Method::DELETE);
        assert!(!observations[0].is_error());
    }

    #[test]
    fn test_shutdown_forwarded_once() {
        let factory = MetricsClientFactory::new(
            ScriptedFactory::default(),
            Arc::new(TracingMetricsRecorder),
        );
        factory.shutdown();
        factory.shutdown();
        factory.shutdown();
        assert_eq!(factory.inner().shutdowns.load(Ordering::SeqCst), 1);
    }
}
