use {
    std::time::Duration,
    tracing::{error, warn},
    tokio::time::timeout,
    hyper::{Method, StatusCode, header::{self, HeaderValue}},
    visits_common::{HttpRequest, HttpResponse, CountResponse, ALLOWED_METHODS},
    crate::{
        kv::{BoxedStorage, CommitGuard, KVStorage, StorageError},
        error::CounterError,
        metrics::Metrics,
    },
};

/// Visit counter. Holds no state of its own: every invocation goes to the store.
#[derive(Clone)]
pub struct CounterHandler {
    storage: BoxedStorage,
    key: Vec<u8>,
    timeout: Duration,
    metrics: Metrics,
}

impl CounterHandler {
    pub fn new(storage: BoxedStorage, key: impl Into<Vec<u8>>, timeout: Duration, metrics: Metrics) -> Self {
        Self {
            storage,
            key: key.into(),
            timeout,
            metrics,
        }
    }

    pub async fn handle(&self, request: HttpRequest) -> HttpResponse {
        let response = match request.method {
            Method::GET => match self.increment().await {
                Ok(count) => response_count(count),
                Err(err) => response_counter_error(&err),
            },
            Method::OPTIONS => response_preflight(),
            _ => response_method_not_allowed(),
        };

        response.with_cors()
    }

    /// Applies one atomic increment and returns the new total.
    ///
    /// The store call runs on the blocking pool and is bounded by the handler timeout. On timeout
    /// the pending update is cancelled and the stored count stays as it was. If the
    /// store has already started committing, the handler waits for the outcome instead.
    pub async fn increment(&self) -> Result<u64, CounterError> {
        let storage = self.storage.clone();
        let key = self.key.clone();
        let guard = CommitGuard::new();
        let mut task = tokio::task::spawn_blocking({
            let guard = guard.clone();
            move || storage.increment_guarded(&key, 1, &guard)
        });

        let joined = match timeout(self.timeout, &mut task).await {
            Ok(v) => v,
            Err(_elapsed) if guard.cancel() => return self.record(Err(CounterError::StoreTimeout { timeout: self.timeout })),
            Err(_elapsed) => {
                warn!(timeout = ?self.timeout, "counter store exceeded timeout while committing, waiting for result");
                task.await
            },
        };

        let result = match joined {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(StorageError::Cancelled)) => Err(CounterError::StoreTimeout { timeout: self.timeout }),
            Ok(Err(err)) => Err(CounterError::from(err)),
            Err(err) => Err(CounterError::TaskFailed { reason: format!("{err:?}") }),
        };

        self.record(result)
    }

    fn record(&self, result: Result<u64, CounterError>) -> Result<u64, CounterError> {
        match &result {
            Ok(_) => self.metrics.counter_increments_total.inc(),
            Err(err) => {
                self.metrics.counter_errors_total.with_label_values(&[err.kind()]).inc();
                match err {
                    CounterError::StoreThrottled { .. } | CounterError::StoreTimeout { .. } => warn!(kind = err.kind(), "failed to increment counter: {err}"),
                    _ => error!(kind = err.kind(), "failed to increment counter: {err}"),
                }
            }
        }

        result
    }
}

fn response_count(count: u64) -> HttpResponse {
    match HttpResponse::new().with_json(&CountResponse::new(count)) {
        Ok(v) => v,
        Err(err) => {
            error!("failed to serialize count response: {err:?}");
            response_internal_error()
        }
    }
}

fn response_counter_error(err: &CounterError) -> HttpResponse {
    HttpResponse::new().with_status(err.status()).with_text(err.response_text())
}

fn response_preflight() -> HttpResponse {
    HttpResponse::new()
        .with_status(StatusCode::NO_CONTENT)
        .with_header(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOWED_METHODS))
        .with_header(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("content-type"))
        .with_header(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"))
}

fn response_method_not_allowed() -> HttpResponse {
    HttpResponse::new()
        .with_status(StatusCode::METHOD_NOT_ALLOWED)
        .with_header(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS))
        .with_text("visits: method not allowed.\n")
}

fn response_internal_error() -> HttpResponse {
    HttpResponse::new().with_status(StatusCode::INTERNAL_SERVER_ERROR).with_text("visits: internal error.\n")
}

pub(crate) fn response_not_found() -> HttpResponse {
    HttpResponse::new().with_status(StatusCode::NOT_FOUND).with_text("visits: not found.\n").with_cors()
}
