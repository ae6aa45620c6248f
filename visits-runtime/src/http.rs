use {
    std::{convert::Infallible, pin::Pin, sync::Arc},
    hyper::{Response, body::Bytes},
    http_body_util::Full,
    visits_common::{HttpRequest, HttpResponse},
    crate::{
        handler::{CounterHandler, response_not_found},
        metrics::{Metrics, MetricGaugeDecreaseGuard},
    },
};

#[derive(Clone)]
pub struct HttpHandler {
    counter: CounterHandler,
    routes: Arc<RouteMatcher>,
    metrics: Metrics,
}

impl HttpHandler {
    pub fn new(counter: CounterHandler, routes: RouteMatcher, metrics: Metrics) -> Self {
        Self {
            counter,
            routes: Arc::new(routes),
            metrics,
        }
    }

    pub async fn handle(&self, request: HttpRequest) -> HttpResponse {
        let metric_guard_http_requests_in_flight = MetricGaugeDecreaseGuard::wrap(self.metrics.http_requests_in_flight.clone());

        let response = if self.routes.matches(request.path()) {
            self.counter.handle(request).await
        } else {
            response_not_found()
        };

        drop(metric_guard_http_requests_in_flight);
        self.metrics.http_requests_total.inc();

        response
    }
}

impl hyper::service::Service<hyper::Request<hyper::body::Incoming>> for HttpHandler {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: hyper::Request<hyper::body::Incoming>) -> Self::Future {
        let handler = self.clone();
        // request body is not used by the counter, only the head is kept
        let request = HttpRequest::from(&req);
        drop(req);

        Box::pin(async move {
            let visits_response = handler.handle(request).await;

            let mut response = Response::new(Full::new(Bytes::from(visits_response.body)));
            *response.status_mut() = visits_response.status;
            *response.headers_mut() = visits_response.headers;

            Ok(response)
        })
    }
}

/// Decides which request paths reach the counter handler.
#[derive(Debug, Clone, Default)]
pub struct RouteMatcher {
    routes: Vec<String>,
}

impl RouteMatcher {
    /// Routes ending with `/` match every path under them, other routes match exactly.
    /// No routes means every path matches.
    pub fn new(routes: Vec<String>) -> Self {
        Self { routes }
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.routes.is_empty() {
            return true;
        }

        self.routes.iter().any(|route| {
            if route.ends_with('/') {
                path.starts_with(route.as_str()) || path == route.trim_end_matches('/')
            } else {
                path == route
            }
        })
    }
}
