use {
    std::{convert::Infallible, net::SocketAddr, pin::Pin},
    tracing::{info, error},
    tokio::net::TcpListener,
    hyper::{Request, body::{Incoming, Bytes}, Response, server::conn::http1, StatusCode},
    hyper_util::rt::{TokioIo, TokioTimer},
    http_body_util::Full,
    thiserror::Error,
    prometheus::{
        TextEncoder,
        Registry,
        IntGauge,
        IntCounter,
        IntCounterVec,
        register_int_gauge_with_registry,
        register_int_counter_with_registry,
        register_int_counter_vec_with_registry,
    },
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub http_requests_total: IntCounter,
    pub http_requests_in_flight: IntGauge,

    pub counter_increments_total: IntCounter,
    pub counter_errors_total: IntCounterVec,
}

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("failed to collect: {reason}")]
    FailedToCollect {
        reason: String,
    },
    #[error("failed to register metric: {reason}")]
    FailedToRegister {
        reason: String,
    },
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let http_requests_total = register_int_counter_with_registry!("http_requests_total", "total http requests processed", registry)
            .map_err(|err| MetricsError::FailedToRegister { reason: format!("http_requests_total: {err:?}") })?;
        let http_requests_in_flight = register_int_gauge_with_registry!("http_requests_in_flight", "http requests being processed", registry)
            .map_err(|err| MetricsError::FailedToRegister { reason: format!("http_requests_in_flight: {err:?}") })?;
        let counter_increments_total = register_int_counter_with_registry!("counter_increments_total", "successfully applied counter increments", registry)
            .map_err(|err| MetricsError::FailedToRegister { reason: format!("counter_increments_total: {err:?}") })?;
        let counter_errors_total = register_int_counter_vec_with_registry!("counter_errors_total", "failed counter increments", &["kind"], registry)
            .map_err(|err| MetricsError::FailedToRegister { reason: format!("counter_errors_total: {err:?}") })?;

        Ok(Self {
            registry,
            http_requests_total,
            http_requests_in_flight,
            counter_increments_total,
            counter_errors_total,
        })
    }

    pub fn encode(&self) -> Result<String, MetricsError> {
        let metrics = self.registry.gather();
        let encoder = TextEncoder::new();
        encoder.encode_to_string(&metrics)
            .map_err(|err| MetricsError::FailedToCollect { reason: format!("{err:?}") })
    }
}

pub async fn run_metrics_server(metrics: Metrics, port: u16) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = match TcpListener::bind(addr).await {
        Ok(v) => v,
        Err(err) => {
            error!("failed to create TcpListener for metrics server: {err:?}");
            return;
        }
    };

    info!("running metrics server on {addr:?}");

    let metrics_server = MetricsServer::new(metrics);

    loop {
        let (tcp, _) = match listener.accept().await {
            Ok(v) => v,
            Err(err) => {
                error!("failed to accept connection in metrics server: {err:?}");
                continue;
            }
        };
        let io = TokioIo::new(tcp);
        let metrics_server = metrics_server.clone();
        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .timer(TokioTimer::new())
                .serve_connection(io, metrics_server)
                .await {
                    if err.is_timeout() || err.is_incomplete_message() {
                        // ignore non-critical errors caused by clients
                    } else {
                        error!("error while handling metrics request: {err:?}");
                    }
                }
        });
    }
}

#[derive(Clone)]
struct MetricsServer {
    metrics: Metrics,
}

impl MetricsServer {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            metrics,
        }
    }
}

impl hyper::service::Service<Request<Incoming>> for MetricsServer {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, _req: Request<Incoming>) -> Self::Future {
        let response = match self.metrics.encode() {
            Ok(v) => Response::new(Full::new(Bytes::from(v))),
            Err(err) => {
                error!("failed to encode metrics: {err:?}");
                let mut response = Response::new(Full::new(Bytes::from("failed to encode metrics.\n")));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        };
        Box::pin(async move { Ok(response) })
    }
}

/// Increments the gauge on creation and decrements it when dropped.
pub(crate) struct MetricGaugeDecreaseGuard {
    gauge: IntGauge,
}

impl MetricGaugeDecreaseGuard {
    pub(crate) fn wrap(gauge: IntGauge) -> Self {
        gauge.inc();
        Self { gauge }
    }
}

impl Drop for MetricGaugeDecreaseGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
