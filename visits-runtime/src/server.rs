use {
    std::{net::SocketAddr, time::Duration},
    tracing::{info, warn, error},
    tokio::{net::TcpListener, time::sleep},
    hyper::server::conn::http1,
    hyper_util::rt::{TokioIo, TokioTimer},
    crate::{
        config::{ServerConfig, kv_from_config},
        error::ServerError,
        handler::CounterHandler,
        http::{HttpHandler, RouteMatcher},
        kv::BoxedStorage,
        metrics::{Metrics, run_metrics_server},
    },
};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct VisitsServer {
    config: ServerConfig,
    metrics: Metrics,
    counter: CounterHandler,
}

impl VisitsServer {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let storage = kv_from_config(&config.kv, config.counter_timeout())?;
        Self::with_storage(config, storage)
    }

    /// Used to run the server on top of a storage built outside of config, for example, in
    /// integration tests.
    pub fn with_storage(config: ServerConfig, storage: BoxedStorage) -> Result<Self, ServerError> {
        let metrics = Metrics::new()?;
        let counter = CounterHandler::new(
            storage,
            config.counter_key().into_bytes(),
            config.counter_timeout(),
            metrics.clone(),
        );

        Ok(Self {
            config,
            metrics,
            counter,
        })
    }

    pub fn counter(&self) -> &CounterHandler {
        &self.counter
    }

    pub fn http_handler(&self) -> HttpHandler {
        HttpHandler::new(self.counter.clone(), RouteMatcher::new(self.config.routes()), self.metrics.clone())
    }

    /// Runs http and metrics listeners until ctrl-c.
    pub async fn serve(&self) -> Result<(), ServerError> {
        info!("starting visits server");

        tokio::spawn(run_metrics_server(self.metrics.clone(), self.config.metrics_port()));

        let addr: SocketAddr = ([0, 0, 0, 0], self.config.http_port()).into();
        let listener = TcpListener::bind(addr).await
            .map_err(|err| ServerError::Bind { addr: addr.to_string(), reason: format!("{err:?}") })?;

        self.serve_listener(listener, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {err:?}");
                std::future::pending::<()>().await;
            }
        }).await;

        Ok(())
    }

    /// Serves http connections accepted on `listener` until `shutdown` resolves, then waits for
    /// in-flight connections to finish.
    pub async fn serve_listener(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        let graceful = hyper_util::server::graceful::GracefulShutdown::new();
        let http_handler = self.http_handler();
        tokio::pin!(shutdown);

        match listener.local_addr() {
            Ok(addr) => info!("started http server on {addr:?}"),
            Err(err) => warn!("started http server on unknown address: {err:?}"),
        }

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested - stopping http server.");
                    drop(listener);
                    break;
                },
                connection = listener.accept() => {
                    let (tcp, _) = match connection {
                        Ok(v) => v,
                        Err(err) => {
                            error!("failed to accept http connection: {err:?}");
                            continue;
                        }
                    };
                    let io = TokioIo::new(tcp);

                    let conn = http1::Builder::new()
                        .timer(TokioTimer::new())
                        .serve_connection(io, http_handler.clone());
                    let fut = graceful.watch(conn);
                    tokio::task::spawn(async move {
                        if let Err(err) = fut.await {
                            if err.is_timeout() {
                                // ignore timeouts, because those can be caused by client
                            } else if err.is_incomplete_message() {
                                // ignore incomplete messages, because those are caused by client
                            } else {
                                error!("error while handling http request: {err:?}");
                            }
                        }
                    });
                }
            }
        }

        tokio::select! {
            _ = graceful.shutdown() => info!("stopped http server."),
            _ = sleep(GRACEFUL_SHUTDOWN_TIMEOUT) => warn!("timed out waiting for http connections to close."),
        }
    }
}
