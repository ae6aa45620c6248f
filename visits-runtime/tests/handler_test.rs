use {
    std::time::Duration,
    rusqlite::Connection,
    hyper::{Method, StatusCode, header},
    tracing::Level,
    tracing_subscriber::layer::SubscriberExt,
    visits_common::HttpRequest,
    visits_runtime::{
        CounterHandler,
        error::CounterError,
        http::{HttpHandler, RouteMatcher},
        kv::{BoxedStorage, KVStorage, MemoryStorage, SqliteStorage, StorageError, WithKey},
        metrics::Metrics,
    },
    crate::{
        logger::TestLogger,
        storage::{FailingStorage, SlowCommitStorage, StalledStorage},
    },
};


const KEY: &[u8] = b"visits";

fn handler(storage: BoxedStorage) -> CounterHandler {
    CounterHandler::new(storage, KEY, Duration::from_secs(3), Metrics::new().unwrap())
}

fn body_json(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn first_invocation_creates_record() {
    let storage = BoxedStorage::new(MemoryStorage::new());
    let response = handler(storage.clone()).handle(HttpRequest::new()).await;

    assert_eq!(StatusCode::OK, response.status);
    assert_eq!(serde_json::json!({ "count": 1 }), body_json(&response.body));
    assert_eq!("application/json", response.headers().get(header::CONTENT_TYPE).unwrap());
    assert_eq!("*", response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap());
    assert_eq!(Some(1), storage.get(KEY).unwrap());
}

#[tokio::test]
async fn returns_total_after_increment() {
    let storage = BoxedStorage::new(MemoryStorage::new()).with_key(KEY, 41).unwrap();
    let response = handler(storage.clone()).handle(HttpRequest::new()).await;

    assert_eq!(b"{\"count\":42}".to_vec(), response.body);
    assert_eq!(Some(42), storage.get(KEY).unwrap());
}

#[tokio::test]
async fn every_invocation_counts() {
    let storage = BoxedStorage::new(MemoryStorage::new());
    let handler = handler(storage.clone());

    for expected in 1..=5 {
        assert_eq!(Ok(expected), handler.increment().await);
    }
    assert_eq!(Some(5), storage.get(KEY).unwrap());
}

#[tokio::test]
async fn store_unavailable() {
    let memory = MemoryStorage::new().with_key(KEY, 7).unwrap();
    let storage = BoxedStorage::new(FailingStorage::unavailable(memory));
    let response = handler(storage.clone()).handle(HttpRequest::new()).await;

    assert_eq!(StatusCode::SERVICE_UNAVAILABLE, response.status);
    assert_eq!("*", response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap());
    assert!(serde_json::from_slice::<serde_json::Value>(&response.body).is_err());
    assert_eq!(Some(7), storage.get(KEY).unwrap());
}

#[tokio::test]
async fn store_throttled() {
    let storage = BoxedStorage::new(FailingStorage::new(
        MemoryStorage::new(),
        StorageError::Throttled { description: "database is locked".to_owned() },
    ));
    let response = handler(storage).handle(HttpRequest::new()).await;

    assert_eq!(StatusCode::SERVICE_UNAVAILABLE, response.status);
    assert_eq!(b"visits: counter store throttled.\n".to_vec(), response.body);
}

#[tokio::test]
async fn store_malformed_result() {
    let storage = BoxedStorage::new(FailingStorage::new(
        MemoryStorage::new(),
        StorageError::MalformedValue { description: "expected integer, got: Text(\"abc\")".to_owned() },
    ));
    let response = handler(storage).handle(HttpRequest::new()).await;

    assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, response.status);
    assert_eq!("*", response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap());
}

#[tokio::test]
async fn store_timeout() {
    let memory = MemoryStorage::new().with_key(KEY, 3).unwrap();
    let storage = BoxedStorage::new(StalledStorage::new(memory, Duration::from_millis(500)));
    let handler = CounterHandler::new(storage.clone(), KEY, Duration::from_millis(50), Metrics::new().unwrap());

    let response = handler.handle(HttpRequest::new()).await;

    assert_eq!(StatusCode::GATEWAY_TIMEOUT, response.status);
    assert_eq!("*", response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap());
    assert_eq!(Some(3), storage.get(KEY).unwrap());

    // the stalled call reaches the store after the response was sent
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(Some(3), storage.get(KEY).unwrap());
}

#[tokio::test]
async fn sqlite_increment_after_timeout_is_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("visits.sqlite");
    let storage = BoxedStorage::new(SqliteStorage::new(&path).unwrap()).with_key(KEY, 41).unwrap();

    let lock = Connection::open(&path).unwrap();
    lock.execute_batch("begin exclusive").unwrap();

    let handler = CounterHandler::new(storage.clone(), KEY, Duration::from_millis(100), Metrics::new().unwrap());
    let response = handler.handle(HttpRequest::new()).await;
    assert_eq!(StatusCode::GATEWAY_TIMEOUT, response.status);

    lock.execute_batch("rollback").unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(Some(41), storage.get(KEY).unwrap());

    let handler = CounterHandler::new(storage.clone(), KEY, Duration::from_secs(3), Metrics::new().unwrap());
    assert_eq!(Ok(42), handler.increment().await);
}

#[tokio::test]
async fn increment_already_committing_is_awaited() {
    let storage = BoxedStorage::new(SlowCommitStorage::new(MemoryStorage::new(), Duration::from_millis(200)));
    let handler = CounterHandler::new(storage.clone(), KEY, Duration::from_millis(20), Metrics::new().unwrap());

    assert_eq!(Ok(1), handler.increment().await);
    assert_eq!(Some(1), storage.get(KEY).unwrap());
}

#[tokio::test]
async fn timeout_is_reported_as_error() {
    let storage = BoxedStorage::new(StalledStorage::new(MemoryStorage::new(), Duration::from_millis(300)));
    let handler = CounterHandler::new(storage, KEY, Duration::from_millis(20), Metrics::new().unwrap());

    assert_eq!(
        Err(CounterError::StoreTimeout { timeout: Duration::from_millis(20) }),
        handler.increment().await
    );
}

#[tokio::test]
async fn preflight_does_not_touch_store() {
    let storage = BoxedStorage::new(MemoryStorage::new());
    let request = HttpRequest::new().with_method(Method::OPTIONS);
    let response = handler(storage.clone()).handle(request).await;

    assert_eq!(StatusCode::NO_CONTENT, response.status);
    assert_eq!("*", response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap());
    assert_eq!("GET", response.headers().get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap());
    assert!(response.body.is_empty());
    assert_eq!(None, storage.get(KEY).unwrap());
}

#[tokio::test]
async fn other_methods_are_rejected() {
    let storage = BoxedStorage::new(MemoryStorage::new());
    let handler = handler(storage.clone());

    for method in [Method::POST, Method::PUT, Method::DELETE, Method::HEAD] {
        let response = handler.handle(HttpRequest::new().with_method(method)).await;
        assert_eq!(StatusCode::METHOD_NOT_ALLOWED, response.status);
        assert_eq!("GET", response.headers().get(header::ALLOW).unwrap());
        assert_eq!("*", response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap());
    }
    assert_eq!(None, storage.get(KEY).unwrap());
}

#[tokio::test]
async fn concurrent_increments_lose_nothing() {
    let storage = BoxedStorage::new(MemoryStorage::new());
    let handler = handler(storage.clone());

    let tasks = (0..100)
        .map(|_| {
            let handler = handler.clone();
            tokio::spawn(async move { handler.increment().await })
        })
        .collect::<Vec<_>>();

    let mut counts = Vec::new();
    for task in tasks {
        counts.push(task.await.unwrap().unwrap());
    }
    counts.sort();

    assert_eq!((1..=100).collect::<Vec<u64>>(), counts);
    assert_eq!(Some(100), storage.get(KEY).unwrap());
}

#[tokio::test]
async fn metrics_track_increments_and_errors() {
    let metrics = Metrics::new().unwrap();
    let ok = CounterHandler::new(BoxedStorage::new(MemoryStorage::new()), KEY, Duration::from_secs(1), metrics.clone());
    let failing = CounterHandler::new(
        BoxedStorage::new(FailingStorage::unavailable(MemoryStorage::new())),
        KEY,
        Duration::from_secs(1),
        metrics.clone(),
    );

    ok.increment().await.unwrap();
    ok.increment().await.unwrap();
    failing.increment().await.unwrap_err();

    assert_eq!(2, metrics.counter_increments_total.get());
    assert_eq!(1, metrics.counter_errors_total.with_label_values(&["unavailable"]).get());

    let encoded = metrics.encode().unwrap();
    assert!(encoded.contains("counter_increments_total 2"));
    assert!(encoded.contains("counter_errors_total{kind=\"unavailable\"} 1"));
}

#[tokio::test]
async fn failures_are_logged() {
    let logger = TestLogger::new();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(logger.clone()));

    let storage = BoxedStorage::new(FailingStorage::unavailable(MemoryStorage::new()));
    handler(storage).handle(HttpRequest::new()).await;

    let events = logger.events();
    let event = events.iter()
        .find(|event| event.fields.get("kind").map(|v| v.as_str()) == Some("unavailable"))
        .unwrap();
    assert_eq!(Level::ERROR, event.level);
    assert!(event.fields.get("message").unwrap().contains("connection refused"));
}

#[tokio::test]
async fn http_handler_routes() {
    let storage = BoxedStorage::new(MemoryStorage::new());
    let metrics = Metrics::new().unwrap();
    let http = HttpHandler::new(
        CounterHandler::new(storage.clone(), KEY, Duration::from_secs(1), metrics.clone()),
        RouteMatcher::new(vec!["/api/".to_owned()]),
        metrics,
    );

    let response = http.handle(HttpRequest::new().with_url("/api/count?ref=home").unwrap()).await;
    assert_eq!(StatusCode::OK, response.status);

    let response = http.handle(HttpRequest::new().with_url("/about").unwrap()).await;
    assert_eq!(StatusCode::NOT_FOUND, response.status);
    assert_eq!("*", response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap());

    assert_eq!(Some(1), storage.get(KEY).unwrap());
}

#[tokio::test]
async fn http_handler_tracks_requests() {
    let storage = BoxedStorage::new(StalledStorage::new(MemoryStorage::new(), Duration::from_millis(300)));
    let metrics = Metrics::new().unwrap();
    let http = HttpHandler::new(
        CounterHandler::new(storage, KEY, Duration::from_secs(3), metrics.clone()),
        RouteMatcher::new(Vec::new()),
        metrics.clone(),
    );

    let in_flight = tokio::spawn({
        let http = http.clone();
        async move { http.handle(HttpRequest::new()).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(1, metrics.http_requests_in_flight.get());
    assert_eq!(0, metrics.http_requests_total.get());

    assert_eq!(StatusCode::OK, in_flight.await.unwrap().status);
    http.handle(HttpRequest::new().with_method(Method::OPTIONS)).await;

    assert_eq!(0, metrics.http_requests_in_flight.get());
    assert_eq!(2, metrics.http_requests_total.get());

    let encoded = metrics.encode().unwrap();
    assert!(encoded.contains("http_requests_total 2"));
    assert!(encoded.contains("http_requests_in_flight 0"));
}

#[test]
fn route_matching() {
    let any = RouteMatcher::new(Vec::new());
    assert!(any.matches("/"));
    assert!(any.matches("/anything/at/all"));

    let routes = RouteMatcher::new(vec!["/count".to_owned(), "/api/".to_owned()]);
    assert!(routes.matches("/count"));
    assert!(routes.matches("/api"));
    assert!(routes.matches("/api/"));
    assert!(routes.matches("/api/count"));
    assert!(!routes.matches("/count/"));
    assert!(!routes.matches("/apiary"));
    assert!(!routes.matches("/"));
}
