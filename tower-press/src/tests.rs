use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use http::Request;
use press_limit::BackPressure;
use press_limit::BackPressures;
use press_limit::Backpressure;
use press_limit::RateLimits;
use press_limit::Settings;
use tokio::time::Instant;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;

use super::*;

#[derive(Clone)]
struct MockService {
    count: Arc<AtomicUsize>,
    latency: Duration,
}

impl MockService {
    fn new(latency: Duration) -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            latency,
        }
    }

    fn calls(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Service<Request<()>> for MockService {
    type Response = &'static str;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<()>) -> Self::Future {
        self.count.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency;
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            Ok("ok")
        })
    }
}

#[derive(Clone)]
struct FailingService;

impl Service<Request<()>> for FailingService {
    type Response = &'static str;
    type Error = BoxError;
    type Future = futures::future::Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<()>) -> Self::Future {
        futures::future::ready(Err("database unavailable".into()))
    }
}

// Always answers with the same decision and counts how it is used.
#[derive(Debug)]
struct Scripted {
    decision: Decision,
    admits: AtomicUsize,
    records: AtomicUsize,
}

impl Scripted {
    fn new(decision: Decision) -> Arc<Self> {
        Arc::new(Self {
            decision,
            admits: AtomicUsize::new(0),
            records: AtomicUsize::new(0),
        })
    }

    fn admits(&self) -> usize {
        self.admits.load(Ordering::SeqCst)
    }

    fn records(&self) -> usize {
        self.records.load(Ordering::SeqCst)
    }
}

impl Backpressure for Scripted {
    fn admit(&self) -> Decision {
        self.admits.fetch_add(1, Ordering::SeqCst);
        self.decision.clone()
    }

    fn record(&self) {
        self.records.fetch_add(1, Ordering::SeqCst);
    }
}

fn scripted_table(timeout: Duration, decision: Decision) -> (RouteTable, Arc<Scripted>) {
    let scripted = Scripted::new(decision);
    let table = RouteTable::from_fn(timeout, |_| scripted.clone() as Arc<dyn Backpressure>);
    (table, scripted)
}

fn get(path: &str) -> Request<()> {
    Request::builder().uri(path).body(()).unwrap()
}

fn admission_error(err: BoxError) -> AdmissionError {
    match err.downcast::<AdmissionError>() {
        Ok(err) => *err,
        Err(err) => panic!("expected an AdmissionError, got {err}"),
    }
}

fn settings(back_pressure: BackPressure) -> AdmissionConfig {
    let settings = Settings {
        back_pressures: BackPressures::uniform(back_pressure),
        ..Settings::default()
    };
    AdmissionConfig::try_from(settings).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_allowed_request_reaches_the_handler() {
    let (table, scripted) = scripted_table(Duration::from_secs(5), Decision::Allow);
    let mock = MockService::new(Duration::ZERO);
    let mut svc = ServiceBuilder::new()
        .stac_admission(table)
        .service(mock.clone());

    let response = svc
        .ready()
        .await
        .unwrap()
        .call(get("/search"))
        .await
        .unwrap();

    assert_eq!(response, "ok");
    assert_eq!(mock.calls(), 1);
    assert_eq!(scripted.admits(), 1);
    assert_eq!(scripted.records(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delayed_request_waits_before_the_handler() {
    let delay = Duration::from_millis(200);
    let (table, scripted) = scripted_table(Duration::from_secs(5), Decision::Delay(delay));
    let mock = MockService::new(Duration::ZERO);
    let mut svc = AdmissionLayer::new(table, StacRouteClassifier::new()).layer(mock.clone());

    let start = Instant::now();
    let mut fut = Box::pin(svc.ready().await.unwrap().call(get("/collections/naip/items")));

    assert!(futures::poll!(&mut fut).is_pending());
    assert_eq!(mock.calls(), 0, "handler ran before the delay elapsed");
    assert_eq!(scripted.records(), 0);

    fut.await.unwrap();

    let elapsed = start.elapsed();
    assert!(elapsed >= delay, "waited only {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(mock.calls(), 1);
    assert_eq!(scripted.records(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_request_never_reaches_the_handler() {
    let reason = Reason::LimitReached {
        limit: 100,
        retry_after: Duration::from_millis(400),
    };
    let (table, scripted) =
        scripted_table(Duration::from_secs(5), Decision::Reject(reason.clone()));
    let mock = MockService::new(Duration::ZERO);
    let mut svc = AdmissionLayer::new(table, StacRouteClassifier::new()).layer(mock.clone());

    let err = svc
        .ready()
        .await
        .unwrap()
        .call(get("/search"))
        .await
        .unwrap_err();

    let err = admission_error(err);
    assert!(matches!(
        &err,
        AdmissionError::OverloadRejected { route: RouteClass::Search, reason: r } if *r == reason
    ));
    assert_eq!(err.retry_after(), Some(Duration::from_millis(400)));
    assert!(err.is_retryable());
    assert_eq!(mock.calls(), 0);
    // Rejected requests still count towards the observed load.
    assert_eq!(scripted.records(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delay_reaching_the_timeout_is_rejected_immediately() {
    let timeout = Duration::from_secs(2);
    let (table, scripted) = scripted_table(timeout, Decision::Delay(timeout));
    let mock = MockService::new(Duration::ZERO);
    let mut svc = AdmissionLayer::new(table, StacRouteClassifier::new()).layer(mock.clone());

    let start = Instant::now();
    let err = svc
        .ready()
        .await
        .unwrap()
        .call(get("/collections"))
        .await
        .unwrap_err();

    assert_eq!(start.elapsed(), Duration::ZERO, "rejection should not wait");
    assert!(matches!(
        admission_error(err),
        AdmissionError::OverloadRejected {
            route: RouteClass::Collections,
            reason: Reason::DelayExceedsTimeout { .. },
        }
    ));
    assert_eq!(mock.calls(), 0);
    assert_eq!(scripted.records(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_handler_times_out() {
    let timeout = Duration::from_secs(1);
    let (table, scripted) = scripted_table(timeout, Decision::Allow);
    let mock = MockService::new(Duration::from_secs(5));
    let mut svc = AdmissionLayer::new(table, StacRouteClassifier::new()).layer(mock.clone());

    let start = Instant::now();
    let err = svc
        .ready()
        .await
        .unwrap()
        .call(get("/collections/naip/items/tile-1"))
        .await
        .unwrap_err();

    let elapsed = start.elapsed();
    assert!(elapsed >= timeout && elapsed < Duration::from_secs(5));
    assert!(matches!(
        admission_error(err),
        AdmissionError::TimeoutExceeded { route: RouteClass::Item, timeout: t } if t == timeout
    ));
    assert_eq!(mock.calls(), 1);
    assert_eq!(scripted.records(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delay_counts_towards_the_timeout() {
    let timeout = Duration::from_secs(1);
    let (table, scripted) = scripted_table(timeout, Decision::Delay(Duration::from_millis(600)));
    // Either part alone fits in the timeout; together they do not.
    let mock = MockService::new(Duration::from_millis(600));
    let mut svc = AdmissionLayer::new(table, StacRouteClassifier::new()).layer(mock.clone());

    let err = svc
        .ready()
        .await
        .unwrap()
        .call(get("/collections/naip"))
        .await
        .unwrap_err();

    assert!(matches!(
        admission_error(err),
        AdmissionError::TimeoutExceeded {
            route: RouteClass::Collection,
            ..
        }
    ));
    assert_eq!(mock.calls(), 1);
    assert_eq!(scripted.records(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unclassified_requests_bypass_admission() {
    let reason = Reason::LimitReached {
        limit: 1,
        retry_after: Duration::from_secs(1),
    };
    let (table, scripted) = scripted_table(Duration::from_secs(1), Decision::Reject(reason));
    // Slower than the request timeout, which only applies to classified routes.
    let mock = MockService::new(Duration::from_secs(3));
    let mut svc = AdmissionLayer::new(table, StacRouteClassifier::new()).layer(mock.clone());

    for path in ["/", "/conformance", "/api"] {
        let response = svc.ready().await.unwrap().call(get(path)).await.unwrap();
        assert_eq!(response, "ok");
    }

    assert_eq!(mock.calls(), 3);
    assert_eq!(scripted.admits(), 0);
    assert_eq!(scripted.records(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_request_is_recorded_once() {
    let (table, scripted) =
        scripted_table(Duration::from_secs(5), Decision::Delay(Duration::from_secs(1)));
    let mock = MockService::new(Duration::ZERO);
    let mut svc = AdmissionLayer::new(table, StacRouteClassifier::new()).layer(mock.clone());

    let mut fut = Box::pin(svc.ready().await.unwrap().call(get("/search")));
    assert!(futures::poll!(&mut fut).is_pending());
    drop(fut);

    assert_eq!(mock.calls(), 0);
    assert_eq!(scripted.records(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_with_observed_load() {
    // A frozen clock keeps every request inside the first window.
    let (clock, _mock) = quanta::Clock::mock();
    let config = settings(BackPressure::new(2, 100));
    let table = RouteTable::with_clock(&config, clock);
    let mock = MockService::new(Duration::ZERO);
    let mut svc = AdmissionLayer::new(table, StacRouteClassifier::new()).layer(mock.clone());

    let expected = [0, 0, 0, 100, 200].map(Duration::from_millis);
    for (i, expected) in expected.into_iter().enumerate() {
        let start = Instant::now();
        svc.ready()
            .await
            .unwrap()
            .call(get("/search"))
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(5),
            "request {i}: expected {expected:?}, waited {elapsed:?}"
        );
    }
    assert_eq!(mock.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_shared_state_across_clones() {
    let (clock, _mock) = quanta::Clock::mock();
    let mut back_pressures = BackPressures::uniform(BackPressure::new(100, 10));
    back_pressures.set(RouteClass::Search, BackPressure::new(1, 10));
    let settings = Settings {
        rate_limits: RateLimits {
            search: Some(2),
            ..RateLimits::default()
        },
        back_pressures,
        ..Settings::default()
    };
    let config = AdmissionConfig::try_from(settings).unwrap();
    let layer = AdmissionLayer::new(
        RouteTable::with_clock(&config, clock),
        StacRouteClassifier::new(),
    );
    let mock = MockService::new(Duration::ZERO);

    let mut svc1 = layer.layer(mock.clone());
    let mut svc2 = svc1.clone();
    let mut svc3 = layer.layer(mock.clone());

    svc1.ready().await.unwrap().call(get("/search")).await.unwrap();
    svc2.ready().await.unwrap().call(get("/search")).await.unwrap();
    let err = svc3
        .ready()
        .await
        .unwrap()
        .call(get("/search"))
        .await
        .unwrap_err();

    assert!(matches!(
        admission_error(err),
        AdmissionError::OverloadRejected {
            reason: Reason::LimitReached { limit: 2, .. },
            ..
        }
    ));
    // Other routes have their own budget.
    svc3.ready()
        .await
        .unwrap()
        .call(get("/collections"))
        .await
        .unwrap();
    assert_eq!(mock.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_managed_layer_flattens_inner_errors() {
    let (table, _) = scripted_table(Duration::from_secs(5), Decision::Allow);
    let layer = ManagedAdmissionLayer::<_, Request<()>>::new(table, StacRouteClassifier::new());
    let mut svc = layer.layer(FailingService);

    let err = svc
        .ready()
        .await
        .unwrap()
        .call(get("/search"))
        .await
        .unwrap_err();

    match admission_error(err) {
        AdmissionError::Inner(message) => assert_eq!(message, "database unavailable"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_managed_layer_keeps_admission_errors() {
    let reason = Reason::LimitReached {
        limit: 5,
        retry_after: Duration::from_secs(1),
    };
    let (table, _) = scripted_table(Duration::from_secs(5), Decision::Reject(reason));
    let layer = ManagedAdmissionLayer::<_, Request<()>>::new(table, StacRouteClassifier::new());
    let mut svc = layer.layer(MockService::new(Duration::ZERO));

    let err = svc
        .ready()
        .await
        .unwrap()
        .call(get("/collections/naip/items"))
        .await
        .unwrap_err();

    assert!(matches!(
        admission_error(err),
        AdmissionError::OverloadRejected {
            route: RouteClass::Items,
            ..
        }
    ));
}

#[tokio::test]
async fn test_concurrent_requests_are_recorded_exactly_once() {
    let (table, scripted) = scripted_table(Duration::from_secs(5), Decision::Allow);
    let mock = MockService::new(Duration::from_millis(1));
    let layer = ManagedAdmissionLayer::<_, Request<()>>::new(table, StacRouteClassifier::new());
    let svc = layer.layer(mock.clone());

    let handles: Vec<_> = (0..64)
        .map(|i| {
            let svc = svc.clone();
            let path = if i % 2 == 0 { "/search" } else { "/collections" };
            tokio::spawn(svc.oneshot(get(path)))
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(mock.calls(), 64);
    assert_eq!(scripted.admits(), 64);
    assert_eq!(scripted.records(), 64);
}

#[tokio::test]
async fn test_closure_classifier() {
    let (table, scripted) = scripted_table(Duration::from_secs(5), Decision::Allow);
    let mock = MockService::new(Duration::ZERO);
    let classify = |req: &Request<()>| {
        (req.method() == http::Method::POST).then_some(RouteClass::Search)
    };
    let mut svc = ServiceBuilder::new()
        .route_admission(table, classify)
        .service(mock.clone());

    svc.ready().await.unwrap().call(get("/anything")).await.unwrap();
    assert_eq!(scripted.admits(), 0);

    let post = Request::builder()
        .method(http::Method::POST)
        .uri("/anything")
        .body(())
        .unwrap();
    svc.ready().await.unwrap().call(post).await.unwrap();
    assert_eq!(scripted.admits(), 1);
    assert_eq!(scripted.records(), 1);
    assert_eq!(mock.calls(), 2);
}
