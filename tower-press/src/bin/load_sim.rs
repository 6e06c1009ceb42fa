use std::time::Duration;
use std::time::Instant;

use hdrhistogram::Histogram;
use http::Request;
use press_limit::AdmissionConfig;
use press_limit::BackPressure;
use press_limit::BackPressures;
use press_limit::RateLimits;
use press_limit::RouteTable;
use press_limit::Settings;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio::time::sleep;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;
use tower::service_fn;
use tower_press::AdmissionError;
use tower_press::ManagedAdmissionLayer;
use tower_press::StacRouteClassifier;
use tracing_subscriber::EnvFilter;

async fn mock_search(_req: Request<()>) -> Result<&'static str, BoxError> {
    // Simulate a short database query
    sleep(Duration::from_millis(5)).await;
    Ok("success")
}

#[derive(Default)]
struct Outcomes {
    immediate: usize,
    delayed: usize,
    rejected: usize,
    timeouts: usize,
    inner: usize,
}

async fn run_phase<S>(name: &str, svc: S, offered_rps: u32, duration: Duration)
where
    S: Service<Request<()>, Response = &'static str, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send,
{
    let mut hist_elapsed = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();
    let mut outcomes = Outcomes::default();
    let mut tasks = JoinSet::new();

    let mut ticker = tokio::time::interval(Duration::from_secs(1) / offered_rps);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    let start = Instant::now();
    while start.elapsed() < duration {
        ticker.tick().await;
        let svc = svc.clone();
        tasks.spawn(async move {
            let req = Request::builder()
                .uri("/search")
                .body(())
                .expect("static request is valid");
            let req_start = Instant::now();
            let res = svc.oneshot(req).await;
            (res, req_start.elapsed())
        });
    }

    let mut total = 0;
    while let Some(task) = tasks.join_next().await {
        let (res, elapsed) = task.expect("Task panicked");
        total += 1;
        match res {
            Ok(_) => {
                // Anything well above the handler latency was held back.
                if elapsed > Duration::from_millis(8) {
                    outcomes.delayed += 1;
                } else {
                    outcomes.immediate += 1;
                }
                hist_elapsed.record(elapsed.as_micros() as u64).unwrap();
            }
            Err(e) => match e.downcast_ref::<AdmissionError>() {
                Some(AdmissionError::OverloadRejected { .. }) => outcomes.rejected += 1,
                Some(AdmissionError::TimeoutExceeded { .. }) => outcomes.timeouts += 1,
                _ => outcomes.inner += 1,
            },
        }
    }

    let total_duration = start.elapsed();
    let served = outcomes.immediate + outcomes.delayed;

    println!("--- {} ---", name);
    println!("Total Duration:  {:.2?}", total_duration);
    println!("Offered Rate:    {} req/sec", offered_rps);
    println!(
        "Served Rate:     {:.2} req/sec (Goodput)",
        served as f64 / total_duration.as_secs_f64()
    );
    println!("Served/Total:    {}/{}", served, total);
    println!("  └─ Immediate:  {}", outcomes.immediate);
    println!("  └─ Delayed:    {}", outcomes.delayed);

    if served > 0 {
        println!("P50 (Elapsed):   {}µs", hist_elapsed.value_at_quantile(0.5));
        println!(
            "P99 (Elapsed):   {}µs",
            hist_elapsed.value_at_quantile(0.99)
        );
    }

    let total_errors = outcomes.rejected + outcomes.timeouts + outcomes.inner;
    println!("Errors:          {}", total_errors);
    if total_errors > 0 {
        println!("  └─ Rejected:   {}", outcomes.rejected);
        println!("  └─ Timeouts:   {}", outcomes.timeouts);
        if outcomes.inner > 0 {
            println!("  └─ Inner:      {}", outcomes.inner);
        }
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("press_limit=info,tower_press=error")),
        )
        .init();

    let settings = Settings {
        rate_limits: RateLimits {
            search: Some(250),
            ..RateLimits::default()
        },
        back_pressures: BackPressures::uniform(BackPressure::new(100, 10)),
        request_timeout: 2,
        ..Settings::default()
    };
    let config = AdmissionConfig::try_from(settings)?;
    let phase = Duration::from_secs(3);

    println!("Route: search (target 100 req/sec, +10ms per excess request, ceiling 250)\n");

    for offered_rps in [50, 100, 150, 200, 300] {
        // Fresh controllers so each phase starts from an idle route.
        let layer = ManagedAdmissionLayer::<_, Request<()>>::new(
            RouteTable::new(&config),
            StacRouteClassifier::new(),
        );
        let svc = layer.layer(service_fn(mock_search));
        let name = format!("Search @ {offered_rps} req/sec");
        run_phase(&name, svc, offered_rps, phase).await;
    }

    Ok(())
}
