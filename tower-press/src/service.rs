use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::ready;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use pin_project_lite::pin_project;
use tokio::time::Sleep;
use tokio::time::sleep;
use tower::BoxError;
use tower::Service;

use press_limit::Backpressure;
use press_limit::Decision;
use press_limit::Reason;
use press_limit::RouteClass;
use press_limit::RouteTable;

use crate::classify::Classify;
use crate::error::AdmissionError;

#[derive(Clone, Debug)]
struct AdmissionMetrics {
    decisions: Counter<u64>,
    timeouts: Counter<u64>,
    delay_ms: Histogram<f64>,
}

impl AdmissionMetrics {
    fn new() -> Self {
        let meter = global::meter("admission_service");
        Self {
            decisions: meter.u64_counter("admission_decisions").build(),
            timeouts: meter.u64_counter("admission_timeouts").build(),
            delay_ms: meter.f64_histogram("admission_delay_ms").build(),
        }
    }

    fn decision(&self, route: Option<RouteClass>, outcome: &'static str) {
        let route = route.map_or("unclassified", RouteClass::as_str);
        self.decisions.add(
            1,
            &[KeyValue::new("route", route), KeyValue::new("outcome", outcome)],
        );
    }
}

/// Applies per-route backpressure to requests before they reach `inner`.
#[derive(Debug)]
pub struct AdmissionService<S, C> {
    inner: S,
    routes: RouteTable,
    classifier: C,
    instruments: AdmissionMetrics,
}

impl<S, C> Clone for AdmissionService<S, C>
where
    S: Clone,
    C: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            routes: self.routes.clone(),
            classifier: self.classifier.clone(),
            instruments: self.instruments.clone(),
        }
    }
}

impl<S, C> AdmissionService<S, C> {
    pub fn new(inner: S, routes: RouteTable, classifier: C) -> Self {
        Self {
            inner,
            routes,
            classifier,
            instruments: AdmissionMetrics::new(),
        }
    }
}

/// Records the request on its route exactly once, whenever it is dropped.
struct Completion {
    route: RouteClass,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    controller: Arc<dyn Backpressure>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.controller.record();
    }
}

pin_project! {
    #[project = StateProj]
    enum State<S, F, Req> {
        Passthrough {
            #[pin]
            future: F,
        },
        Delayed {
            sleep: Pin<Box<Sleep>>,
            pending: Option<(S, Req)>,
        },
        Running {
            #[pin]
            future: F,
        },
        Rejected {
            error: AdmissionError,
        },
        Done,
    }
}

pin_project! {
    /// Response future of [`AdmissionService`].
    ///
    /// Classified requests carry a deadline covering both the backoff delay and
    /// the inner call; dropping this future cancels whichever is in flight.
    pub struct ResponseFuture<S, F, Req> {
        #[pin]
        state: State<S, F, Req>,
        completion: Option<Completion>,
        instruments: AdmissionMetrics,
    }
}

impl<S, F, Req> ResponseFuture<S, F, Req> {
    fn new(
        state: State<S, F, Req>,
        completion: Option<Completion>,
        instruments: &AdmissionMetrics,
    ) -> Self {
        Self {
            state,
            completion,
            instruments: instruments.clone(),
        }
    }
}

impl<S, F, Req> Future for ResponseFuture<S, F, Req>
where
    S: Service<Req, Future = F, Error = BoxError>,
    F: Future<Output = Result<S::Response, BoxError>>,
{
    type Output = Result<S::Response, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        if let Some(completion) = this.completion.as_mut()
            && completion.deadline.as_mut().poll(cx).is_ready()
        {
            let route = completion.route;
            let timeout = completion.timeout;
            tracing::warn!(route = %route, ?timeout, "request timed out");
            this.instruments
                .timeouts
                .add(1, &[KeyValue::new("route", route.as_str())]);

            // Dropping the state cancels the in-flight delay or inner future.
            this.state.set(State::Done);
            this.completion.take();
            return Poll::Ready(Err(Box::new(AdmissionError::TimeoutExceeded {
                route,
                timeout,
            })));
        }

        loop {
            match this.state.as_mut().project() {
                StateProj::Passthrough { future } => return future.poll(cx),
                StateProj::Delayed { sleep, pending } => {
                    ready!(sleep.as_mut().poll(cx));
                    let Some((mut service, req)) = pending.take() else {
                        unreachable!("delayed request resumed twice");
                    };
                    let future = service.call(req);
                    this.state.set(State::Running { future });
                }
                StateProj::Running { future } => {
                    let output = ready!(future.poll(cx));
                    this.completion.take();
                    this.state.set(State::Done);
                    return Poll::Ready(output);
                }
                StateProj::Rejected { error } => {
                    let error = error.clone();
                    this.completion.take();
                    this.state.set(State::Done);
                    return Poll::Ready(Err(Box::new(error)));
                }
                StateProj::Done => panic!("ResponseFuture polled after completion"),
            }
        }
    }
}

impl<S, C, Req> Service<Req> for AdmissionService<S, C>
where
    S: Service<Req, Error = BoxError> + Clone,
    C: Classify<Req>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = ResponseFuture<S, S::Future, Req>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let Some(route) = self.classifier.classify(&req) else {
            self.instruments.decision(None, "bypass");
            let state = State::Passthrough {
                future: self.inner.call(req),
            };
            return ResponseFuture::new(state, None, &self.instruments);
        };

        let controller = Arc::clone(self.routes.controller(route));
        let timeout = self.routes.request_timeout();
        let decision = controller.admit();
        // The deadline runs from arrival, so it also bounds any delay below.
        let completion = Completion {
            route,
            timeout,
            deadline: Box::pin(sleep(timeout)),
            controller,
        };

        let state = match decision {
            Decision::Allow => {
                self.instruments.decision(Some(route), "allow");
                State::Running {
                    future: self.inner.call(req),
                }
            }
            Decision::Delay(delay) if delay >= timeout => {
                self.reject(route, Reason::DelayExceedsTimeout { delay, timeout })
            }
            Decision::Delay(delay) => {
                tracing::debug!(route = %route, ?delay, "delaying request");
                self.instruments.decision(Some(route), "delay");
                self.instruments.delay_ms.record(
                    delay.as_secs_f64() * 1000.0,
                    &[KeyValue::new("route", route.as_str())],
                );

                // Take the service that was driven to readiness and leave a
                // fresh clone behind for the next request.
                let clone = self.inner.clone();
                let service = std::mem::replace(&mut self.inner, clone);
                State::Delayed {
                    sleep: Box::pin(sleep(delay)),
                    pending: Some((service, req)),
                }
            }
            Decision::Reject(reason) => self.reject(route, reason),
        };

        ResponseFuture::new(state, Some(completion), &self.instruments)
    }
}

impl<S, C> AdmissionService<S, C> {
    fn reject<F, Req>(&self, route: RouteClass, reason: Reason) -> State<S, F, Req> {
        tracing::warn!(route = %route, %reason, "rejecting request");
        self.instruments.decision(Some(route), "reject");
        State::Rejected {
            error: AdmissionError::OverloadRejected { route, reason },
        }
    }
}
