use std::marker::PhantomData;

use press_limit::RouteTable;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::util::BoxCloneSyncService;

use crate::AdmissionError;
use crate::AdmissionService;
use crate::classify::Classify;

/// A pre-composed admission stack with a single error domain.
///
/// Wraps [`AdmissionService`] and boxes it so it can be dropped straight into
/// routers that need a cloneable, `Sync` service.
///
/// ### Error Responsibilities:
/// - **OverloadRejected (`AdmissionError::OverloadRejected`)**: backpressure
///   turned the request away. Produced without touching the inner service.
/// - **TimeoutExceeded (`AdmissionError::TimeoutExceeded`)**: the delay plus
///   the inner call ran past the request timeout.
/// - **Inner (`AdmissionError::Inner`)**: any other error from the inner
///   service, flattened to its message.
pub struct ManagedAdmissionLayer<C, Req> {
    routes: RouteTable,
    classifier: C,
    _phantom: PhantomData<fn(Req)>,
}

// Note: Deriving Clone would require Req: Clone.
impl<C: Clone, Req> Clone for ManagedAdmissionLayer<C, Req> {
    fn clone(&self) -> Self {
        Self {
            routes: self.routes.clone(),
            classifier: self.classifier.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<S, C, Req> Layer<S> for ManagedAdmissionLayer<C, Req>
where
    C: Classify<Req> + Clone + Send + Sync + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Response: 'static,
    Req: Send + 'static,
{
    type Service = BoxCloneSyncService<Req, S::Response, BoxError>;

    fn layer(&self, inner: S) -> Self::Service {
        let svc = AdmissionService::new(inner, self.routes.clone(), self.classifier.clone());

        let mapped_svc = tower::util::MapErr::new(svc, |err: BoxError| {
            if err.is::<AdmissionError>() {
                err
            } else {
                Box::from(AdmissionError::Inner(err.to_string()))
            }
        });

        BoxCloneSyncService::new(mapped_svc)
    }
}

impl<C, Req> ManagedAdmissionLayer<C, Req> {
    pub fn new(routes: RouteTable, classifier: C) -> Self {
        Self {
            routes,
            classifier,
            _phantom: PhantomData,
        }
    }
}
