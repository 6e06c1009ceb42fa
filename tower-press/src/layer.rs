use press_limit::AdmissionConfig;
use press_limit::RouteTable;
use tower::Layer;

use crate::classify::StacRouteClassifier;
use crate::service::AdmissionService;

/// Applies per-route admission control to requests.
///
/// Every service produced by one layer (and by its clones) shares the same
/// route controllers, so load is accounted across the whole server.
#[derive(Debug, Clone)]
pub struct AdmissionLayer<C> {
    routes: RouteTable,
    classifier: C,
}

impl<C> AdmissionLayer<C> {
    /// Create an AdmissionLayer
    pub fn new(routes: RouteTable, classifier: C) -> Self {
        AdmissionLayer { routes, classifier }
    }
}

impl AdmissionLayer<StacRouteClassifier> {
    /// Build controllers from `config` and classify requests by STAC path.
    pub fn stac(config: &AdmissionConfig) -> Self {
        Self::new(RouteTable::new(config), StacRouteClassifier::new())
    }
}

impl<C, S> Layer<S> for AdmissionLayer<C>
where
    C: Clone,
{
    type Service = AdmissionService<S, C>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService::new(service, self.routes.clone(), self.classifier.clone())
    }
}
