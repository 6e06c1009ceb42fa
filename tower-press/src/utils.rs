use press_limit::RouteTable;
use tower::ServiceBuilder;
use tower::layer::util::Stack;

use crate::AdmissionLayer;
use crate::StacRouteClassifier;

/// Service Builder Extension with admission control for tower::ServiceBuilder.
pub trait ServiceBuilderExt<L> {
    /// Add admission control with a custom classifier.
    fn route_admission<C>(
        self,
        routes: RouteTable,
        classifier: C,
    ) -> ServiceBuilder<Stack<AdmissionLayer<C>, L>>;

    /// Add admission control for a STAC API mounted at `/`.
    fn stac_admission(
        self,
        routes: RouteTable,
    ) -> ServiceBuilder<Stack<AdmissionLayer<StacRouteClassifier>, L>>;
}

impl<L> ServiceBuilderExt<L> for ServiceBuilder<L> {
    fn route_admission<C>(
        self,
        routes: RouteTable,
        classifier: C,
    ) -> ServiceBuilder<Stack<AdmissionLayer<C>, L>> {
        self.layer(AdmissionLayer::new(routes, classifier))
    }

    fn stac_admission(
        self,
        routes: RouteTable,
    ) -> ServiceBuilder<Stack<AdmissionLayer<StacRouteClassifier>, L>> {
        self.layer(AdmissionLayer::new(routes, StacRouteClassifier::new()))
    }
}
