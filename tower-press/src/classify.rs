use press_limit::RouteClass;

/// Resolves which rate-governed route, if any, a request belongs to.
///
/// Requests that resolve to `None` bypass admission control entirely.
pub trait Classify<Req> {
    fn classify(&self, req: &Req) -> Option<RouteClass>;
}

impl<F, Req> Classify<Req> for F
where
    F: Fn(&Req) -> Option<RouteClass>,
{
    fn classify(&self, req: &Req) -> Option<RouteClass> {
        self(req)
    }
}

/// Classifies `http` requests by their STAC API path.
///
/// | path                                   | class         |
/// |----------------------------------------|---------------|
/// | `/collections`                         | `collections` |
/// | `/collections/{id}`                    | `collection`  |
/// | `/collections/{id}/items`              | `items`       |
/// | `/collections/{id}/items/{item_id}`    | `item`        |
/// | `/search`                              | `search`      |
///
/// Anything else, including the landing page, conformance and OpenAPI
/// documents, is unclassified.
#[derive(Debug, Clone, Default)]
pub struct StacRouteClassifier {
    base_path: String,
}

impl StacRouteClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only classify paths mounted below `base_path` (e.g. `/api/stac/v1`).
    pub fn with_base_path(base_path: impl Into<String>) -> Self {
        let base_path = base_path.into();
        Self {
            base_path: base_path.trim_end_matches('/').to_string(),
        }
    }

    /// Classify a bare request path.
    pub fn classify_path(&self, path: &str) -> Option<RouteClass> {
        let rest = path.strip_prefix(self.base_path.as_str())?;
        if !self.base_path.is_empty() && !rest.starts_with('/') {
            return None;
        }

        let segments: Vec<&str> = rest.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["collections"] => Some(RouteClass::Collections),
            ["collections", id] if !id.is_empty() => Some(RouteClass::Collection),
            ["collections", id, "items"] if !id.is_empty() => Some(RouteClass::Items),
            ["collections", id, "items", item] if !id.is_empty() && !item.is_empty() => {
                Some(RouteClass::Item)
            }
            ["search"] => Some(RouteClass::Search),
            _ => None,
        }
    }
}

impl<B> Classify<http::Request<B>> for StacRouteClassifier {
    fn classify(&self, req: &http::Request<B>) -> Option<RouteClass> {
        self.classify_path(req.uri().path())
    }
}
