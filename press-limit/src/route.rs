use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// The rate-governed endpoint classes of a STAC API.
///
/// The set is fixed: every classified request belongs to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteClass {
    /// `GET /collections`
    Collections,
    /// `GET /collections/{collection_id}`
    Collection,
    /// `GET /collections/{collection_id}/items/{item_id}`
    Item,
    /// `GET /collections/{collection_id}/items`
    Items,
    /// `GET|POST /search`
    Search,
}

impl RouteClass {
    /// Every route class, in table order.
    pub const ALL: [RouteClass; 5] = [
        RouteClass::Collections,
        RouteClass::Collection,
        RouteClass::Item,
        RouteClass::Items,
        RouteClass::Search,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RouteClass::Collections => "collections",
            RouteClass::Collection => "collection",
            RouteClass::Item => "item",
            RouteClass::Items => "items",
            RouteClass::Search => "search",
        }
    }

    /// Position of this class in [`RouteClass::ALL`].
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
