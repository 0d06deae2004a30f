//! Routing: path patterns, the route table and the request matcher.

pub mod matcher;
pub mod pattern;
pub mod table;

pub use matcher::{RequestMatcher, RouteMatch};
pub use pattern::{collapse_slashes, join_path, normalize_path, PathPattern, Specificity};
pub use table::{
    expand, ConcreteRoute, ResourceBinding, ResourceOperation, RouteTable, RESOURCE_ID_PARAM,
};
