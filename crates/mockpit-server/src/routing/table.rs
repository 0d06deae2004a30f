//! Route table construction.
//!
//! The table is built once per environment load. It flattens the folder
//! hierarchy into declaration order, expands resource routes into their
//! concrete sub-routes and indexes the result by method.

use super::pattern::{join_path, PathPattern};
use crate::environment::{
    default_response_index, BodyType, Environment, ResponseMode, Route, RouteKind, RouteMethod,
    RouteResponse,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of the item parameter in expanded resource routes.
pub const RESOURCE_ID_PARAM: &str = "id";

/// One operation of an expanded resource route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceOperation {
    List,
    Read,
    Create,
    ReplaceAll,
    Replace,
    MergeAll,
    Merge,
    Clear,
    Delete,
}

impl ResourceOperation {
    /// Expansion order of a resource route.
    pub const ALL: [ResourceOperation; 9] = [
        ResourceOperation::List,
        ResourceOperation::Read,
        ResourceOperation::Create,
        ResourceOperation::ReplaceAll,
        ResourceOperation::Replace,
        ResourceOperation::MergeAll,
        ResourceOperation::Merge,
        ResourceOperation::Clear,
        ResourceOperation::Delete,
    ];

    pub fn method(&self) -> RouteMethod {
        match self {
            ResourceOperation::List | ResourceOperation::Read => RouteMethod::Get,
            ResourceOperation::Create => RouteMethod::Post,
            ResourceOperation::ReplaceAll | ResourceOperation::Replace => RouteMethod::Put,
            ResourceOperation::MergeAll | ResourceOperation::Merge => RouteMethod::Patch,
            ResourceOperation::Clear | ResourceOperation::Delete => RouteMethod::Delete,
        }
    }

    /// Whether the operation addresses a single item (`/path/:id`).
    pub fn targets_item(&self) -> bool {
        matches!(
            self,
            ResourceOperation::Read
                | ResourceOperation::Replace
                | ResourceOperation::Merge
                | ResourceOperation::Delete
        )
    }

    pub fn default_status(&self) -> u16 {
        match self {
            ResourceOperation::Create => 201,
            ResourceOperation::Clear | ResourceOperation::Delete => 204,
            _ => 200,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceOperation::List => "list",
            ResourceOperation::Read => "read",
            ResourceOperation::Create => "create",
            ResourceOperation::ReplaceAll => "replace-all",
            ResourceOperation::Replace => "replace",
            ResourceOperation::MergeAll => "merge-all",
            ResourceOperation::Merge => "merge",
            ResourceOperation::Clear => "clear",
            ResourceOperation::Delete => "delete",
        }
    }
}

/// Data bucket wiring of an expanded resource sub-route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceBinding {
    pub operation: ResourceOperation,
    pub bucket_id: String,
    /// Property identifying an item (dot path, `id` by default)
    pub key: String,
    /// Index of the response that carries the bucket content
    pub response_index: usize,
}

/// A route ready to be matched.
#[derive(Debug, Clone)]
pub struct ConcreteRoute {
    /// Id of the configured route; expanded siblings share it
    pub route_id: String,
    pub method: RouteMethod,
    /// Configured endpoint (without the environment prefix)
    pub endpoint: String,
    pub pattern: PathPattern,
    pub responses: Vec<RouteResponse>,
    pub response_mode: Option<ResponseMode>,
    pub resource: Option<ResourceBinding>,
    /// Position in folder order
    pub order: usize,
}

impl ConcreteRoute {
    pub fn default_response_index(&self) -> usize {
        default_response_index(&self.responses)
    }
}

/// Expand one configured route into the concrete routes it serves.
///
/// Plain routes yield themselves; resource routes yield one sub-route per
/// [`ResourceOperation`] in a fixed order; streaming routes and routes with
/// an invalid path pattern yield nothing.
pub fn expand(route: &Route, prefix: &str, order: usize) -> Vec<ConcreteRoute> {
    match route.kind {
        RouteKind::Ws => Vec::new(),
        RouteKind::Http => {
            let path = join_path(prefix, &route.endpoint);
            match PathPattern::compile(&path) {
                Ok(pattern) => vec![ConcreteRoute {
                    route_id: route.uuid.clone(),
                    method: route.method,
                    endpoint: route.endpoint.clone(),
                    pattern,
                    responses: route.responses.clone(),
                    response_mode: route.response_mode,
                    resource: None,
                    order,
                }],
                Err(e) => {
                    warn!("Skipping route {} with invalid path '{}': {}", route.uuid, path, e);
                    Vec::new()
                }
            }
        }
        RouteKind::Crud => expand_resource(route, prefix, order),
    }
}

fn expand_resource(route: &Route, prefix: &str, order: usize) -> Vec<ConcreteRoute> {
    let default_index = route.default_response_index();
    let Some(default_response) = route.responses.get(default_index) else {
        warn!("Skipping resource route {} without responses", route.uuid);
        return Vec::new();
    };
    let bucket_id = default_response.databucket_id.clone();
    let key = default_response.crud_key.clone();

    let base = join_path(prefix, &route.endpoint);
    let item = join_path(&base, &format!(":{RESOURCE_ID_PARAM}"));

    let mut routes = Vec::with_capacity(ResourceOperation::ALL.len());
    for operation in ResourceOperation::ALL {
        let path = if operation.targets_item() { &item } else { &base };
        let pattern = match PathPattern::compile(path) {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!("Skipping resource route {} with invalid path '{}': {}", route.uuid, path, e);
                return Vec::new();
            }
        };

        let mut responses = route.responses.clone();
        let mut bound = default_response.clone();
        bound.status_code = operation.default_status();
        bound.body_type = BodyType::Databucket;
        responses[default_index] = bound;

        routes.push(ConcreteRoute {
            route_id: route.uuid.clone(),
            method: operation.method(),
            endpoint: route.endpoint.clone(),
            pattern,
            responses,
            response_mode: route.response_mode,
            resource: Some(ResourceBinding {
                operation,
                bucket_id: bucket_id.clone(),
                key: key.clone(),
                response_index: default_index,
            }),
            order,
        });
    }
    routes
}

/// Ordered concrete routes with a per-method index.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<ConcreteRoute>>,
    by_method: HashMap<RouteMethod, Vec<usize>>,
}

impl RouteTable {
    /// Build the table for an environment.
    ///
    /// `disabled` lists route ids, or path fragments, excluded in addition to
    /// routes whose `enabled` flag is off.
    pub fn build(environment: &Environment, disabled: &[String]) -> Self {
        let mut table = RouteTable::default();
        for (order, route) in environment.ordered_routes().into_iter().enumerate() {
            if !route.enabled || is_disabled(route, disabled) {
                debug!("Route {} {} is disabled", route.method.as_str(), route.endpoint);
                continue;
            }
            for concrete in expand(route, &environment.endpoint_prefix, order) {
                let index = table.routes.len();
                table.by_method.entry(concrete.method).or_default().push(index);
                table.routes.push(Arc::new(concrete));
            }
        }
        debug!("Route table built with {} concrete routes", table.routes.len());
        table
    }

    pub fn routes(&self) -> &[Arc<ConcreteRoute>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes declared for `method`, plus routes accepting every method.
    pub fn candidates(&self, method: RouteMethod) -> impl Iterator<Item = &Arc<ConcreteRoute>> {
        let exact = self.by_method.get(&method).map(Vec::as_slice).unwrap_or(&[]);
        let any = self
            .by_method
            .get(&RouteMethod::All)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        exact
            .iter()
            .chain(any.iter())
            .map(move |&i| &self.routes[i])
    }
}

fn is_disabled(route: &Route, disabled: &[String]) -> bool {
    disabled.iter().any(|entry| {
        !entry.is_empty() && (route.uuid == *entry || route.endpoint.contains(entry.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::FolderChild;

    fn route(uuid: &str, method: RouteMethod, endpoint: &str) -> Route {
        Route {
            uuid: uuid.to_string(),
            kind: RouteKind::Http,
            documentation: String::new(),
            method,
            endpoint: endpoint.to_string(),
            responses: vec![RouteResponse {
                is_default: true,
                ..Default::default()
            }],
            enabled: true,
            response_mode: None,
        }
    }

    fn environment(routes: Vec<Route>) -> Environment {
        let root_children = routes.iter().map(|r| FolderChild::route(&r.uuid)).collect();
        Environment {
            routes,
            root_children,
            ..Default::default()
        }
    }

    #[test]
    fn test_expand_plain_route() {
        let routes = expand(&route("r", RouteMethod::Get, "users/:id"), "api", 0);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].pattern.source(), "/api/users/:id");
        assert!(routes[0].resource.is_none());
    }

    #[test]
    fn test_expand_streaming_route_is_not_matchable() {
        let mut ws = route("ws", RouteMethod::Get, "socket");
        ws.kind = RouteKind::Ws;
        assert!(expand(&ws, "", 0).is_empty());
    }

    #[test]
    fn test_expand_resource_route() {
        let mut crud = route("c", RouteMethod::All, "users");
        crud.kind = RouteKind::Crud;
        crud.responses[0].databucket_id = "b1".into();
        crud.responses.push(RouteResponse {
            status_code: 418,
            ..Default::default()
        });

        let routes = expand(&crud, "", 3);
        let shape: Vec<(RouteMethod, &str, u16)> = routes
            .iter()
            .map(|r| (r.method, r.pattern.source(), r.responses[0].status_code))
            .collect();
        assert_eq!(
            shape,
            vec![
                (RouteMethod::Get, "/users", 200),
                (RouteMethod::Get, "/users/:id", 200),
                (RouteMethod::Post, "/users", 201),
                (RouteMethod::Put, "/users", 200),
                (RouteMethod::Put, "/users/:id", 200),
                (RouteMethod::Patch, "/users", 200),
                (RouteMethod::Patch, "/users/:id", 200),
                (RouteMethod::Delete, "/users", 204),
                (RouteMethod::Delete, "/users/:id", 204),
            ]
        );
        for r in &routes {
            assert_eq!(r.route_id, "c");
            assert_eq!(r.order, 3);
            assert_eq!(r.responses.len(), 2);
            assert_eq!(r.responses[1].status_code, 418);
            assert_eq!(r.responses[0].body_type, BodyType::Databucket);
            let binding = r.resource.as_ref().unwrap();
            assert_eq!(binding.bucket_id, "b1");
            assert_eq!(binding.key, "id");
        }
    }

    #[test]
    fn test_expansion_is_deterministic() {
        let mut crud = route("c", RouteMethod::All, "items");
        crud.kind = RouteKind::Crud;
        let a: Vec<String> = expand(&crud, "", 0)
            .iter()
            .map(|r| format!("{:?} {}", r.method, r.pattern.source()))
            .collect();
        let b: Vec<String> = expand(&crud, "", 0)
            .iter()
            .map(|r| format!("{:?} {}", r.method, r.pattern.source()))
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_disabled_routes_are_excluded() {
        let mut off = route("off", RouteMethod::Get, "off");
        off.enabled = false;
        let env = environment(vec![
            route("a", RouteMethod::Get, "a"),
            off,
            route("b", RouteMethod::Get, "internal/b"),
        ]);
        let table = RouteTable::build(&env, &["internal".to_string()]);
        let ids: Vec<&str> = table.routes().iter().map(|r| r.route_id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn test_candidates_include_all_method_routes() {
        let env = environment(vec![
            route("get", RouteMethod::Get, "a"),
            route("post", RouteMethod::Post, "a"),
            route("any", RouteMethod::All, "b"),
        ]);
        let table = RouteTable::build(&env, &[]);
        let ids: Vec<&str> = table
            .candidates(RouteMethod::Get)
            .map(|r| r.route_id.as_str())
            .collect();
        assert_eq!(ids, vec!["get", "any"]);
    }
}
