//! Request to route resolution.
//!
//! Unlike first-match routers, every candidate for the method is tried and the
//! most specific match wins; folder order only breaks ties. The remaining
//! matches stay available, in the same order, for routes that pass a request
//! on when none of their responses apply.

use super::pattern::{collapse_slashes, normalize_path};
use super::table::{ConcreteRoute, RouteTable};
use crate::environment::RouteMethod;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A resolved request.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<ConcreteRoute>,
    /// Decoded path parameters
    pub params: BTreeMap<String, String>,
    /// Decoded request path
    pub path: String,
}

pub struct RequestMatcher {
    table: RouteTable,
}

impl RequestMatcher {
    pub fn new(table: RouteTable) -> Self {
        Self { table }
    }

    /// Resolve `method` and a raw request path (percent-encoded, possibly with
    /// a query string) to the best matching route.
    pub fn find(&self, method: &str, raw_path: &str) -> Option<RouteMatch> {
        self.find_all(method, raw_path).into_iter().next()
    }

    /// Every route matching the request, most specific first. HEAD requests
    /// list HEAD routes before GET routes.
    pub fn find_all(&self, method: &str, raw_path: &str) -> Vec<RouteMatch> {
        let path_only = raw_path.split('?').next().unwrap_or_default();
        let raw = collapse_slashes(path_only);
        let path = normalize_path(path_only);

        let found = match RouteMethod::from_http(method) {
            Some(RouteMethod::Head) => {
                let mut found = self.matches(RouteMethod::Head, &raw);
                for candidate in self.matches(RouteMethod::Get, &raw) {
                    if !found.iter().any(|(route, _)| Arc::ptr_eq(route, candidate.0)) {
                        found.push(candidate);
                    }
                }
                found
            }
            Some(m) => self.matches(m, &raw),
            None => self.matches(RouteMethod::All, &raw),
        };

        found
            .into_iter()
            .map(|(route, params)| RouteMatch {
                route: Arc::clone(route),
                params,
                path: path.clone(),
            })
            .collect()
    }

    fn matches(
        &self,
        method: RouteMethod,
        raw_path: &str,
    ) -> Vec<(&Arc<ConcreteRoute>, BTreeMap<String, String>)> {
        let candidates: Box<dyn Iterator<Item = &Arc<ConcreteRoute>> + '_> =
            if method == RouteMethod::All {
                Box::new(
                    self.table
                        .routes()
                        .iter()
                        .filter(|r| r.method == RouteMethod::All),
                )
            } else {
                Box::new(self.table.candidates(method))
            };

        let mut matched: Vec<_> = candidates
            .filter_map(|route| route.pattern.match_path(raw_path).map(|params| (route, params)))
            .collect();
        matched.sort_by_key(|(route, _)| (route.pattern.specificity(), route.order));
        matched
    }
}
