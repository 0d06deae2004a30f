//! Response selection state machine.

use super::counters::RequestCounters;
use super::rules::rules_hold;
use crate::data::BucketStore;
use crate::environment::ResponseMode;
use crate::routing::ConcreteRoute;
use crate::template::{RenderScope, RequestContext, TemplateRenderer};
use rand::Rng;
use tracing::debug;

/// Result of one selection step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// Index into the route's responses; `None` lets the request continue as
    /// unmatched
    pub response_index: Option<usize>,
    /// Request number seen by rules and templates (1 for the first request)
    pub request_number: u64,
    /// Rule-based selection found no holding rule set and used the default
    pub used_default_fallback: bool,
}

/// Chooses a response per request and owns the per-route counters.
#[derive(Default)]
pub struct ResponseSelector {
    counters: RequestCounters,
}

impl ResponseSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> &RequestCounters {
        &self.counters
    }

    /// Select a response of `route` for `request`.
    ///
    /// The route counter stays locked for the whole step and only advances
    /// when a response is chosen.
    pub fn select(
        &self,
        route: &ConcreteRoute,
        renderer: &dyn TemplateRenderer,
        buckets: &BucketStore,
        request: &RequestContext,
    ) -> Selection {
        let counter = self.counters.counter(&route.route_id);
        let mut served = counter.lock();
        let request_number = *served + 1;

        let responses = &route.responses;
        if responses.is_empty() {
            return Selection {
                response_index: None,
                request_number,
                used_default_fallback: false,
            };
        }

        let default_index = route.default_response_index();
        let mut used_default_fallback = false;
        let response_index = match route.response_mode {
            Some(ResponseMode::DisableRules) => Some(default_index),
            Some(ResponseMode::Random) => Some(rand::thread_rng().gen_range(0..responses.len())),
            Some(ResponseMode::Sequential) => Some((*served % responses.len() as u64) as usize),
            None | Some(ResponseMode::Fallback) => {
                let scope = RenderScope::new(renderer, buckets, request, request_number);
                let holding = responses
                    .iter()
                    .position(|r| rules_hold(&r.rules, r.rules_operator, &scope));
                match (holding, route.response_mode) {
                    (Some(index), _) => Some(index),
                    (None, Some(ResponseMode::Fallback)) => None,
                    (None, _) => {
                        used_default_fallback = true;
                        Some(default_index)
                    }
                }
            }
        };

        if response_index.is_some() {
            *served += 1;
        }
        debug!(
            "Route {} request #{} selected response {:?}",
            route.route_id, request_number, response_index
        );
        Selection {
            response_index,
            request_number,
            used_default_fallback,
        }
    }
}
