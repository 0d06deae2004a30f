//! Per-route request counters.
//!
//! Each route owns one counter holding the number of requests it has served.
//! The counter lock is held for the whole selection step, so the request
//! number seen by rules and templates and the sequential index always come
//! from the same read-modify-write.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Counters keyed by route id.
#[derive(Default)]
pub struct RequestCounters {
    routes: RwLock<HashMap<String, Arc<Mutex<u64>>>>,
}

impl RequestCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter of a route, created on first use.
    pub fn counter(&self, route_id: &str) -> Arc<Mutex<u64>> {
        if let Some(counter) = self.routes.read().get(route_id) {
            return Arc::clone(counter);
        }
        let mut routes = self.routes.write();
        Arc::clone(routes.entry(route_id.to_string()).or_default())
    }

    /// Requests served so far by a route.
    pub fn served(&self, route_id: &str) -> u64 {
        self.routes
            .read()
            .get(route_id)
            .map_or(0, |counter| *counter.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_independent_per_route() {
        let counters = RequestCounters::new();
        *counters.counter("a").lock() += 1;
        *counters.counter("a").lock() += 1;
        *counters.counter("b").lock() += 1;
        assert_eq!(counters.served("a"), 2);
        assert_eq!(counters.served("b"), 1);
        assert_eq!(counters.served("c"), 0);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let counters = Arc::new(RequestCounters::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = Arc::clone(&counters);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *counters.counter("route").lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counters.served("route"), 8000);
    }
}
