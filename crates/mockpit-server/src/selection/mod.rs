//! Response selection: rule evaluation, per-route counters and selection modes.

pub mod counters;
pub mod rules;
pub mod selector;

pub use counters::RequestCounters;
pub use rules::{evaluate_rule, resolve, rules_hold};
pub use selector::{ResponseSelector, Selection};
