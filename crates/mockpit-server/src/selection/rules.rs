//! Response rule evaluation.
//!
//! A rule reads one value out of the request (or the route's request number,
//! or a data bucket), renders its comparison value and compares the two.
//! `invert` negates the final outcome. Evaluation never fails: an unsafe path,
//! an invalid regex or a comparison value that cannot be rendered makes the
//! rule false and is logged.

use crate::environment::{ResponseRule, RuleOperator, RuleTarget, RulesOperator};
use crate::template::safe_path::{self, SafePathError};
use crate::template::{stringify, RenderScope};
use regex::RegexBuilder;
use serde_json::{Map, Value};
use tracing::warn;

/// Value of `target` at `modifier` for the current request.
///
/// `Ok(None)` means the value cannot be located.
pub fn resolve(
    target: RuleTarget,
    modifier: &str,
    operator: RuleOperator,
    scope: &RenderScope<'_>,
) -> Result<Option<Value>, SafePathError> {
    let request = scope.request();
    let value = match target {
        RuleTarget::RequestNumber => Some(Value::from(scope.request_number())),
        RuleTarget::Method => Some(Value::String(request.method.to_lowercase())),
        // Either the URL as received or the decoded path may match
        RuleTarget::Path => {
            let url = if request.raw_query.is_empty() {
                request.raw_path.clone()
            } else {
                format!("{}?{}", request.raw_path, request.raw_query)
            };
            Some(Value::Array(vec![Value::String(url), Value::String(request.path.clone())]))
        }
        RuleTarget::Templating => Some(Value::String(modifier.to_string())),
        RuleTarget::Cookie => {
            if modifier.is_empty() {
                None
            } else {
                request.cookies.get(modifier).cloned().map(Value::String)
            }
        }
        RuleTarget::Header => {
            if modifier.is_empty() {
                Some(Value::String(String::new()))
            } else {
                request.header(modifier).map(|h| Value::String(h.to_string()))
            }
        }
        RuleTarget::Params => {
            if modifier.is_empty() {
                None
            } else {
                let params = serde_json::to_value(&request.params).unwrap_or(Value::Null);
                safe_path::query(&params, modifier)?
            }
        }
        RuleTarget::Query => safe_path::query(&request.query, modifier)?,
        RuleTarget::Body => {
            if modifier.is_empty() {
                let wants_text = matches!(
                    operator,
                    RuleOperator::Equals | RuleOperator::Regex | RuleOperator::RegexI
                );
                match &request.body {
                    Some(parsed) if !wants_text => Some(parsed.clone()),
                    _ => Some(Value::String(request.raw_body.clone())),
                }
            } else {
                match &request.body {
                    Some(parsed) => safe_path::query(parsed, modifier)?,
                    None => None,
                }
            }
        }
        RuleTarget::DataBucket => {
            if modifier.is_empty() {
                None
            } else {
                safe_path::check(modifier)?;
                let buckets = bucket_targets(modifier, scope);
                safe_path::query(&buckets, modifier)?
            }
        }
    };
    Ok(value)
}

/// Object of bucket values keyed by id and name, limited to the bucket a dot
/// path starts with. JSONPath modifiers see every bucket.
fn bucket_targets(modifier: &str, scope: &RenderScope<'_>) -> Value {
    let wanted: Vec<String> = if modifier.starts_with('$') {
        Vec::new()
    } else {
        safe_path::split_dot_path(modifier)
            .into_iter()
            .take(1)
            .collect()
    };

    let mut object = Map::new();
    let mut add = |reference: &str| {
        if let Some(value) = scope.bucket(reference) {
            for alias in scope.buckets().aliases(reference) {
                object.insert(alias, value.clone());
            }
        }
    };
    if wanted.is_empty() {
        for id in scope.buckets().ids() {
            add(&id);
        }
    } else {
        for reference in &wanted {
            add(reference);
        }
    }
    Value::Object(object)
}

/// Evaluate one rule, including its `invert` flag.
pub fn evaluate_rule(rule: &ResponseRule, scope: &RenderScope<'_>) -> bool {
    let outcome = match evaluate_rule_inner(rule, scope) {
        Ok(outcome) => outcome,
        Err(reason) => {
            warn!(
                "Rule on {:?} '{}' evaluated to false: {}",
                rule.target, rule.modifier, reason
            );
            false
        }
    };
    outcome != rule.invert
}

fn evaluate_rule_inner(rule: &ResponseRule, scope: &RenderScope<'_>) -> Result<bool, String> {
    let modifier = scope.render(&rule.modifier).map_err(|e| e.to_string())?;
    let target =
        resolve(rule.target, &modifier, rule.operator, scope).map_err(|e| e.to_string())?;

    match rule.operator {
        RuleOperator::Null => {
            return Ok(matches!(target, None | Some(Value::Null))
                || target.as_ref().and_then(Value::as_str) == Some(""));
        }
        RuleOperator::EmptyArray => {
            return Ok(matches!(&target, Some(Value::Array(items)) if items.is_empty()));
        }
        _ => {}
    }

    let Some(target) = target else {
        return Ok(false);
    };
    let expected = scope.render(&rule.value).map_err(|e| e.to_string())?;

    match rule.operator {
        RuleOperator::Regex | RuleOperator::RegexI => {
            let regex = RegexBuilder::new(&expected)
                .case_insensitive(rule.operator == RuleOperator::RegexI)
                .build()
                .map_err(|e| format!("invalid regex '{expected}': {e}"))?;
            Ok(match &target {
                Value::Array(items) => items.iter().any(|item| regex.is_match(&stringify(item))),
                other => regex.is_match(&stringify(other)),
            })
        }
        RuleOperator::ArrayIncludes => Ok(match &target {
            Value::Array(items) => items.iter().any(|item| stringify(item) == expected),
            _ => false,
        }),
        _ => Ok(match &target {
            Value::Array(items) => items.iter().any(|item| stringify(item) == expected),
            other => stringify(other) == expected,
        }),
    }
}

/// Whether a rule set holds under its combinator. An empty set never holds.
pub fn rules_hold(rules: &[ResponseRule], operator: RulesOperator, scope: &RenderScope<'_>) -> bool {
    if rules.is_empty() {
        return false;
    }
    match operator {
        RulesOperator::And => rules.iter().all(|rule| evaluate_rule(rule, scope)),
        RulesOperator::Or => rules.iter().any(|rule| evaluate_rule(rule, scope)),
    }
}
