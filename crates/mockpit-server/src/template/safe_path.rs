//! Safe path evaluation over JSON values.
//!
//! Two expression forms are accepted:
//! - dot paths such as `users.0.name` (`\.` escapes a literal dot)
//! - JSONPath (RFC 9535) expressions starting with `$`
//!
//! Every expression goes through [`check`] before it is evaluated. The check is
//! an allow-list over the expression text: function calls, code blocks,
//! assignments and prototype or constructor access are refused outright.

use serde_json::Value;
use serde_json_path::JsonPath;
use thiserror::Error;

const MAX_EXPRESSION_LEN: usize = 512;

/// Property names that reach object internals in script-based evaluators.
const FORBIDDEN_NAMES: &[&str] = &[
    "constructor",
    "__proto__",
    "prototype",
    "__defineGetter__",
    "__defineSetter__",
    "__lookupGetter__",
    "__lookupSetter__",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SafePathError {
    #[error("path expression is too long ({0} characters)")]
    TooLong(usize),

    #[error("path expression contains forbidden character '{0}'")]
    ForbiddenCharacter(char),

    #[error("path expression references forbidden name '{0}'")]
    ForbiddenName(String),

    #[error("path expression contains an assignment")]
    Assignment,

    #[error("path expression has an unterminated string literal")]
    UnterminatedString,

    #[error("invalid JSONPath expression: {0}")]
    InvalidJsonPath(String),
}

/// Validate an expression without evaluating it.
pub fn check(expression: &str) -> Result<(), SafePathError> {
    if expression.len() > MAX_EXPRESSION_LEN {
        return Err(SafePathError::TooLong(expression.len()));
    }

    let chars: Vec<char> = expression.chars().collect();
    let mut identifier = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                check_name(&identifier)?;
                identifier.clear();
                let (literal, end) = read_string(&chars, i)?;
                check_name(&literal)?;
                i = end + 1;
                continue;
            }
            '(' | ')' | ';' | '`' | '{' | '}' | '\n' | '\r' | '#' => {
                return Err(SafePathError::ForbiddenCharacter(c));
            }
            '=' => {
                let previous = if i > 0 { chars[i - 1] } else { ' ' };
                let next = chars.get(i + 1).copied().unwrap_or(' ');
                let comparison = next == '=' || matches!(previous, '=' | '!' | '<' | '>');
                if !comparison || next == '>' {
                    return Err(SafePathError::Assignment);
                }
            }
            _ => {}
        }

        if c.is_alphanumeric() || c == '_' || c == '$' {
            identifier.push(c);
        } else {
            check_name(&identifier)?;
            identifier.clear();
        }
        i += 1;
    }
    check_name(&identifier)
}

fn check_name(name: &str) -> Result<(), SafePathError> {
    let bare = name.trim_start_matches('$');
    if FORBIDDEN_NAMES.contains(&bare) {
        return Err(SafePathError::ForbiddenName(bare.to_string()));
    }
    Ok(())
}

/// Read a quoted literal starting at `start`, returning its content and the
/// index of the closing quote.
fn read_string(chars: &[char], start: usize) -> Result<(String, usize), SafePathError> {
    let quote = chars[start];
    let mut literal = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                literal.push(chars[i + 1]);
                i += 2;
            }
            c if c == quote => return Ok((literal, i)),
            c => {
                literal.push(c);
                i += 1;
            }
        }
    }
    Err(SafePathError::UnterminatedString)
}

/// Evaluate `expression` against `data`.
///
/// An empty expression selects the whole value. `Ok(None)` means nothing was
/// found; a JSONPath selecting several nodes yields them as an array.
pub fn query(data: &Value, expression: &str) -> Result<Option<Value>, SafePathError> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Ok(Some(data.clone()));
    }
    check(expression)?;

    if expression.starts_with('$') {
        let path = JsonPath::parse(expression)
            .map_err(|e| SafePathError::InvalidJsonPath(e.to_string()))?;
        let nodes = path.query(data).all();
        return Ok(match nodes.len() {
            0 => None,
            1 => Some(nodes[0].clone()),
            _ => Some(Value::Array(nodes.into_iter().cloned().collect())),
        });
    }

    let mut current = data;
    for segment in split_dot_path(expression) {
        current = match current {
            Value::Object(map) => match map.get(&segment) {
                Some(value) => value,
                None => return Ok(None),
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(value) => value,
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
    }
    Ok(Some(current.clone()))
}

/// Split a dot path into segments, honoring `\.` as a literal dot.
pub fn split_dot_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'.') => {
                current.push('.');
                chars.next();
            }
            '.' => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

/// Mutable access to the value at a dot path, creating intermediate objects.
pub fn set_dot_path(target: &mut Value, path: &str, value: Value) -> Result<(), SafePathError> {
    check(path)?;
    let segments = split_dot_path(path);
    let mut current = target;
    for (index, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let Value::Object(map) = current else {
            return Ok(());
        };
        if index == segments.len() - 1 {
            map.insert(segment.clone(), value);
            return Ok(());
        }
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    Ok(())
}
