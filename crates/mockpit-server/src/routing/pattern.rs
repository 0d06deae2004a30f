//! Route path pattern compilation.
//!
//! Patterns follow the express-style syntax used by stored environments:
//! - `:name` named parameter, `:name?` optional parameter (its leading slash is optional too)
//! - `:name(\d+)` parameter with a custom expression
//! - `*` wildcard, captured under a numeric name (`0`, `1`, ...)
//! - `( ... )` grouping, usually followed by `?`; `\(` and `\)` are literal parentheses
//!
//! Patterns are matched against the raw (still percent-encoded) request path,
//! so an encoded `/` stays inside one segment. Captured parameters are decoded
//! afterwards. Matching is case-insensitive and tolerates a trailing slash.

use regex::Regex;
use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;

/// How specific a pattern is. Literal segments outrank parameters, which
/// outrank wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Specificity {
    pub literals: usize,
    pub params: usize,
    pub wildcards: usize,
}

impl Specificity {
    fn key(&self) -> (usize, usize, Reverse<usize>) {
        (self.wildcards, self.params, Reverse(self.literals))
    }
}

impl PartialOrd for Specificity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// `Less` means more specific.
impl Ord for Specificity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// A compiled route path.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    regex: Regex,
    /// Capture group name (`p0`, `p1`, ...) to parameter name
    params: Vec<(String, String)>,
    specificity: Specificity,
}

impl PathPattern {
    /// Compile a pattern such as `/users/:id` or `/files/*`.
    pub fn compile(pattern: &str) -> Result<Self, regex::Error> {
        let trimmed = pattern.trim_end_matches('/');

        let mut compiler = Compiler::default();
        compiler.run(trimmed);

        let regex = Regex::new(&format!("(?i)^{}/?$", compiler.out))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
            params: compiler.params,
            specificity: specificity_of(trimmed),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn specificity(&self) -> Specificity {
        self.specificity
    }

    /// Match a raw path (see [`collapse_slashes`]), returning the extracted
    /// parameters percent-decoded.
    pub fn match_path(&self, raw_path: &str) -> Option<BTreeMap<String, String>> {
        let captures = self.regex.captures(raw_path)?;
        let mut params = BTreeMap::new();
        for (group, name) in &self.params {
            if let Some(value) = captures.name(group) {
                params.insert(name.clone(), decode(value.as_str()));
            }
        }
        Some(params)
    }
}

#[derive(Default)]
struct Compiler {
    out: String,
    params: Vec<(String, String)>,
    wildcards: usize,
}

impl Compiler {
    fn run(&mut self, pattern: &str) {
        let chars: Vec<char> = pattern.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            match c {
                '\\' if i + 1 < chars.len() => {
                    self.out.push_str(&regex::escape(&chars[i + 1].to_string()));
                    i += 2;
                }
                ':' => {
                    let name: String = chars[i + 1..]
                        .iter()
                        .take_while(|c| c.is_ascii_alphanumeric() || **c == '_')
                        .collect();
                    if name.is_empty() {
                        self.out.push(':');
                        i += 1;
                        continue;
                    }
                    i += 1 + name.chars().count();

                    let mut expression = "[^/]+?".to_string();
                    if chars.get(i) == Some(&'(') {
                        if let Some(end) = closing_paren(&chars, i) {
                            expression = chars[i + 1..end].iter().collect();
                            i = end + 1;
                        }
                    }

                    let group = format!("p{}", self.params.len());
                    let capture = format!("(?P<{group}>{expression})");
                    if chars.get(i) == Some(&'?') {
                        i += 1;
                        if self.out.ends_with('/') {
                            self.out.pop();
                            self.out.push_str(&format!("(?:/{capture})?"));
                        } else {
                            self.out.push_str(&format!("{capture}?"));
                        }
                    } else {
                        self.out.push_str(&capture);
                    }
                    self.params.push((group, name));
                }
                '*' => {
                    let group = format!("p{}", self.params.len());
                    self.out.push_str(&format!("(?P<{group}>.*)"));
                    self.params.push((group, self.wildcards.to_string()));
                    self.wildcards += 1;
                    i += 1;
                }
                '(' => {
                    self.out.push_str("(?:");
                    i += 1;
                }
                ')' | '?' | '+' | '/' => {
                    self.out.push(c);
                    i += 1;
                }
                _ => {
                    let literal = c.to_string();
                    let literal = if is_path_safe(c) {
                        literal
                    } else {
                        urlencoding::encode(&literal).into_owned()
                    };
                    self.out.push_str(&regex::escape(&literal));
                    i += 1;
                }
            }
        }
    }
}

/// Characters a client sends unencoded in a path segment.
fn is_path_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-._~!$&'()*+,;=:@%".contains(c)
}

/// Index of the parenthesis closing the one opened at `open`.
fn closing_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn specificity_of(pattern: &str) -> Specificity {
    let mut specificity = Specificity::default();
    for segment in pattern.split('/').filter(|s| !s.is_empty()) {
        let unescaped = segment.replace("\\(", "").replace("\\)", "");
        if unescaped.contains('*') {
            specificity.wildcards += 1;
        } else if unescaped.contains(':') || unescaped.contains('(') {
            specificity.params += 1;
        } else {
            specificity.literals += 1;
        }
    }
    specificity
}

/// Collapse duplicate slashes and ensure a leading slash. Percent escapes
/// are kept, so the result can be matched or relayed upstream verbatim.
pub fn collapse_slashes(raw: &str) -> String {
    let mut collapsed = String::with_capacity(raw.len() + 1);
    if !raw.starts_with('/') {
        collapsed.push('/');
    }
    let mut previous_slash = false;
    for c in raw.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        collapsed.push(c);
    }
    collapsed
}

/// [`collapse_slashes`], then decode percent escapes.
pub fn normalize_path(raw: &str) -> String {
    decode(&collapse_slashes(raw))
}

fn decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// Join an endpoint prefix and a route endpoint into one absolute path.
pub fn join_path(prefix: &str, endpoint: &str) -> String {
    let joined = format!("/{prefix}/{endpoint}");
    let mut out = String::with_capacity(joined.len());
    let mut previous_slash = false;
    for c in joined.chars() {
        if c == '/' && previous_slash {
            continue;
        }
        previous_slash = c == '/';
        out.push(c);
    }
    out
}
