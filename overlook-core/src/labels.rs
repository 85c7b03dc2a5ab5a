//! Label selectors used to narrow cache listings
use serde::{Deserialize, Serialize};
use std::{
    cmp::PartialEq,
    collections::{BTreeMap, BTreeSet},
    fmt,
    iter::FromIterator,
    str::FromStr,
};
use thiserror::Error;

// local type aliases
type Map = BTreeMap<String, String>;
type Expressions = Vec<Expression>;

/// Failed to parse a selector string
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid label selector {input:?}: {reason}")]
pub struct ParseSelectorError {
    /// The offending input
    pub input: String,
    /// Why it was rejected
    pub reason: &'static str,
}

/// A selector expression with existing operations
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Expression {
    /// Key has one of the values
    In(String, BTreeSet<String>),
    /// Key is absent or has none of the values
    NotIn(String, BTreeSet<String>),
    /// Key has exactly the value
    Equal(String, String),
    /// Key is absent or has another value
    NotEqual(String, String),
    /// Key is present
    Exists(String),
    /// Key is absent
    DoesNotExist(String),
}

/// Perform selection on a list of expressions
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize)]
pub struct Selector(Expressions);

impl Selector {
    /// Create a selector from a vector of expressions
    fn from_expressions(exprs: Expressions) -> Self {
        Self(exprs)
    }

    /// Create a selector from a map of key=value label matches
    fn from_map(map: Map) -> Self {
        Self(map.into_iter().map(|(k, v)| Expression::Equal(k, v)).collect())
    }

    /// Parse the comma separated string form, e.g. `app=web,tier notin (db),!canary`
    pub fn parse(input: &str) -> Result<Self, ParseSelectorError> {
        let err = |reason| ParseSelectorError {
            input: input.to_string(),
            reason,
        };
        let mut exprs = vec![];
        for requirement in split_requirements(input).map_err(err)? {
            exprs.push(parse_requirement(requirement).map_err(err)?);
        }
        Ok(Self(exprs))
    }

    /// Convert a selector to a string for the API
    pub fn to_selector_string(&self) -> String {
        let selectors: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        selectors.join(",")
    }

    /// Indicates whether this label selector matches all objects
    pub fn selects_all(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a label set satisfies every expression
    pub fn matches(&self, labels: &Map) -> bool {
        for expr in self.0.iter() {
            if !expr.matches(labels) {
                return false;
            }
        }
        true
    }
}

impl FromStr for Selector {
    type Err = ParseSelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_selector_string())
    }
}

// === Expression ===

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::In(key, values) => {
                write!(f, "{key} in ({})", values.iter().cloned().collect::<Vec<_>>().join(","))
            }
            Expression::NotIn(key, values) => {
                write!(f, "{key} notin ({})", values.iter().cloned().collect::<Vec<_>>().join(","))
            }
            Expression::Equal(key, value) => write!(f, "{key}={value}"),
            Expression::NotEqual(key, value) => write!(f, "{key}!={value}"),
            Expression::Exists(key) => write!(f, "{key}"),
            Expression::DoesNotExist(key) => write!(f, "!{key}"),
        }
    }
}

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match self {
            Expression::In(key, values) => match labels.get(key) {
                Some(v) => values.contains(v),
                None => false,
            },
            Expression::NotIn(key, values) => match labels.get(key) {
                Some(v) => !values.contains(v),
                None => true,
            },
            Expression::Exists(key) => labels.contains_key(key),
            Expression::DoesNotExist(key) => !labels.contains_key(key),
            Expression::Equal(key, value) => labels.get(key) == Some(value),
            Expression::NotEqual(key, value) => labels.get(key) != Some(value),
        }
    }
}

// === Parsing ===

/// Splits on commas that are not inside a value set
fn split_requirements(input: &str) -> Result<Vec<&str>, &'static str> {
    let mut parts = vec![];
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1).ok_or("unbalanced parenthesis")?,
            ',' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err("unbalanced parenthesis");
    }
    parts.push(&input[start..]);
    // An empty selector string selects everything
    if parts.len() == 1 && parts[0].trim().is_empty() {
        return Ok(vec![]);
    }
    Ok(parts)
}

fn parse_requirement(raw: &str) -> Result<Expression, &'static str> {
    let req = raw.trim();
    if req.is_empty() {
        return Err("empty requirement");
    }
    if let Some(key) = req.strip_prefix('!') {
        return Ok(Expression::DoesNotExist(valid_key(key.trim())?));
    }
    if let Some((key, rest)) = req.split_once(char::is_whitespace) {
        let rest = rest.trim_start();
        if let Some(values) = rest.strip_prefix("notin") {
            return Ok(Expression::NotIn(valid_key(key)?, value_set(values)?));
        }
        if let Some(values) = rest.strip_prefix("in") {
            return Ok(Expression::In(valid_key(key)?, value_set(values)?));
        }
    }
    if let Some((key, value)) = req.split_once("!=") {
        return Ok(Expression::NotEqual(valid_key(key.trim())?, valid_value(value.trim())?));
    }
    if let Some((key, value)) = req.split_once("==") {
        return Ok(Expression::Equal(valid_key(key.trim())?, valid_value(value.trim())?));
    }
    if let Some((key, value)) = req.split_once('=') {
        return Ok(Expression::Equal(valid_key(key.trim())?, valid_value(value.trim())?));
    }
    Ok(Expression::Exists(valid_key(req)?))
}

fn value_set(raw: &str) -> Result<BTreeSet<String>, &'static str> {
    let inner = raw
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or("expected a parenthesized value set")?;
    inner
        .split(',')
        .map(|v| valid_value(v.trim()))
        .collect::<Result<BTreeSet<_>, _>>()
}

fn valid_key(key: &str) -> Result<String, &'static str> {
    if key.is_empty() {
        return Err("empty key");
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || "-_./".contains(c)) {
        return Err("invalid character in key");
    }
    Ok(key.to_string())
}

fn valid_value(value: &str) -> Result<String, &'static str> {
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c)) {
        return Err("invalid character in value");
    }
    Ok(value.to_string())
}

// convenience conversions for Selector

impl FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

impl From<Expression> for Selector {
    fn from(value: Expression) -> Self {
        Self(vec![value])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Map {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_matches() {
        let selector: Selector = [("app", "web")].into_iter().collect();
        assert!(selector.matches(&labels(&[("app", "web"), ("tier", "front")])));
        assert!(!selector.matches(&labels(&[("app", "db")])));
        assert!(Selector::default().matches(&labels(&[])));
    }

    #[test]
    fn test_parse_all_operators() {
        let selector =
            Selector::parse("app=web, env==prod,tier!=db,zone in (a,b),role notin (x),canary,!legacy").unwrap();
        assert_eq!(selector.0, vec![
            Expression::Equal("app".into(), "web".into()),
            Expression::Equal("env".into(), "prod".into()),
            Expression::NotEqual("tier".into(), "db".into()),
            Expression::In("zone".into(), ["a".to_string(), "b".to_string()].into()),
            Expression::NotIn("role".into(), ["x".to_string()].into()),
            Expression::Exists("canary".into()),
            Expression::DoesNotExist("legacy".into()),
        ]);
        assert_eq!(
            selector.to_selector_string(),
            "app=web,env=prod,tier!=db,zone in (a,b),role notin (x),canary,!legacy"
        );
    }

    #[test]
    fn test_parse_empty_selects_all() {
        assert!(Selector::parse("").unwrap().selects_all());
        assert!(Selector::parse("  ").unwrap().selects_all());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Selector::parse("app in (a,b").is_err());
        assert!(Selector::parse("app=web,").is_err());
        assert!(Selector::parse("=web").is_err());
        assert!(Selector::parse("app=we b").is_err());
        assert!(Selector::parse("zone in a,b").is_err());
    }

    #[test]
    fn test_set_expressions() {
        let selector = Selector::parse("zone in (a,b),role notin (x)").unwrap();
        assert!(selector.matches(&labels(&[("zone", "a")])));
        assert!(selector.matches(&labels(&[("zone", "b"), ("role", "y")])));
        assert!(!selector.matches(&labels(&[("zone", "c")])));
        assert!(!selector.matches(&labels(&[("zone", "a"), ("role", "x")])));
    }
}
