//! Property filters for route rules.
//!
//! Filters use the LDAP-style prefix syntax common to service registries:
//!
//! | Expression | Matches when |
//! |------------|--------------|
//! | `*` | always |
//! | `(key=*)` | `key` is present |
//! | `(key=value)` | `key` equals `value` |
//! | `(key=pre*fix)` | `key` matches the wildcard (`*` = any run of characters) |
//! | `(&(a=1)(b=2))` | every sub-filter matches |
//! | `(\|(a=1)(b=2))` | at least one sub-filter matches |
//! | `(!(a=1))` | the sub-filter does not match |
//!
//! Property values are compared by their text form: strings as-is, other
//! JSON values by their JSON rendering (`true`, `42`).  An array property
//! matches if any element does.  `null` never matches.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde_json::Value;

use crate::error::{BrokerError, Result};
use crate::message::Properties;

/// A parsed property filter.
#[derive(Debug, Clone)]
pub enum Filter {
    Any,
    Present(String),
    Equals { key: String, value: String },
    Wildcard {
        key: String,
        pattern: String,
        compiled: Regex,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Parse a filter expression.
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        if trimmed == "*" {
            return Ok(Self::Any);
        }

        let mut parser = Parser {
            src: trimmed,
            pos: 0,
        };
        let filter = parser.parse_filter()?;
        parser.skip_ws();
        if parser.pos != trimmed.len() {
            return Err(parser.error("trailing characters after filter"));
        }
        Ok(filter)
    }

    /// Evaluate the filter against a property map.
    pub fn matches(&self, properties: &Properties) -> bool {
        match self {
            Self::Any => true,
            Self::Present(key) => properties.get(key).is_some_and(|v| !v.is_null()),
            Self::Equals { key, value } => properties
                .get(key)
                .is_some_and(|v| value_matches(v, &|text| text == value)),
            Self::Wildcard { key, compiled, .. } => properties
                .get(key)
                .is_some_and(|v| value_matches(v, &|text| compiled.is_match(text))),
            Self::And(filters) => filters.iter().all(|f| f.matches(properties)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(properties)),
            Self::Not(filter) => !filter.matches(properties),
        }
    }
}

fn value_matches(value: &Value, test: &dyn Fn(&str) -> bool) -> bool {
    match value {
        Value::Null => false,
        Value::String(text) => test(text),
        Value::Array(items) => items.iter().any(|item| value_matches(item, test)),
        other => test(&other.to_string()),
    }
}

impl FromStr for Filter {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Present(key) => write!(f, "({key}=*)"),
            Self::Equals { key, value } => write!(f, "({key}={value})"),
            Self::Wildcard { key, pattern, .. } => write!(f, "({key}={pattern})"),
            Self::And(filters) => write_composite(f, '&', filters),
            Self::Or(filters) => write_composite(f, '|', filters),
            Self::Not(filter) => write!(f, "(!{filter})"),
        }
    }
}

fn write_composite(f: &mut fmt::Formatter<'_>, op: char, filters: &[Filter]) -> fmt::Result {
    write!(f, "({op}")?;
    for filter in filters {
        write!(f, "{filter}")?;
    }
    f.write_str(")")
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn parse_filter(&mut self) -> Result<Filter> {
        self.skip_ws();
        self.expect(b'(')?;
        self.skip_ws();

        let node = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(self.error("unexpected end of filter")),
        };

        self.skip_ws();
        self.expect(b')')?;
        Ok(node)
    }

    fn parse_list(&mut self) -> Result<Vec<Filter>> {
        let mut filters = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() != Some(b'(') {
                break;
            }
            filters.push(self.parse_filter()?);
        }
        if filters.is_empty() {
            return Err(self.error("composite filter has no operands"));
        }
        Ok(filters)
    }

    fn parse_item(&mut self) -> Result<Filter> {
        let src = self.src;
        let rest = &src[self.pos..];
        let end = rest
            .find([')', '('])
            .ok_or_else(|| self.error("unterminated comparison"))?;
        let body = &rest[..end];
        self.pos += end;

        let (key, value) = body
            .split_once('=')
            .ok_or_else(|| self.error("comparison is missing `=`"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(self.error("comparison has an empty key"));
        }
        let key = key.to_owned();

        if value == "*" {
            return Ok(Filter::Present(key));
        }
        if value.contains('*') {
            let regex = format!(
                "(?s)^{}$",
                value
                    .split('*')
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(".*")
            );
            let compiled = Regex::new(&regex).map_err(|e| self.error(&e.to_string()))?;
            return Ok(Filter::Wildcard {
                key,
                pattern: value.to_owned(),
                compiled,
            });
        }
        Ok(Filter::Equals {
            key,
            value: value.to_owned(),
        })
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected `{}`", byte as char)))
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn error(&self, reason: &str) -> BrokerError {
        BrokerError::InvalidFilter {
            filter: self.src.to_owned(),
            reason: format!("{reason} at offset {}", self.pos),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(pairs: &[(&str, Value)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn equality_and_presence() {
        let p = props(&[("type", json!("order")), ("priority", json!(3))]);

        assert!(Filter::parse("(type=order)").unwrap().matches(&p));
        assert!(!Filter::parse("(type=invoice)").unwrap().matches(&p));
        assert!(Filter::parse("(priority=3)").unwrap().matches(&p));
        assert!(Filter::parse("(priority=*)").unwrap().matches(&p));
        assert!(!Filter::parse("(region=*)").unwrap().matches(&p));
    }

    #[test]
    fn wildcard_matching() {
        let f = Filter::parse("(topic=orders.*.created)").unwrap();
        assert!(f.matches(&props(&[("topic", json!("orders.eu.created"))])));
        assert!(!f.matches(&props(&[("topic", json!("orders.eu.deleted"))])));

        // Regex metacharacters in the literal parts are taken literally.
        let f = Filter::parse("(path=a.b*)").unwrap();
        assert!(f.matches(&props(&[("path", json!("a.bcd"))])));
        assert!(!f.matches(&props(&[("path", json!("axbcd"))])));
    }

    #[test]
    fn composites() {
        let p = props(&[("type", json!("order")), ("region", json!("eu"))]);

        assert!(Filter::parse("(&(type=order)(region=eu))").unwrap().matches(&p));
        assert!(!Filter::parse("(&(type=order)(region=us))").unwrap().matches(&p));
        assert!(Filter::parse("(|(region=us)(region=eu))").unwrap().matches(&p));
        assert!(Filter::parse("(!(region=us))").unwrap().matches(&p));
        assert!(
            Filter::parse(" ( & (type=order) (!(region=us)) ) ")
                .unwrap()
                .matches(&p)
        );
    }

    #[test]
    fn array_and_null_values() {
        let p = props(&[("tags", json!(["a", "b"])), ("gone", Value::Null)]);
        assert!(Filter::parse("(tags=b)").unwrap().matches(&p));
        assert!(!Filter::parse("(tags=c)").unwrap().matches(&p));
        assert!(!Filter::parse("(gone=*)").unwrap().matches(&p));
    }

    #[test]
    fn match_all() {
        let f: Filter = "*".parse().unwrap();
        assert!(f.matches(&Properties::new()));
        assert_eq!(f.to_string(), "*");
    }

    #[test]
    fn display_round_trips_text() {
        let text = "(&(type=order)(|(region=eu)(region=u*))(!(test=*)))";
        assert_eq!(Filter::parse(text).unwrap().to_string(), text);
    }

    #[test]
    fn malformed_filters_are_rejected() {
        for bad in [
            "",
            "type=order",
            "(type=order",
            "(=order)",
            "(type)",
            "(&)",
            "(type=order))",
            "(type=order)(x=y)",
        ] {
            let result = Filter::parse(bad);
            assert!(
                matches!(result, Err(BrokerError::InvalidFilter { .. })),
                "expected `{bad}` to be rejected"
            );
        }
    }
}
