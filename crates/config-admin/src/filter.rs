//! LDAP-style filter expressions over configuration dictionaries.
//!
//! Supported syntax: `(&f1 f2 ..)`, `(|f1 f2 ..)`, `(!f)`, `(attr=value)`,
//! `(attr=*)`, `(attr=pre*mid*post)`, `(attr~=value)`, `(attr>=value)` and
//! `(attr<=value)`. A backslash escapes the next character inside values.
//! Attribute names are matched case-insensitively, like dictionary keys.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{ConfigAdminError, Result};
use crate::properties::Properties;

/// A parsed filter expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equal { attr: String, value: String },
    Approx { attr: String, value: String },
    GreaterEq { attr: String, value: String },
    LessEq { attr: String, value: String },
    Present { attr: String },
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
}

impl Filter {
    pub fn parse(input: &str) -> Result<Filter> {
        let mut parser = Parser {
            chars: input.chars().collect(),
            pos: 0,
        };
        parser.skip_ws();
        let filter = parser.filter()?;
        parser.skip_ws();
        if parser.pos != parser.chars.len() {
            return Err(parser.fail("unexpected trailing characters"));
        }
        Ok(filter)
    }

    pub fn equal(attr: impl Into<String>, value: impl Into<String>) -> Filter {
        Filter::Equal {
            attr: attr.into(),
            value: value.into(),
        }
    }

    /// Evaluate the filter against a dictionary.
    pub fn matches(&self, props: &Properties) -> bool {
        match self {
            Filter::And(items) => items.iter().all(|f| f.matches(props)),
            Filter::Or(items) => items.iter().any(|f| f.matches(props)),
            Filter::Not(inner) => !inner.matches(props),
            Filter::Present { attr } => props.contains_key(attr),
            Filter::Equal { attr, value } => {
                lookup(props, attr, |v| compare(v, value) == Some(Ordering::Equal))
            }
            Filter::Approx { attr, value } => lookup(props, attr, |v| approx(v, value)),
            Filter::GreaterEq { attr, value } => lookup(props, attr, |v| {
                matches!(compare(v, value), Some(Ordering::Greater | Ordering::Equal))
            }),
            Filter::LessEq { attr, value } => lookup(props, attr, |v| {
                matches!(compare(v, value), Some(Ordering::Less | Ordering::Equal))
            }),
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => lookup(props, attr, |v| match v {
                Value::String(s) => substring_match(s, initial.as_deref(), any, last.as_deref()),
                _ => false,
            }),
        }
    }
}

impl FromStr for Filter {
    type Err = ConfigAdminError;

    fn from_str(s: &str) -> Result<Self> {
        Filter::parse(s)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(items) | Filter::Or(items) => {
                let op = if matches!(self, Filter::And(_)) { '&' } else { '|' };
                write!(f, "({}", op)?;
                for item in items {
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::Equal { attr, value } => write!(f, "({}={})", attr, escape(value)),
            Filter::Approx { attr, value } => write!(f, "({}~={})", attr, escape(value)),
            Filter::GreaterEq { attr, value } => write!(f, "({}>={})", attr, escape(value)),
            Filter::LessEq { attr, value } => write!(f, "({}<={})", attr, escape(value)),
            Filter::Present { attr } => write!(f, "({}=*)", attr),
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => {
                write!(f, "({}=", attr)?;
                if let Some(initial) = initial {
                    write!(f, "{}", escape(initial))?;
                }
                write!(f, "*")?;
                for part in any {
                    write!(f, "{}*", escape(part))?;
                }
                if let Some(last) = last {
                    write!(f, "{}", escape(last))?;
                }
                write!(f, ")")
            }
        }
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '(' | ')' | '*' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Apply `test` to the attribute value; arrays match if any element does.
fn lookup(props: &Properties, attr: &str, test: impl Fn(&Value) -> bool) -> bool {
    match props.get(attr) {
        Some(Value::Array(items)) => items.iter().any(&test),
        Some(v) => test(v),
        None => false,
    }
}

fn compare(actual: &Value, wanted: &str) -> Option<Ordering> {
    match actual {
        Value::String(s) => Some(s.as_str().cmp(wanted)),
        Value::Bool(b) => wanted
            .trim()
            .parse::<bool>()
            .ok()
            .filter(|w| w == b)
            .map(|_| Ordering::Equal),
        Value::Number(n) => {
            if let (Some(a), Ok(w)) = (n.as_i64(), wanted.trim().parse::<i64>()) {
                Some(a.cmp(&w))
            } else {
                let a = n.as_f64()?;
                let w = wanted.trim().parse::<f64>().ok()?;
                a.partial_cmp(&w)
            }
        }
        _ => None,
    }
}

fn approx(actual: &Value, wanted: &str) -> bool {
    let fold = |s: &str| -> String {
        s.chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect()
    };
    match actual {
        Value::String(s) => fold(s) == fold(wanted),
        other => compare(other, wanted) == Some(Ordering::Equal),
    }
}

fn substring_match(s: &str, initial: Option<&str>, any: &[String], last: Option<&str>) -> bool {
    let mut rest = s;
    if let Some(initial) = initial {
        match rest.strip_prefix(initial) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for part in any {
        match rest.find(part.as_str()) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    match last {
        Some(last) => rest.ends_with(last),
        None => true,
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn fail(&self, reason: &str) -> ConfigAdminError {
        ConfigAdminError::InvalidFilter {
            offset: self.pos,
            reason: reason.to_string(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.fail(&format!("expected '{}'", c)))
        }
    }

    fn filter(&mut self) -> Result<Filter> {
        self.expect('(')?;
        self.skip_ws();
        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.filter_list()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.filter_list()?)
            }
            Some('!') => {
                self.pos += 1;
                self.skip_ws();
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(self.fail("unexpected end of filter")),
        };
        self.skip_ws();
        self.expect(')')?;
        Ok(filter)
    }

    fn filter_list(&mut self) -> Result<Vec<Filter>> {
        let mut items = Vec::new();
        self.skip_ws();
        while self.peek() == Some('(') {
            items.push(self.filter()?);
            self.skip_ws();
        }
        if items.is_empty() {
            return Err(self.fail("empty filter list"));
        }
        Ok(items)
    }

    fn item(&mut self) -> Result<Filter> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, '=' | '~' | '>' | '<' | '(' | ')') {
                break;
            }
            self.pos += 1;
        }
        let attr: String = self.chars[start..self.pos].iter().collect();
        let attr = attr.trim().to_string();
        if attr.is_empty() {
            return Err(self.fail("missing attribute name"));
        }

        let op = match self.peek() {
            Some('=') => {
                self.pos += 1;
                '='
            }
            Some(c @ ('~' | '>' | '<')) => {
                self.pos += 1;
                self.expect('=')?;
                c
            }
            _ => return Err(self.fail("expected comparison operator")),
        };

        let parts = self.value()?;
        match op {
            '=' => Ok(Self::equality(attr, parts)),
            _ if parts.len() != 1 => Err(self.fail("wildcards only allowed with '='")),
            '~' => Ok(Filter::Approx {
                attr,
                value: parts.into_iter().collect(),
            }),
            '>' => Ok(Filter::GreaterEq {
                attr,
                value: parts.into_iter().collect(),
            }),
            _ => Ok(Filter::LessEq {
                attr,
                value: parts.into_iter().collect(),
            }),
        }
    }

    /// Read a value, split at unescaped `*`.
    fn value(&mut self) -> Result<Vec<String>> {
        let mut parts = vec![String::new()];
        loop {
            match self.peek() {
                Some(')') => break,
                Some('(') => return Err(self.fail("unescaped '(' in value")),
                Some('\\') => {
                    self.pos += 1;
                    let c = self.peek().ok_or_else(|| self.fail("dangling escape"))?;
                    if let Some(last) = parts.last_mut() {
                        last.push(c);
                    }
                    self.pos += 1;
                }
                Some('*') => {
                    parts.push(String::new());
                    self.pos += 1;
                }
                Some(c) => {
                    if let Some(last) = parts.last_mut() {
                        last.push(c);
                    }
                    self.pos += 1;
                }
                None => return Err(self.fail("unterminated value")),
            }
        }
        Ok(parts)
    }

    fn equality(attr: String, mut parts: Vec<String>) -> Filter {
        if parts.len() == 1 {
            return Filter::Equal {
                attr,
                value: parts.remove(0),
            };
        }
        if parts.len() == 2 && parts.iter().all(String::is_empty) {
            return Filter::Present { attr };
        }
        let last = parts.pop().filter(|s| !s.is_empty());
        let initial = Some(parts.remove(0)).filter(|s| !s.is_empty());
        let any = parts.into_iter().filter(|s| !s.is_empty()).collect();
        Filter::Substring {
            attr,
            initial,
            any,
            last,
        }
    }
}
