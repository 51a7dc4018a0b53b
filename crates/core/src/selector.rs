//! Kubernetes label selectors: parsing, canonical rendering and matching.
//!
//! Supported requirements, comma separated:
//! - `key=value`, `key==value`, `key!=value`
//! - `key in (a,b)`, `key notin (a,b)`
//! - `key` (exists), `!key` (does not exist)
//!
//! The empty selector matches every label set.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{CoreError, Labels};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    NotExists(String),
}

impl Requirement {
    pub fn key(&self) -> &str {
        match self {
            Requirement::Equals(k, _)
            | Requirement::NotEquals(k, _)
            | Requirement::In(k, _)
            | Requirement::NotIn(k, _)
            | Requirement::Exists(k)
            | Requirement::NotExists(k) => k,
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(self.key());
        match self {
            Requirement::Equals(_, v) => value == Some(v),
            // Absent keys satisfy negative requirements.
            Requirement::NotEquals(_, v) => value != Some(v),
            Requirement::In(_, set) => value.map(|v| set.contains(v)).unwrap_or(false),
            Requirement::NotIn(_, set) => value.map(|v| !set.contains(v)).unwrap_or(true),
            Requirement::Exists(_) => value.is_some(),
            Requirement::NotExists(_) => value.is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(set: &BTreeSet<String>) -> String {
            set.iter().map(String::as_str).collect::<Vec<_>>().join(",")
        }
        match self {
            Requirement::Equals(k, v) => write!(f, "{}={}", k, v),
            Requirement::NotEquals(k, v) => write!(f, "{}!={}", k, v),
            Requirement::In(k, set) => write!(f, "{} in ({})", k, join(set)),
            Requirement::NotIn(k, set) => write!(f, "{} notin ({})", k, join(set)),
            Requirement::Exists(k) => write!(f, "{}", k),
            Requirement::NotExists(k) => write!(f, "!{}", k),
        }
    }
}

/// Conjunction of label requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Selector matching everything.
    pub fn everything() -> Self { Self::default() }

    pub fn from_requirements(requirements: Vec<Requirement>) -> Self { Self { requirements } }

    /// Shorthand for a single `key=value` requirement.
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { requirements: vec![Requirement::Equals(key.into(), value.into())] }
    }

    pub fn requirements(&self) -> &[Requirement] { &self.requirements }

    pub fn is_empty(&self) -> bool { self.requirements.is_empty() }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

impl FromStr for LabelSelector {
    type Err = CoreError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let err = |reason: &str| CoreError::InvalidSelector { input: input.to_string(), reason: reason.to_string() };
        let mut requirements = Vec::new();
        for raw in split_top_level(input).map_err(|r| err(r))? {
            let part = raw.trim();
            if part.is_empty() {
                if input.trim().is_empty() { continue; }
                return Err(err("empty requirement"));
            }
            requirements.push(parse_requirement(part).map_err(|r| err(r))?);
        }
        Ok(Self { requirements })
    }
}

impl Serialize for LabelSelector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LabelSelector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// Split on commas that are not inside a `( ... )` value list.
fn split_top_level(input: &str) -> Result<Vec<&str>, &'static str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, ch) in input.char_indices() {
        match ch {
            '(' => {
                if depth > 0 { return Err("nested parenthesis"); }
                depth += 1;
            }
            ')' => {
                if depth == 0 { return Err("unbalanced parenthesis"); }
                depth -= 1;
            }
            ',' if depth == 0 => {
                out.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 { return Err("unbalanced parenthesis"); }
    out.push(&input[start..]);
    Ok(out)
}

fn parse_requirement(part: &str) -> Result<Requirement, &'static str> {
    if let Some(key) = part.strip_prefix('!') {
        let key = key.trim();
        validate_key(key)?;
        return Ok(Requirement::NotExists(key.to_string()));
    }
    if let Some(open) = part.find('(') {
        let head = part[..open].trim();
        let rest = part[open + 1..].trim_end();
        let inner = rest.strip_suffix(')').ok_or("set must end with ')'")?;
        let mut words = head.split_whitespace();
        let key = words.next().ok_or("missing key")?;
        let op = words.next().ok_or("missing set operator")?;
        if words.next().is_some() { return Err("unexpected token before value set"); }
        validate_key(key)?;
        if inner.trim().is_empty() { return Err("empty value set"); }
        let mut values = BTreeSet::new();
        for v in inner.split(',') {
            let v = v.trim();
            validate_value(v)?;
            values.insert(v.to_string());
        }
        return match op {
            "in" => Ok(Requirement::In(key.to_string(), values)),
            "notin" => Ok(Requirement::NotIn(key.to_string(), values)),
            _ => Err("unknown set operator"),
        };
    }
    let (key, value, negated) = if let Some((k, v)) = part.split_once("!=") {
        (k, v, true)
    } else if let Some((k, v)) = part.split_once("==") {
        (k, v, false)
    } else if let Some((k, v)) = part.split_once('=') {
        (k, v, false)
    } else {
        validate_key(part)?;
        return Ok(Requirement::Exists(part.to_string()));
    };
    let (key, value) = (key.trim(), value.trim());
    validate_key(key)?;
    validate_value(value)?;
    if negated {
        Ok(Requirement::NotEquals(key.to_string(), value.to_string()))
    } else {
        Ok(Requirement::Equals(key.to_string(), value.to_string()))
    }
}

// `[prefix/]name`: prefix is a DNS subdomain, name a qualified name.
fn validate_key(key: &str) -> Result<(), &'static str> {
    if key.is_empty() { return Err("empty key"); }
    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            validate_dns_subdomain(prefix)?;
            name
        }
        None => key,
    };
    if name.is_empty() { return Err("empty key name"); }
    if name.len() > 63 { return Err("key name too long"); }
    if !is_qualified(name) { return Err("invalid key name"); }
    Ok(())
}

fn validate_dns_subdomain(prefix: &str) -> Result<(), &'static str> {
    if prefix.is_empty() { return Err("empty key prefix"); }
    if prefix.len() > 253 { return Err("key prefix too long"); }
    let label_ok = |l: &str| {
        !l.is_empty()
            && l.len() <= 63
            && l.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !l.starts_with('-')
            && !l.ends_with('-')
    };
    if !prefix.split('.').all(label_ok) { return Err("invalid key prefix"); }
    Ok(())
}

// Alphanumeric at both ends, `-`, `_` or `.` allowed in between.
fn is_qualified(s: &str) -> bool {
    let alnum = |c: char| c.is_ascii_alphanumeric();
    s.starts_with(alnum)
        && s.ends_with(alnum)
        && s.chars().all(|c| alnum(c) || matches!(c, '.' | '_' | '-'))
}

fn validate_value(value: &str) -> Result<(), &'static str> {
    if value.is_empty() { return Ok(()); }
    if value.len() > 63 { return Err("value too long"); }
    if !is_qualified(value) { return Err("invalid value"); }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel: LabelSelector = "".parse().unwrap();
        assert!(sel.is_empty());
        assert!(sel.matches(&Labels::new()));
        assert!(sel.matches(&labels(&[("a", "b")])));
    }

    #[test]
    fn equality_operators() {
        let l = labels(&[("app.kubernetes.io/instance", "kyverno"), ("tier", "web")]);
        assert!("app.kubernetes.io/instance=kyverno".parse::<LabelSelector>().unwrap().matches(&l));
        assert!("tier==web".parse::<LabelSelector>().unwrap().matches(&l));
        assert!(!"tier!=web".parse::<LabelSelector>().unwrap().matches(&l));
        // missing key satisfies !=
        assert!("env!=prod".parse::<LabelSelector>().unwrap().matches(&l));
        assert!(!"tier=db".parse::<LabelSelector>().unwrap().matches(&l));
    }

    #[test]
    fn set_and_existence_operators() {
        let l = labels(&[("env", "prod"), ("team", "a")]);
        assert!("env in (prod, staging)".parse::<LabelSelector>().unwrap().matches(&l));
        assert!(!"env notin (prod)".parse::<LabelSelector>().unwrap().matches(&l));
        assert!("region notin (eu)".parse::<LabelSelector>().unwrap().matches(&l));
        assert!(!"region in (eu)".parse::<LabelSelector>().unwrap().matches(&l));
        assert!("team".parse::<LabelSelector>().unwrap().matches(&l));
        assert!("!owner".parse::<LabelSelector>().unwrap().matches(&l));
        assert!(!"!team".parse::<LabelSelector>().unwrap().matches(&l));
    }

    #[test]
    fn conjunction_requires_all() {
        let sel: LabelSelector = "env in (prod,staging),team=a,!legacy".parse().unwrap();
        assert_eq!(sel.requirements().len(), 3);
        assert!(sel.matches(&labels(&[("env", "staging"), ("team", "a")])));
        assert!(!sel.matches(&labels(&[("env", "staging"), ("team", "a"), ("legacy", "")])));
        assert!(!sel.matches(&labels(&[("env", "dev"), ("team", "a")])));
    }

    #[test]
    fn renders_canonical_form() {
        let sel: LabelSelector = " env in ( staging , prod ),tier == web, !legacy ,x!=y".parse().unwrap();
        assert_eq!(sel.to_string(), "env in (prod,staging),tier=web,!legacy,x!=y");
        let again: LabelSelector = sel.to_string().parse().unwrap();
        assert_eq!(again, sel);
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["a=b,,c=d", "env in (a", "env in a)", "env within (a)", "=v", "a b=c", "k=v v", "env in ((a))"] {
            assert!(bad.parse::<LabelSelector>().is_err(), "expected error for {:?}", bad);
        }
    }

    #[test]
    fn rejects_selectors_the_api_server_refuses() {
        let long_name = format!("{}=x", "a".repeat(64));
        for bad in [
            "env in ()",
            "env notin ( )",
            "a/b/c=x",
            "-bad-=x",
            "bad-=x",
            "/name=x",
            "example.com/=x",
            "Example.com/name=x",
            "-example.com/name=x",
            "env=-prod",
            "env=prod.",
            "env in (ok,_bad)",
            long_name.as_str(),
        ] {
            assert!(bad.parse::<LabelSelector>().is_err(), "expected error for {:?}", bad);
        }
        for good in ["app.kubernetes.io/instance=kyverno", "a_b.c-d=x", "env=", "x=A1", "k8s.io/x in (a.b,c_d)"] {
            assert!(good.parse::<LabelSelector>().is_ok(), "expected {:?} to parse", good);
        }
    }

    #[test]
    fn serde_uses_string_form() {
        let sel = LabelSelector::eq("app", "kyverno");
        let json = serde_json::to_string(&sel).unwrap();
        assert_eq!(json, "\"app=kyverno\"");
        let back: LabelSelector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sel);
    }
}
