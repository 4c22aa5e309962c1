/*
 * Copyright (C) 2024 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Per-host extra configuration directives.
//!
//! Extras are keyed either by [`BASE_KEY`], for server-wide additions, or
//! by the canonical server name of a virtual host. A key may be given one
//! directive or many; either way it is stored as a sequence.

use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExtrasError {
    #[error("extra must have the form KEY=DIRECTIVE: {0:?}")]
    InvalidAssignment(String),
}

pub const BASE_KEY: &str = "base";

/// One or more configuration directives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "OneOrMany")]
pub struct Directives(Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for Directives {
    fn from(v: OneOrMany) -> Self {
        match v {
            OneOrMany::One(s) => Self(vec![s]),
            OneOrMany::Many(v) => Self(v),
        }
    }
}

impl Directives {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl From<&str> for Directives {
    fn from(s: &str) -> Self {
        Self(vec![s.to_string()])
    }
}

impl From<String> for Directives {
    fn from(s: String) -> Self {
        Self(vec![s])
    }
}

impl From<Vec<String>> for Directives {
    fn from(v: Vec<String>) -> Self {
        Self(v)
    }
}

impl From<Vec<&str>> for Directives {
    fn from(v: Vec<&str>) -> Self {
        Self(v.into_iter().map(|s| s.to_string()).collect())
    }
}

impl From<&[&str]> for Directives {
    fn from(v: &[&str]) -> Self {
        Self(v.iter().map(|s| s.to_string()).collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Extras {
    map: BTreeMap<String, Directives>,
}

impl Extras {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the directives for `key`, replacing any already present.
    pub fn insert<K, D>(&mut self, key: K, directives: D)
    where
        K: Into<String>,
        D: Into<Directives>,
    {
        self.map.insert(key.into(), directives.into());
    }

    pub fn with<K, D>(mut self, key: K, directives: D) -> Self
    where
        K: Into<String>,
        D: Into<Directives>,
    {
        self.insert(key, directives);

        self
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.map.get(key).map(|d| d.as_slice())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(|k| k.as_str())
    }

    /// Parses `KEY=DIRECTIVE` into an entry, appending to an existing key.
    pub fn add_assignment(&mut self, s: &str) -> Result<(), ExtrasError> {
        let (key, directive) = match s.split_once('=') {
            Some((k, d)) if !k.trim().is_empty() => (k.trim(), d.trim()),
            _ => return Err(ExtrasError::InvalidAssignment(s.to_string())),
        };

        self.map
            .entry(key.to_string())
            .or_default()
            .0
            .push(directive.to_string());

        Ok(())
    }
}

/// Merges two extras maps. Keys found in only one map are copied; for keys
/// in both, the directives of `e1` come first, followed by those of `e2`.
pub fn merge(e1: Option<&Extras>, e2: Option<&Extras>) -> Option<Extras> {
    let (e1, e2) = match (e1, e2) {
        (None, None) => return None,
        (Some(e1), None) => return Some(e1.clone()),
        (None, Some(e2)) => return Some(e2.clone()),
        (Some(e1), Some(e2)) => (e1, e2),
    };

    let mut e3 = e1.clone();

    for (name, val) in &e2.map {
        e3.map
            .entry(name.clone())
            .or_default()
            .0
            .extend(val.0.iter().cloned());
    }

    Some(e3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_values_become_sequences() {
        let e = Extras::new()
            .with("a", "x")
            .with("b", vec!["y", "z"]);

        assert_eq!(e.get("a"), Some(&["x".to_string()][..]));
        assert_eq!(e.get("b").unwrap().len(), 2);
        assert_eq!(e.get("A"), None);
    }

    #[test]
    fn merge_concatenates_in_order() {
        let e1 = Extras::new().with("a", "x");
        let e2 = Extras::new().with("a", "y");

        let m = merge(Some(&e1), Some(&e2)).unwrap();
        assert_eq!(m.get("a").unwrap(), &["x".to_string(), "y".to_string()]);

        let m = merge(Some(&e2), Some(&e1)).unwrap();
        assert_eq!(m.get("a").unwrap(), &["y".to_string(), "x".to_string()]);
    }

    #[test]
    fn merge_copies_disjoint_keys() {
        let e1 = Extras::new().with("base", "LogLevel http2:debug");
        let e2 = Extras::new().with("cgi.test", vec!["AddHandler cgi-script .py"]);

        let m = merge(Some(&e1), Some(&e2)).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.get("base").unwrap(), &["LogLevel http2:debug".to_string()]);
        assert_eq!(
            m.get("cgi.test").unwrap(),
            &["AddHandler cgi-script .py".to_string()]
        );

        // inputs are left alone
        assert_eq!(e1.len(), 1);
        assert_eq!(e2.len(), 1);
    }

    #[test]
    fn merge_with_nothing_is_a_copy() {
        let e = Extras::new().with("a", vec!["x", "y"]);

        assert_eq!(merge(Some(&e), None), Some(e.clone()));
        assert_eq!(merge(None, Some(&e)), Some(e.clone()));
        assert_eq!(merge(None, None), None);
    }

    #[test]
    fn merge_is_associative() {
        let a = Extras::new().with("k", "1").with("a", "a");
        let b = Extras::new().with("k", vec!["2", "3"]);
        let c = Extras::new().with("k", "4").with("c", "c");

        let left = merge(merge(Some(&a), Some(&b)).as_ref(), Some(&c));
        let right = merge(Some(&a), merge(Some(&b), Some(&c)).as_ref());

        assert_eq!(left, right);
        assert_eq!(
            left.unwrap().get("k").unwrap(),
            &["1", "2", "3", "4"].map(|s| s.to_string())[..]
        );
    }

    #[test]
    fn deserialize_mixed_values() {
        let e: Extras = serde_json::from_str(
            r#"{"base": "H2MinWorkers 1", "test1.example": ["Protocols h2", "H2Push off"]}"#,
        )
        .unwrap();

        assert_eq!(e.get("base").unwrap(), &["H2MinWorkers 1".to_string()]);
        assert_eq!(e.get("test1.example").unwrap().len(), 2);
    }

    #[test]
    fn assignments() {
        let mut e = Extras::new();
        e.add_assignment("base=LogLevel debug").unwrap();
        e.add_assignment("base = H2Push off").unwrap();

        assert_eq!(
            e.get("base").unwrap(),
            &["LogLevel debug".to_string(), "H2Push off".to_string()]
        );
        assert_eq!(
            e.add_assignment("no-equals"),
            Err(ExtrasError::InvalidAssignment("no-equals".to_string()))
        );
        assert!(e.add_assignment("=x").is_err());
    }
}
