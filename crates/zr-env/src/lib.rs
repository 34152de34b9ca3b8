#![deny(clippy::all)]

//! Environment variable handling for task execution and hashing.

use std::{
    collections::HashMap,
    env,
    ops::{Deref, DerefMut},
};

use serde::Serialize;

/// A list of "k=v" strings for env variables and their values
pub type EnvironmentVariablePairs = Vec<String>;

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct EnvironmentVariableMap(HashMap<String, String>);

impl EnvironmentVariableMap {
    /// Snapshot of the current process environment.
    pub fn infer() -> Self {
        EnvironmentVariableMap(env::vars().collect())
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }

    // Takes another EnvironmentVariableMap and adds it into `self`.
    // Overwrites values if they already exist.
    pub fn union(&mut self, another: &EnvironmentVariableMap) {
        for (key, value) in &another.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// A stable representation for hashing: "k=v" pairs sorted by key so
    /// that insertion order never leaks into a fingerprint.
    pub fn to_hashable(&self) -> EnvironmentVariablePairs {
        let mut pairs: Vec<_> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort();
        pairs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.keys().cloned().collect();
        names.sort();
        names
    }
}

impl From<HashMap<String, String>> for EnvironmentVariableMap {
    fn from(map: HashMap<String, String>) -> Self {
        EnvironmentVariableMap(map)
    }
}

impl FromIterator<(String, String)> for EnvironmentVariableMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        EnvironmentVariableMap(iter.into_iter().collect())
    }
}

impl Deref for EnvironmentVariableMap {
    type Target = HashMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for EnvironmentVariableMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn map(pairs: &[(&str, &str)]) -> EnvironmentVariableMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_union_overwrites() {
        let mut base = map(&[("A", "1"), ("B", "2")]);
        let overlay = map(&[("B", "3"), ("C", "4")]);
        base.union(&overlay);
        assert_eq!(base, map(&[("A", "1"), ("B", "3"), ("C", "4")]));
    }

    #[test]
    fn test_to_hashable_is_sorted() {
        let vars = map(&[("ZED", "z"), ("ALPHA", "a"), ("MID", "m")]);
        assert_eq!(
            vars.to_hashable(),
            vec![
                "ALPHA=a".to_string(),
                "MID=m".to_string(),
                "ZED=z".to_string()
            ]
        );
    }

    #[test]
    fn test_union_is_idempotent() {
        let mut base = map(&[("A", "1")]);
        let overlay = map(&[("A", "2"), ("B", "3")]);
        base.union(&overlay);
        let once = base.clone();
        base.union(&overlay);
        assert_eq!(base, once);
    }
}
