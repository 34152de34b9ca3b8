//! CLI alias storage: a flat name → command-string table persisted at
//! `~/.zr/aliases.toml`. Orthogonal to the task graph.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not locate a home directory for the alias file")]
    NoHome,
    #[error("failed to read alias file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write alias file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("alias file is malformed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize aliases: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Aliases {
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

impl Aliases {
    /// Expands an alias into a whitespace-tokenized argument vector. No
    /// nesting, no escaping.
    pub fn expand(&self, name: &str) -> Option<Vec<String>> {
        self.aliases
            .get(name)
            .map(|command| command.split_whitespace().map(String::from).collect())
    }

    pub fn set(&mut self, name: impl Into<String>, command: impl Into<String>) {
        self.aliases.insert(name.into(), command.into());
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.aliases.remove(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.aliases
            .iter()
            .map(|(name, command)| (name.as_str(), command.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

pub struct AliasStore {
    path: Utf8PathBuf,
}

impl AliasStore {
    pub fn new(path: impl AsRef<Utf8Path>) -> Self {
        Self {
            path: path.as_ref().to_owned(),
        }
    }

    /// The default store at `~/.zr/aliases.toml`.
    pub fn default_location() -> Result<Self, Error> {
        let home = crate::zr_home().ok_or(Error::NoHome)?;
        Ok(Self::new(home.join("aliases.toml")))
    }

    /// A missing file is an empty table, not an error.
    pub fn load(&self) -> Result<Aliases, Error> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Aliases::default())
            }
            Err(source) => {
                return Err(Error::Read {
                    path: self.path.to_string(),
                    source,
                })
            }
        };
        Ok(toml::from_str(&contents)?)
    }

    pub fn save(&self, aliases: &Aliases) -> Result<(), Error> {
        let contents = toml::to_string_pretty(aliases)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| Error::Write {
                path: self.path.to_string(),
                source,
            })?;
        }
        std::fs::write(&self.path, contents).map_err(|source| Error::Write {
            path: self.path.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_expand_tokenizes_on_whitespace() {
        let mut aliases = Aliases::default();
        aliases.set("b", "run build --cached");
        assert_eq!(
            aliases.expand("b"),
            Some(vec![
                "run".to_string(),
                "build".to_string(),
                "--cached".to_string()
            ])
        );
        assert_eq!(aliases.expand("missing"), None);
    }

    #[test]
    fn test_round_trip_is_a_fixed_point() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("aliases.toml")).unwrap();
        let store = AliasStore::new(&path);

        let mut aliases = Aliases::default();
        aliases.set("t", "run test");
        aliases.set("b", "run build");
        store.save(&aliases).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, aliases);

        // Writing what was read leaves the file unchanged
        let first = std::fs::read_to_string(&path).unwrap();
        store.save(&loaded).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("nope.toml")).unwrap();
        let store = AliasStore::new(path);
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_remove() {
        let mut aliases = Aliases::default();
        aliases.set("x", "run x");
        assert!(aliases.remove("x"));
        assert!(!aliases.remove("x"));
        assert!(aliases.is_empty());
    }
}
