//! Configuration ingest for `zr.toml`.
//!
//! This module only deserializes the document and parses scalar shapes
//! (durations, memory sizes). Expansion and validation of the task table
//! live in [`crate::engine`], which consumes these raw structs.

mod parse;

use std::collections::BTreeMap;

use camino::Utf8Path;
pub use parse::{parse_duration, parse_memory};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid duration {value:?}: expected forms like \"500ms\", \"30s\", \"5m\", \"2h\"")]
    InvalidDuration { value: String },
    #[error("invalid memory size {value:?}: expected forms like \"2GB\", \"512MB\", \"100B\"")]
    InvalidMemory { value: String },
}

/// The raw `zr.toml` document. Keys the core does not act on
/// (`plugins`, `tools`, `constraints`) are retained as opaque values for
/// external collaborators.
#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub tasks: BTreeMap<String, RawTask>,
    #[serde(default)]
    pub templates: BTreeMap<String, RawTemplate>,
    #[serde(default)]
    pub workflows: BTreeMap<String, RawWorkflow>,
    #[serde(default)]
    pub profiles: BTreeMap<String, RawProfile>,
    #[serde(default)]
    pub workspace: Option<WorkspaceConfig>,
    #[serde(default)]
    pub plugins: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub tools: Option<toml::Value>,
    #[serde(default)]
    pub constraints: Vec<toml::Value>,
}

impl RawConfig {
    pub fn from_str(contents: &str) -> Result<Self, Error> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Utf8Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_str(&contents)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GlobalConfig {
    /// Number of scheduler workers. Defaults to the host CPU count.
    pub max_workers: Option<usize>,
    pub default_profile: Option<String>,
    pub cache_dir: Option<String>,
}

/// An env table that keeps the TOML declaration order. Deserializing
/// into a sorted or hashed map here would destroy the insertion order
/// the executor and profile layering preserve, so the visitor collects
/// the entries as they appear in the document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvTable(Vec<(String, String)>);

impl EnvTable {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(String, String)> for EnvTable {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        EnvTable(iter.into_iter().collect())
    }
}

impl<'de> Deserialize<'de> for EnvTable {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EnvTableVisitor;

        impl<'de> serde::de::Visitor<'de> for EnvTableVisitor {
            type Value = EnvTable;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a table of string keys to string values")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut pairs = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(entry) = access.next_entry::<String, String>()? {
                    pairs.push(entry);
                }
                Ok(EnvTable(pairs))
            }
        }

        deserializer.deserialize_map(EnvTableVisitor)
    }
}

/// A duration in config: either a humantime-style string ("500ms",
/// "30s", "5m", "2h") or a bare integer of milliseconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RawDuration {
    Millis(u64),
    Text(String),
}

/// A memory size in config: "2GB" / "512MB" / "1024KB" / "100B" or a
/// bare integer of bytes.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RawMemory {
    Bytes(u64),
    Text(String),
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RawBackoff {
    #[default]
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRetry {
    pub max: u32,
    pub delay: Option<RawDuration>,
    #[serde(default)]
    pub backoff: RawBackoff,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTask {
    /// Required unless the task is declared from a template that
    /// provides one.
    pub cmd: Option<String>,
    pub cwd: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub deps_serial: Vec<String>,
    /// Declaration order is kept; it flows through to the resolved
    /// task env.
    #[serde(default)]
    pub env: EnvTable,
    /// "0ms" (or 0) means no timeout.
    pub timeout: Option<RawDuration>,
    #[serde(default)]
    pub allow_failure: bool,
    pub retry: Option<RawRetry>,
    pub condition: Option<String>,
    /// 0 means unlimited concurrent instances of this task.
    #[serde(default)]
    pub max_concurrent: u32,
    /// Defaults to false: tasks opt into caching.
    #[serde(default)]
    pub cache: bool,
    pub max_cpu: Option<u32>,
    pub max_memory: Option<RawMemory>,
    /// `tool@version` specs resolved by the toolchain collaborator.
    #[serde(default)]
    pub toolchain: Vec<String>,
    /// Files whose content participates in the cache fingerprint.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Matrix dimensions; a non-empty table expands this task into one
    /// variant per element of the Cartesian product plus a meta-task.
    #[serde(default)]
    pub matrix: BTreeMap<String, Vec<String>>,
    /// Name of the template this task is declared from.
    pub template: Option<String>,
    /// Arguments for the template's declared parameters.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// A parameterized task prototype. `${param}` placeholders in the body
/// are substituted at expansion time.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTemplate {
    /// Declared parameters; every one of them must be supplied by each
    /// task instantiating the template.
    #[serde(default)]
    pub params: Vec<String>,
    pub cmd: Option<String>,
    pub cwd: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub env: EnvTable,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub deps_serial: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawWorkflow {
    pub description: Option<String>,
    /// Whether a failed stage stops the workflow after its on_failure
    /// hook. Defaults to true.
    pub fail_fast: Option<bool>,
    #[serde(default)]
    pub stages: Vec<RawStage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStage {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<String>,
    /// Concurrent (dependency-ordered) vs sequential (array-ordered)
    /// execution within the stage.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub fail_fast: bool,
    /// Evaluated once per workflow attempt, not per task.
    pub condition: Option<String>,
    #[serde(default)]
    pub approval: bool,
    pub on_failure: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawProfile {
    #[serde(default)]
    pub env: EnvTable,
    #[serde(default)]
    pub tasks: BTreeMap<String, RawProfileTaskOverride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawProfileTaskOverride {
    pub cmd: Option<String>,
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: EnvTable,
}

/// Parsed and forwarded; the core validates shape only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_minimal_task() {
        let config = RawConfig::from_str(
            r#"
            [tasks.build]
            cmd = "make build"
            "#,
        )
        .unwrap();
        let build = &config.tasks["build"];
        assert_eq!(build.cmd.as_deref(), Some("make build"));
        assert!(!build.cache);
        assert_eq!(build.max_concurrent, 0);
    }

    #[test]
    fn test_parse_full_task() {
        let config = RawConfig::from_str(
            r#"
            [tasks.test]
            cmd = "cargo test"
            cwd = "crates/core"
            deps = ["build"]
            deps_serial = ["migrate", "seed"]
            env = { RUST_BACKTRACE = "1" }
            timeout = "30s"
            allow_failure = true
            retry = { max = 2, delay = "10ms", backoff = "exponential" }
            condition = "env.CI == 'true'"
            max_concurrent = 1
            cache = true
            max_cpu = 4
            max_memory = "2GB"
            toolchain = ["rust@1.67.0"]
            tags = ["ci"]
            "#,
        )
        .unwrap();
        let test = &config.tasks["test"];
        assert_eq!(test.deps, vec!["build"]);
        assert_eq!(test.deps_serial, vec!["migrate", "seed"]);
        assert_eq!(test.timeout, Some(RawDuration::Text("30s".into())));
        let retry = test.retry.as_ref().unwrap();
        assert_eq!(retry.max, 2);
        assert_eq!(retry.backoff, RawBackoff::Exponential);
        assert_eq!(test.max_memory, Some(RawMemory::Text("2GB".into())));
        assert!(test.allow_failure);
    }

    #[test]
    fn test_parse_workflow() {
        let config = RawConfig::from_str(
            r#"
            [workflows.release]
            [[workflows.release.stages]]
            name = "verify"
            tasks = ["lint", "test"]
            parallel = true
            fail_fast = true

            [[workflows.release.stages]]
            name = "ship"
            tasks = ["publish"]
            condition = "stages['verify'].success"
            approval = true
            on_failure = "rollback"
            "#,
        )
        .unwrap();
        let release = &config.workflows["release"];
        assert_eq!(release.stages.len(), 2);
        assert_eq!(release.stages[0].name, "verify");
        assert!(release.stages[0].parallel);
        assert!(release.stages[1].approval);
        assert_eq!(release.stages[1].on_failure.as_deref(), Some("rollback"));
    }

    #[test]
    fn test_parse_profile_and_matrix() {
        let config = RawConfig::from_str(
            r#"
            [tasks.test]
            cmd = "t ${matrix.os}"
            matrix = { os = ["linux", "mac"], arch = ["x"] }

            [profiles.ci]
            env = { CI = "true" }
            [profiles.ci.tasks.test]
            cmd = "t --ci ${matrix.os}"
            "#,
        )
        .unwrap();
        assert_eq!(config.tasks["test"].matrix["os"], vec!["linux", "mac"]);
        assert_eq!(config.profiles["ci"].env.get("CI"), Some("true"));
    }

    #[test]
    fn test_env_keeps_declaration_order() {
        let config = RawConfig::from_str(
            r#"
            [tasks.serve]
            cmd = "serve"
            env = { ZED = "last-letter", ALPHA = "first-letter", MID = "middle" }
            "#,
        )
        .unwrap();
        let pairs: Vec<(&str, &str)> = config.tasks["serve"].env.iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("ZED", "last-letter"),
                ("ALPHA", "first-letter"),
                ("MID", "middle")
            ]
        );
    }

    #[test]
    fn test_parse_workspace_and_global() {
        let config = RawConfig::from_str(
            r#"
            [global]
            max_workers = 8
            default_profile = "dev"

            [workspace]
            members = ["packages/*"]
            ignore = ["packages/legacy"]
            dependencies = ["packages/shared"]
            "#,
        )
        .unwrap();
        assert_eq!(config.global.max_workers, Some(8));
        assert_eq!(config.global.default_profile.as_deref(), Some("dev"));
        let workspace = config.workspace.unwrap();
        assert_eq!(workspace.members, vec!["packages/*"]);
        assert_eq!(workspace.ignore, vec!["packages/legacy"]);
        assert_eq!(workspace.dependencies, vec!["packages/shared"]);
    }

    #[test]
    fn test_unknown_sections_are_forwarded() {
        let config = RawConfig::from_str(
            r#"
            [tasks.a]
            cmd = "true"

            [plugins.slack]
            webhook = "https://example.invalid/hook"

            [tools]
            node = "18"

            [[constraints]]
            rule = "no-circular"
            "#,
        )
        .unwrap();
        assert!(config.plugins.contains_key("slack"));
        assert!(config.tools.is_some());
        assert_eq!(config.constraints.len(), 1);
    }
}
