//! Normalization of the raw configuration into the task table.
//!
//! Expansion order matters and each step leaves the next step's input in
//! canonical form: templates first, then matrix variants, then the
//! active profile, so that profile overrides see final task names.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use itertools::Itertools;

use super::builder::BuilderError;
use crate::{
    config::{self, RawConfig, RawProfile, RawTask, RawTemplate},
    task_graph::{Backoff, RetryPolicy, TaskDefinition},
};

/// The normalized, profile-applied table of tasks for a run.
#[derive(Debug, Clone, Default)]
pub struct TaskTable {
    tasks: BTreeMap<String, Arc<TaskDefinition>>,
}

impl TaskTable {
    pub fn new(config: &RawConfig, profile: Option<&str>) -> Result<Self, BuilderError> {
        let profile = match profile {
            Some(name) => Some(config.profiles.get(name).ok_or_else(|| {
                BuilderError::ProfileNotFound {
                    profile: name.to_string(),
                }
            })?),
            None => None,
        };

        let mut tasks = BTreeMap::new();
        for (name, raw) in &config.tasks {
            let body = apply_template(name, raw, &config.templates)?;
            for mut task in expand_matrix(name, &body, &raw.matrix) {
                if let Some(profile) = profile {
                    apply_profile(&mut task, profile);
                }
                tasks.insert(task.name.clone(), Arc::new(task));
            }
        }

        Ok(TaskTable { tasks })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TaskDefinition>> {
        self.tasks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Tasks in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<TaskDefinition>)> {
        self.tasks.iter().map(|(name, task)| (name.as_str(), task))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// A copy of the table with extra CLI arguments appended to one
    /// task's command line.
    pub fn with_args(&self, name: &str, args: &[String]) -> TaskTable {
        let mut table = self.clone();
        if args.is_empty() {
            return table;
        }
        if let Some(task) = table.tasks.get(name) {
            let mut task = TaskDefinition::clone(task);
            task.cmd = format!("{} {}", task.cmd, args.join(" "));
            table.tasks.insert(name.to_string(), Arc::new(task));
        }
        table
    }
}

/// Replaces the key's value if present, otherwise appends. Keeps env
/// application idempotent: applying the same overlay twice yields the
/// same pairs.
fn merge_env(env: &mut Vec<(String, String)>, key: &str, value: &str) {
    match env.iter_mut().find(|(existing, _)| existing == key) {
        Some((_, existing_value)) => *existing_value = value.to_string(),
        None => env.push((key.to_string(), value.to_string())),
    }
}

fn parse_policy(name: &str, raw: &RawTask) -> Result<(Option<Duration>, RetryPolicy), BuilderError> {
    let timeout = raw
        .timeout
        .as_ref()
        .map(config::parse_duration)
        .transpose()
        .map_err(|source| BuilderError::Config {
            task: name.to_string(),
            source,
        })?
        .flatten();

    let retry = match &raw.retry {
        None => RetryPolicy::default(),
        Some(retry) => RetryPolicy {
            max: retry.max,
            delay: retry
                .delay
                .as_ref()
                .map(config::parse_duration)
                .transpose()
                .map_err(|source| BuilderError::Config {
                    task: name.to_string(),
                    source,
                })?
                .flatten()
                .unwrap_or_default(),
            backoff: match retry.backoff {
                config::RawBackoff::Linear => Backoff::Linear,
                config::RawBackoff::Exponential => Backoff::Exponential,
            },
        },
    };

    Ok((timeout, retry))
}

/// Builds the pre-matrix definition for a task, applying its template
/// (when one is named) and parsing policy scalars.
fn apply_template(
    name: &str,
    raw: &RawTask,
    templates: &BTreeMap<String, RawTemplate>,
) -> Result<TaskDefinition, BuilderError> {
    let template = match &raw.template {
        Some(template_name) => {
            Some(templates.get(template_name).ok_or_else(|| {
                BuilderError::UnknownTemplate {
                    task: name.to_string(),
                    template: template_name.to_string(),
                }
            })?)
        }
        None => None,
    };

    let (timeout, retry) = parse_policy(name, raw)?;
    let max_memory = raw
        .max_memory
        .as_ref()
        .map(config::parse_memory)
        .transpose()
        .map_err(|source| BuilderError::Config {
            task: name.to_string(),
            source,
        })?;

    // The task's own fields win over the template's prototype.
    let mut cmd = raw.cmd.clone();
    let mut cwd = raw.cwd.clone();
    let mut description = raw.description.clone();
    let mut env: Vec<(String, String)> = Vec::new();
    let mut deps = raw.deps.clone();
    let mut deps_serial = raw.deps_serial.clone();
    let mut tags = raw.tags.clone();

    if let Some(template) = template {
        for declared in &template.params {
            if !raw.params.contains_key(declared) {
                return Err(BuilderError::MissingTemplateParameter {
                    task: name.to_string(),
                    param: declared.clone(),
                });
            }
        }

        cmd = cmd.or_else(|| template.cmd.clone());
        cwd = cwd.or_else(|| template.cwd.clone());
        description = description.or_else(|| template.description.clone());
        if deps.is_empty() {
            deps = template.deps.clone();
        }
        if deps_serial.is_empty() {
            deps_serial = template.deps_serial.clone();
        }
        if tags.is_empty() {
            tags = template.tags.clone();
        }
        for (key, value) in template.env.iter() {
            merge_env(&mut env, key, value);
        }
    }
    for (key, value) in raw.env.iter() {
        merge_env(&mut env, key, value);
    }

    if let Some(template) = template {
        let substitute_in = |task: &str, text: &str| {
            substitute_params(text, &template.params, &raw.params).map_err(|kind| match kind {
                PlaceholderError::Unclosed => BuilderError::UnclosedPlaceholder {
                    task: task.to_string(),
                },
                PlaceholderError::Unknown(param) => BuilderError::UnknownParameter {
                    task: task.to_string(),
                    param,
                },
            })
        };

        cmd = cmd.map(|text| substitute_in(name, &text)).transpose()?;
        cwd = cwd.map(|text| substitute_in(name, &text)).transpose()?;
        description = description
            .map(|text| substitute_in(name, &text))
            .transpose()?;
        for (_, value) in env.iter_mut() {
            *value = substitute_in(name, value)?;
        }
    }

    let cmd = cmd.ok_or_else(|| BuilderError::MissingCommand {
        task: name.to_string(),
    })?;

    Ok(TaskDefinition {
        name: name.to_string(),
        cmd,
        description,
        cwd,
        env,
        deps,
        deps_serial,
        timeout,
        allow_failure: raw.allow_failure,
        retry,
        condition: raw.condition.clone(),
        max_concurrent: raw.max_concurrent,
        cache: raw.cache,
        max_cpu: raw.max_cpu,
        max_memory,
        toolchain: raw.toolchain.clone(),
        inputs: raw.inputs.clone(),
        tags,
    })
}

/// Expands a matrix task into one variant per element of the Cartesian
/// product plus a no-op meta-task depending on every variant. Non-matrix
/// tasks pass through untouched. Dimension keys are iterated sorted,
/// which fixes variant naming and makes expansion stable.
fn expand_matrix(
    name: &str,
    body: &TaskDefinition,
    matrix: &BTreeMap<String, Vec<String>>,
) -> Vec<TaskDefinition> {
    if matrix.is_empty() {
        return vec![body.clone()];
    }

    let dimensions: Vec<(&String, &Vec<String>)> = matrix.iter().collect();
    let mut variants = Vec::new();
    for combination in dimensions
        .iter()
        .map(|(_, values)| values.iter())
        .multi_cartesian_product()
    {
        let assignment: Vec<(&str, &str)> = dimensions
            .iter()
            .zip(&combination)
            .map(|((key, _), value)| (key.as_str(), value.as_str()))
            .collect();

        let suffix = assignment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .join(":");

        let substitute = |text: &str| substitute_matrix(text, &assignment);

        let mut variant = body.clone();
        variant.name = format!("{name}:{suffix}");
        variant.cmd = substitute(&variant.cmd);
        if let Some(cwd) = variant.cwd.take() {
            variant.cwd = Some(substitute(&cwd));
        }
        if let Some(description) = variant.description.take() {
            variant.description = Some(substitute(&description));
        }
        for (_, value) in variant.env.iter_mut() {
            *value = substitute(value);
        }
        variants.push(variant);
    }

    // The meta-task gathers all variants so depending on the base name
    // means depending on the whole product.
    let meta = TaskDefinition {
        name: name.to_string(),
        cmd: String::new(),
        description: body.description.clone(),
        deps: variants.iter().map(|variant| variant.name.clone()).collect(),
        tags: body.tags.clone(),
        allow_failure: body.allow_failure,
        ..TaskDefinition::default()
    };
    variants.push(meta);

    variants
}

fn apply_profile(task: &mut TaskDefinition, profile: &RawProfile) {
    for (key, value) in profile.env.iter() {
        merge_env(&mut task.env, key, value);
    }
    if let Some(overrides) = profile.tasks.get(&task.name) {
        if let Some(cmd) = &overrides.cmd {
            task.cmd = cmd.clone();
        }
        if let Some(cwd) = &overrides.cwd {
            task.cwd = Some(cwd.clone());
        }
        for (key, value) in overrides.env.iter() {
            merge_env(&mut task.env, key, value);
        }
    }
}

enum PlaceholderError {
    Unclosed,
    Unknown(String),
}

/// Substitutes `${param}` placeholders from a template call.
/// `${matrix.*}` placeholders are left for the matrix pass.
fn substitute_params(
    text: &str,
    declared: &[String],
    params: &BTreeMap<String, String>,
) -> Result<String, PlaceholderError> {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(PlaceholderError::Unclosed);
        };
        let param = &after[..end];
        if param.starts_with("matrix.") {
            // Not ours; keep the placeholder intact for matrix expansion
            output.push_str(&rest[start..start + 2 + end + 1]);
        } else if !declared.iter().any(|name| name == param) {
            return Err(PlaceholderError::Unknown(param.to_string()));
        } else {
            let value = params
                .get(param)
                .expect("declared params were checked against the call");
            output.push_str(value);
        }
        rest = &after[end + 1..];
    }
    output.push_str(rest);
    Ok(output)
}

/// Substitutes `${matrix.key}` placeholders for one variant. Unknown
/// placeholders are left intact.
fn substitute_matrix(text: &str, assignment: &[(&str, &str)]) -> String {
    let mut output = text.to_string();
    for (key, value) in assignment {
        output = output.replace(&format!("${{matrix.{key}}}"), value);
    }
    output
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn config(contents: &str) -> RawConfig {
        RawConfig::from_str(contents).unwrap()
    }

    #[test]
    fn test_matrix_expansion_names_and_commands() {
        let config = config(
            r#"
            [tasks.test]
            cmd = "t ${matrix.os}"
            matrix = { os = ["linux", "mac"], arch = ["x"] }
            "#,
        );
        let table = TaskTable::new(&config, None).unwrap();

        let names: Vec<&str> = table.iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            vec!["test", "test:arch=x:os=linux", "test:arch=x:os=mac"]
        );

        assert_eq!(table.get("test:arch=x:os=linux").unwrap().cmd, "t linux");
        assert_eq!(table.get("test:arch=x:os=mac").unwrap().cmd, "t mac");

        let meta = table.get("test").unwrap();
        assert!(meta.cmd.is_empty());
        assert_eq!(
            meta.deps,
            vec!["test:arch=x:os=linux", "test:arch=x:os=mac"]
        );
    }

    #[test]
    fn test_matrix_expansion_is_stable() {
        let raw = config(
            r#"
            [tasks.build]
            cmd = "b ${matrix.target} ${matrix.mode}"
            matrix = { target = ["wasm", "native"], mode = ["debug"] }
            "#,
        );
        let first = TaskTable::new(&raw, None).unwrap();
        let second = TaskTable::new(&raw, None).unwrap();
        let names = |table: &TaskTable| {
            table
                .iter()
                .map(|(name, _)| name.to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&first), names(&second));
    }

    #[test]
    fn test_template_expansion() {
        let config = config(
            r#"
            [templates.compile]
            params = ["target"]
            cmd = "cc -o ${target} main.c"
            env = { OUT = "${target}" }

            [tasks.compile-release]
            template = "compile"
            params = { target = "release" }
            "#,
        );
        let table = TaskTable::new(&config, None).unwrap();
        let task = table.get("compile-release").unwrap();
        assert_eq!(task.cmd, "cc -o release main.c");
        assert_eq!(task.env, vec![("OUT".to_string(), "release".to_string())]);
    }

    #[test]
    fn test_template_missing_parameter() {
        let config = config(
            r#"
            [templates.compile]
            params = ["target"]
            cmd = "cc -o ${target} main.c"

            [tasks.broken]
            template = "compile"
            "#,
        );
        let err = TaskTable::new(&config, None).unwrap_err();
        assert!(matches!(
            err,
            BuilderError::MissingTemplateParameter { ref param, .. } if param == "target"
        ));
    }

    #[test]
    fn test_template_unknown_parameter() {
        let config = config(
            r#"
            [templates.compile]
            params = []
            cmd = "cc -o ${target} main.c"

            [tasks.broken]
            template = "compile"
            "#,
        );
        let err = TaskTable::new(&config, None).unwrap_err();
        assert!(matches!(
            err,
            BuilderError::UnknownParameter { ref param, .. } if param == "target"
        ));
    }

    #[test]
    fn test_template_unclosed_placeholder() {
        let config = config(
            r#"
            [templates.compile]
            params = ["target"]
            cmd = "cc -o ${target main.c"

            [tasks.broken]
            template = "compile"
            params = { target = "out" }
            "#,
        );
        let err = TaskTable::new(&config, None).unwrap_err();
        assert!(matches!(err, BuilderError::UnclosedPlaceholder { .. }));
    }

    #[test]
    fn test_profile_overrides_env_and_cmd() {
        let raw = config(
            r#"
            [tasks.serve]
            cmd = "serve --dev"
            env = { PORT = "3000", MODE = "dev" }

            [profiles.prod]
            env = { MODE = "prod" }
            [profiles.prod.tasks.serve]
            cmd = "serve --release"
            env = { PORT = "80" }
            "#,
        );
        let table = TaskTable::new(&raw, Some("prod")).unwrap();
        let serve = table.get("serve").unwrap();
        assert_eq!(serve.cmd, "serve --release");
        // Overlays replace in place, so the declaration order survives
        assert_eq!(
            serve.env,
            vec![
                ("PORT".to_string(), "80".to_string()),
                ("MODE".to_string(), "prod".to_string()),
            ]
        );
    }

    #[test]
    fn test_profile_application_is_idempotent_on_env() {
        let profile = RawProfile {
            env: [("MODE".to_string(), "prod".to_string())].into_iter().collect(),
            tasks: BTreeMap::new(),
        };
        let mut task = TaskDefinition {
            name: "serve".into(),
            cmd: "serve".into(),
            env: vec![("MODE".to_string(), "dev".to_string())],
            ..TaskDefinition::default()
        };
        apply_profile(&mut task, &profile);
        let once = task.env.clone();
        apply_profile(&mut task, &profile);
        assert_eq!(task.env, once);
    }

    #[test]
    fn test_unknown_profile_is_rejected() {
        let raw = config(
            r#"
            [tasks.a]
            cmd = "true"
            "#,
        );
        let err = TaskTable::new(&raw, Some("missing")).unwrap_err();
        assert!(matches!(err, BuilderError::ProfileNotFound { .. }));
    }

    #[test]
    fn test_missing_command_is_rejected() {
        let raw = config(
            r#"
            [tasks.empty]
            description = "no cmd"
            "#,
        );
        let err = TaskTable::new(&raw, None).unwrap_err();
        assert!(matches!(err, BuilderError::MissingCommand { .. }));
    }
}
