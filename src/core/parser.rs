//! ST-031: YAML parsing and validation.
//!
//! Parses strata.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Name must be set, machines must have an address
//! - Every step is `task` + `commands` or `package` + `recipe`
//! - Recipe references must exist and must not form a cycle
//! - `render_rounds` and `event_queue` must be at least 1
//! - `settings.env` keys must be shell variable names

use super::recipe::Step;
use super::types::StrataConfig;
use indexmap::IndexMap;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use thiserror::Error;

/// One structural problem in a config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("YAML parse error: {0}")]
    Parse(String),

    #[error("{} validation error(s):\n  {}", .0.len(), join_issues(.0))]
    Invalid(Vec<ConfigIssue>),
}

fn join_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n  ")
}

/// Parse a strata.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<StrataConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    parse_config(&content)
}

/// Parse a strata.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<StrataConfig, ConfigError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Parse and validate; any issue is an error.
pub fn parse_and_validate(path: &Path) -> Result<StrataConfig, ConfigError> {
    let config = parse_config_file(path)?;
    let issues = validate_config(&config);
    if !issues.is_empty() {
        return Err(ConfigError::Invalid(issues));
    }
    Ok(config)
}

fn issue(message: String) -> ConfigIssue {
    ConfigIssue { message }
}

/// Validate a parsed config. Returns a list of issues (empty = valid).
pub fn validate_config(config: &StrataConfig) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();

    if config.version != "1.0" {
        issues.push(issue(format!(
            "version must be \"1.0\", got \"{}\"",
            config.version
        )));
    }

    if config.name.is_empty() {
        issues.push(issue("name must not be empty".to_string()));
    }

    for (id, machine) in &config.machines {
        if machine.addr.is_empty() {
            issues.push(issue(format!("machine '{id}' has no addr")));
        }
    }

    if config.settings.render_rounds < 1 {
        issues.push(issue("settings.render_rounds must be at least 1".to_string()));
    }
    if config.settings.event_queue < 1 {
        issues.push(issue("settings.event_queue must be at least 1".to_string()));
    }
    if config.settings.cache_root.is_empty() || !config.settings.cache_root.starts_with('/') {
        issues.push(issue(format!(
            "settings.cache_root must be an absolute path, got \"{}\"",
            config.settings.cache_root
        )));
    }

    for key in config.settings.env.keys() {
        if !is_env_name(key) {
            issues.push(issue(format!("settings.env key '{key}' is not a valid variable name")));
        }
    }

    check_steps("provision", &config.provision, config, &mut issues);
    for (name, recipe) in &config.recipes {
        check_steps(&format!("recipe '{name}'"), &recipe.steps, config, &mut issues);
        for (field, decl) in &recipe.fields {
            if decl.required && decl.default.is_some() {
                issues.push(issue(format!(
                    "recipe '{name}' field '{field}' is required but has a default"
                )));
            }
        }
    }

    if let Err(message) = recipe_order(&config.recipes) {
        issues.push(issue(message));
    }

    issues
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_steps(
    owner: &str,
    steps: &[Step],
    config: &StrataConfig,
    issues: &mut Vec<ConfigIssue>,
) {
    for (i, step) in steps.iter().enumerate() {
        let is_task = step.task.is_some()
            && step.commands.is_some()
            && step.package.is_none()
            && step.recipe.is_none()
            && step.with.is_empty();
        let is_package = step.package.is_some()
            && step.recipe.is_some()
            && step.task.is_none()
            && step.commands.is_none();
        if !is_task && !is_package {
            issues.push(issue(format!(
                "{owner} step {i} ('{}') needs either task + commands or package + recipe",
                step.name()
            )));
        }
        if let Some(ref recipe) = step.recipe {
            if !config.recipes.contains_key(recipe) {
                issues.push(issue(format!(
                    "{owner} step {i} references unknown recipe '{recipe}'"
                )));
            }
        }
    }
}

/// Order recipes so every recipe comes after the recipes it instantiates
/// (Kahn's algorithm, sorted tie-breaking). Fails on a reference cycle.
pub fn recipe_order(
    recipes: &IndexMap<String, super::recipe::RecipeDecl>,
) -> Result<Vec<String>, String> {
    let mut in_degree: HashMap<&str, usize> = recipes.keys().map(|k| (k.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (name, recipe) in recipes {
        for step in &recipe.steps {
            let Some(ref used) = step.recipe else {
                continue;
            };
            if !recipes.contains_key(used) {
                continue;
            }
            dependents.entry(used.as_str()).or_default().push(name.as_str());
            *in_degree.entry(name.as_str()).or_default() += 1;
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(name, _)| *name)
        .collect();
    ready.sort_unstable();
    let mut queue: VecDeque<&str> = ready.into_iter().collect();

    let mut order = Vec::new();
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());
        let mut next_ready = Vec::new();
        for dependent in dependents.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    next_ready.push(*dependent);
                }
            }
        }
        next_ready.sort_unstable();
        queue.extend(next_ready);
    }

    if order.len() != recipes.len() {
        let mut members: Vec<&str> = recipes
            .keys()
            .map(String::as_str)
            .filter(|name| !order.iter().any(|o| o == name))
            .collect();
        members.sort_unstable();
        return Err(format!(
            "recipe cycle detected involving: {}",
            members.join(", ")
        ));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_st031_parse_valid() {
        let yaml = r#"
version: "1.0"
name: test
machines:
  m1:
    hostname: box
    addr: 127.0.0.1
recipes:
  base:
    steps:
      - task: update
        commands: ["apt-get update"]
provision:
  - package: base
    recipe: base
"#;
        let config = parse_config(yaml).unwrap();
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn test_st031_bad_version_and_name() {
        let yaml = r#"
version: "2.0"
name: ""
"#;
        let config = parse_config(yaml).unwrap();
        let issues = validate_config(&config);
        assert_eq!(issues.len(), 2);
        assert!(issues[0].message.contains("version"));
        assert!(issues[1].message.contains("name"));
    }

    #[test]
    fn test_st031_unknown_recipe_and_bad_step() {
        let yaml = r#"
version: "1.0"
name: test
provision:
  - package: db
    recipe: postgres
  - task: odd
    recipe: postgres
"#;
        let config = parse_config(yaml).unwrap();
        let issues = validate_config(&config);
        let text: Vec<_> = issues.iter().map(|i| i.message.as_str()).collect();
        assert!(text.iter().any(|m| m.contains("unknown recipe 'postgres'")));
        assert!(text.iter().any(|m| m.contains("'odd'") && m.contains("needs either")));
    }

    #[test]
    fn test_st031_settings_bounds() {
        let yaml = r#"
version: "1.0"
name: test
settings:
  render_rounds: 0
  event_queue: 0
  cache_root: relative/dir
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(validate_config(&config).len(), 3);
    }

    #[test]
    fn test_st031_env_keys() {
        let yaml = r#"
version: "1.0"
name: test
settings:
  env:
    LANG: C.UTF-8
    _PRIVATE: "1"
    "BAD KEY": x
    9LIVES: y
"#;
        let config = parse_config(yaml).unwrap();
        let issues = validate_config(&config);
        assert_eq!(issues.len(), 2);
        assert!(issues[0].message.contains("'BAD KEY'"));
        assert!(issues[1].message.contains("'9LIVES'"));
    }

    #[test]
    fn test_st031_unknown_step_key_rejected() {
        let yaml = r#"
version: "1.0"
name: test
provision:
  - task: a
    commands: ["true"]
    depends_on: [b]
"#;
        assert!(matches!(parse_config(yaml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_st031_recipe_order() {
        let yaml = r#"
version: "1.0"
name: test
recipes:
  web:
    steps:
      - package: base
        recipe: base
  base:
    steps: []
  app:
    steps:
      - package: web
        recipe: web
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(
            recipe_order(&config.recipes).unwrap(),
            ["base", "web", "app"]
        );
    }

    #[test]
    fn test_st031_recipe_cycle() {
        let yaml = r#"
version: "1.0"
name: test
recipes:
  a:
    steps:
      - package: x
        recipe: b
  b:
    steps:
      - package: y
        recipe: a
  c:
    steps: []
"#;
        let config = parse_config(yaml).unwrap();
        let err = recipe_order(&config.recipes).unwrap_err();
        assert_eq!(err, "recipe cycle detected involving: a, b");
        assert!(validate_config(&config)
            .iter()
            .any(|i| i.message.contains("cycle")));
    }

    #[test]
    fn test_st031_parse_file_missing() {
        let err = parse_config_file(Path::new("/nonexistent/strata.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_st031_parse_and_validate_reports_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.yaml");
        std::fs::write(&path, "version: \"0.9\"\nname: \"\"\n").unwrap();
        let err = parse_and_validate(&path).unwrap_err();
        assert!(err.to_string().starts_with("2 validation error(s)"));
    }
}
