//! ST-019: YAML recipes as package builders.
//!
//! A recipe declares typed fields and a list of steps. Each step either adds
//! a task of commands or instantiates another recipe as a child package,
//! passing field values through `with`. String values in `with` are rendered
//! against the parent before being assigned, then the child is validated like
//! any other builder.

use super::command::Command;
use super::compiler::{CompiledTask, Compiler, Package, PackageBuilder, Task, Unit};
use super::error::{CompileError, ValidationError};
use super::schema::{FieldKind, FieldSpec, Fields, Params, Schema, Value};
use super::types::{yaml_value_to_string, StrataConfig};
use crate::commands::{AsUser, InstallPackages, Mkdir, ShellCommand, UpdatePackages, WriteFile};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Field type in a recipe declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Bool,
    Bytes,
}

impl From<FieldType> for FieldKind {
    fn from(t: FieldType) -> Self {
        match t {
            FieldType::String => FieldKind::String,
            FieldType::Int => FieldKind::Int,
            FieldType::Bool => FieldKind::Bool,
            FieldType::Bytes => FieldKind::Bytes,
        }
    }
}

/// A recipe field declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDecl {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<serde_yaml_ng::Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
    #[serde(default)]
    pub size: Option<usize>,
}

/// A reusable package.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipeDecl {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: IndexMap<String, FieldDecl>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One step: `task` + `commands`, or `package` + `recipe` (+ `with`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub commands: Option<Vec<CommandDecl>>,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub recipe: Option<String>,
    #[serde(default)]
    pub with: IndexMap<String, serde_yaml_ng::Value>,
}

impl Step {
    pub fn name(&self) -> &str {
        self.task
            .as_deref()
            .or(self.package.as_deref())
            .unwrap_or("<unnamed>")
    }
}

/// A command entry: a structured operation or a shell template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandDecl {
    Op(OpDecl),
    Shell(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpDecl {
    WriteFile {
        path: String,
        content: String,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        owner: Option<String>,
    },
    Mkdir {
        path: String,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        owner: Option<String>,
    },
    InstallPackages(Vec<String>),
    UpdatePackages,
    AsUser {
        user: String,
        run: String,
    },
}

impl CommandDecl {
    pub fn to_command(&self) -> Box<dyn Command> {
        match self {
            Self::Shell(text) => Box::new(ShellCommand::new(text.as_str())),
            Self::Op(OpDecl::WriteFile {
                path,
                content,
                mode,
                owner,
            }) => Box::new(WriteFile {
                path: path.clone(),
                content: content.clone(),
                mode: mode.clone(),
                owner: owner.clone(),
            }),
            Self::Op(OpDecl::Mkdir { path, mode, owner }) => Box::new(Mkdir {
                path: path.clone(),
                mode: mode.clone(),
                owner: owner.clone(),
            }),
            Self::Op(OpDecl::InstallPackages(packages)) => {
                Box::new(InstallPackages::new(packages.iter().cloned()))
            }
            Self::Op(OpDecl::UpdatePackages) => Box::new(UpdatePackages),
            Self::Op(OpDecl::AsUser { user, run }) => Box::new(AsUser::new(user.as_str(), run.as_str())),
        }
    }
}

type Library = Arc<IndexMap<String, RecipeDecl>>;

/// A recipe instance: its fields plus the steps that populate its package.
pub struct RecipeBuilder {
    params: Params,
    steps: Vec<Step>,
    library: Library,
    /// Recipes being expanded above this one, outermost first
    ancestry: Vec<String>,
}

impl RecipeBuilder {
    fn instantiate(
        name: &str,
        library: &Library,
        ancestry: &[String],
    ) -> Result<Self, CompileError> {
        let decl = library
            .get(name)
            .ok_or_else(|| CompileError::UnsupportedUnit {
                name: name.to_string(),
                detail: format!("unknown recipe '{name}'"),
            })?;
        if ancestry.iter().any(|a| a == name) {
            return Err(CompileError::UnsupportedUnit {
                name: name.to_string(),
                detail: format!("recipe cycle: {} -> {name}", ancestry.join(" -> ")),
            });
        }

        let mut schema = Schema::builder();
        for (field, fd) in &decl.fields {
            let kind = FieldKind::from(fd.field_type);
            let mut spec = FieldSpec::new(field, kind);
            spec.required = fd.required;
            spec.min = fd.min;
            spec.max = fd.max;
            spec.size = fd.size;
            if let Some(ref default) = fd.default {
                spec.default = Some(yaml_to_value(field, kind, default).map_err(|source| {
                    CompileError::Validation {
                        name: name.to_string(),
                        source,
                    }
                })?);
            }
            schema = schema.field(spec);
        }

        let mut ancestry = ancestry.to_vec();
        ancestry.push(name.to_string());
        Ok(Self {
            params: Params::new(schema.build()),
            steps: decl.steps.clone(),
            library: Arc::clone(library),
            ancestry,
        })
    }

    /// The root package of a config: `params` (kinds inferred) and
    /// `provision` steps.
    pub fn root(config: &StrataConfig) -> Result<Self, CompileError> {
        let mut values = IndexMap::new();
        for (field, yaml) in &config.params {
            let value = infer_value(field, yaml).map_err(|source| CompileError::Validation {
                name: "params".to_string(),
                source,
            })?;
            values.insert(field.clone(), value);
        }
        Ok(Self {
            params: Params::inferred(values),
            steps: config.provision.clone(),
            library: Arc::new(config.recipes.clone()),
            ancestry: Vec::new(),
        })
    }

    fn add_step(&self, package: &mut Package<'_>, step: &Step) -> Result<(), CompileError> {
        match step {
            Step {
                task: Some(name),
                commands: Some(commands),
                package: None,
                recipe: None,
                with,
            } if with.is_empty() => {
                let mut task = Task::new();
                for decl in commands {
                    task.push(decl.to_command());
                }
                package.add(name, task)
            }
            Step {
                task: None,
                commands: None,
                package: Some(name),
                recipe: Some(recipe),
                with,
            } => {
                let mut child = Self::instantiate(recipe, &self.library, &self.ancestry)?;
                for (field, yaml) in with {
                    let kind = child
                        .params
                        .schema()
                        .get(field)
                        .map(|spec| spec.kind)
                        .ok_or_else(|| CompileError::Validation {
                            name: name.clone(),
                            source: ValidationError::UnknownField {
                                field: field.clone(),
                            },
                        })?;
                    let yaml = match yaml {
                        serde_yaml_ng::Value::String(s) => {
                            serde_yaml_ng::Value::String(package.render(s)?)
                        }
                        other => other.clone(),
                    };
                    yaml_to_value(field, kind, &yaml)
                        .and_then(|value| child.set_field(field, value))
                        .map_err(|source| CompileError::Validation {
                            name: name.clone(),
                            source,
                        })?;
                }
                package.add(name, Unit::package(child))
            }
            other => Err(CompileError::UnsupportedUnit {
                name: other.name().to_string(),
                detail: "a step needs either `task` + `commands` or `package` + `recipe` (+ `with`)"
                    .to_string(),
            }),
        }
    }
}

impl Fields for RecipeBuilder {
    fn schema(&self) -> &Schema {
        self.params.schema()
    }

    fn field(&self, name: &str) -> Option<Value> {
        self.params.field(name)
    }

    fn set_field(&mut self, name: &str, value: Value) -> Result<(), ValidationError> {
        self.params.set_field(name, value)
    }
}

impl PackageBuilder for RecipeBuilder {
    fn build(&self, package: &mut Package<'_>) -> Result<(), CompileError> {
        for step in &self.steps {
            self.add_step(package, step)?;
        }
        Ok(())
    }
}

/// Compile a parsed config into its task list.
pub fn compile_config(
    config: &StrataConfig,
    compiler: &Compiler<'_>,
) -> Result<Vec<CompiledTask>, CompileError> {
    let mut root = RecipeBuilder::root(config)?;
    compiler.compile(&mut root)
}

fn kind_name(yaml: &serde_yaml_ng::Value) -> &'static str {
    match yaml {
        serde_yaml_ng::Value::Null => "null",
        serde_yaml_ng::Value::Bool(_) => "bool",
        serde_yaml_ng::Value::Number(_) => "number",
        serde_yaml_ng::Value::String(_) => "string",
        serde_yaml_ng::Value::Sequence(_) => "sequence",
        serde_yaml_ng::Value::Mapping(_) => "mapping",
        serde_yaml_ng::Value::Tagged(_) => "tagged value",
    }
}

/// Convert a YAML value to a field value of the given kind. Strings convert
/// to ints and bools when they parse, so rendered templates can feed typed
/// fields.
fn yaml_to_value(
    field: &str,
    kind: FieldKind,
    yaml: &serde_yaml_ng::Value,
) -> Result<Value, ValidationError> {
    use serde_yaml_ng::Value as Y;
    let mismatch = || ValidationError::Kind {
        field: field.to_string(),
        expected: kind.to_string(),
        actual: kind_name(yaml).to_string(),
    };
    match (kind, yaml) {
        (FieldKind::String, Y::String(_) | Y::Number(_) | Y::Bool(_) | Y::Null) => {
            Ok(Value::String(yaml_value_to_string(yaml)))
        }
        (FieldKind::Int, Y::Number(n)) => n.as_i64().map(Value::Int).ok_or_else(mismatch),
        (FieldKind::Int, Y::String(s)) => s.trim().parse().map(Value::Int).map_err(|_| mismatch()),
        (FieldKind::Bool, Y::Bool(b)) => Ok(Value::Bool(*b)),
        (FieldKind::Bool, Y::String(s)) => match s.trim() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(mismatch()),
        },
        (FieldKind::Bytes, Y::String(s)) => Ok(Value::Bytes(s.clone().into_bytes())),
        _ => Err(mismatch()),
    }
}

/// Infer a root param's kind from its YAML value.
fn infer_value(field: &str, yaml: &serde_yaml_ng::Value) -> Result<Value, ValidationError> {
    use serde_yaml_ng::Value as Y;
    match yaml {
        Y::Bool(b) => Ok(Value::Bool(*b)),
        Y::Number(n) => Ok(n
            .as_i64()
            .map(Value::Int)
            .unwrap_or_else(|| Value::String(n.to_string()))),
        Y::String(_) | Y::Null => Ok(Value::String(yaml_value_to_string(yaml))),
        other => Err(ValidationError::Kind {
            field: field.to_string(),
            expected: "string, int or bool".to_string(),
            actual: kind_name(other).to_string(),
        }),
    }
}
