//! ST-002: Field schemas and the configuration validator.
//!
//! Every builder exposes its fields through [`Fields`] together with an
//! explicit [`Schema`]. The compiler never inspects builder types; it asks a
//! [`ConfigValidator`] to apply defaults and enforce constraints, and renders
//! templates by looking fields up by name.
//!
//! A field is *unset* when it holds its kind's zero value (empty string, 0,
//! false, empty bytes). Defaults apply to unset fields only.

use super::error::ValidationError;
use indexmap::IndexMap;
use std::fmt;

/// Kind of a builder field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Int,
    Bool,
    Bytes,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Int => write!(f, "int"),
            Self::Bool => write!(f, "bool"),
            Self::Bytes => write!(f, "bytes"),
        }
    }
}

/// A field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::String(_) => FieldKind::String,
            Self::Int(_) => FieldKind::Int,
            Self::Bool(_) => FieldKind::Bool,
            Self::Bytes(_) => FieldKind::Bytes,
        }
    }

    /// The zero value of a kind.
    pub fn zero(kind: FieldKind) -> Self {
        match kind {
            FieldKind::String => Self::String(String::new()),
            FieldKind::Int => Self::Int(0),
            FieldKind::Bool => Self::Bool(false),
            FieldKind::Bytes => Self::Bytes(Vec::new()),
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Self::String(s) => s.is_empty(),
            Self::Int(n) => *n == 0,
            Self::Bool(b) => !b,
            Self::Bytes(b) => b.is_empty(),
        }
    }

    /// Text used when the value is substituted into a template.
    pub fn render(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Int(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

/// Declared constraints of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub default: Option<Value>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub size: Option<usize>,
}

impl FieldSpec {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
            default: None,
            min: None,
            max: None,
            size: None,
        }
    }

    pub fn string(name: &str) -> Self {
        Self::new(name, FieldKind::String)
    }

    pub fn int(name: &str) -> Self {
        Self::new(name, FieldKind::Int)
    }

    pub fn bool(name: &str) -> Self {
        Self::new(name, FieldKind::Bool)
    }

    pub fn bytes(name: &str) -> Self {
        Self::new(name, FieldKind::Bytes)
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    #[must_use]
    pub fn min(mut self, min: i64) -> Self {
        self.min = Some(min);
        self
    }

    #[must_use]
    pub fn max(mut self, max: i64) -> Self {
        self.max = Some(max);
        self
    }

    #[must_use]
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }
}

/// Ordered set of field declarations for one builder type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    fields: IndexMap<String, FieldSpec>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.values()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    fields: IndexMap<String, FieldSpec>,
}

impl SchemaBuilder {
    #[must_use]
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.insert(spec.name.clone(), spec);
        self
    }

    pub fn build(self) -> Schema {
        Schema {
            fields: self.fields,
        }
    }
}

/// Named-field access to a builder. Doubles as the template reference.
pub trait Fields {
    fn schema(&self) -> &Schema;

    /// Current value of a field, `None` if the field does not exist.
    fn field(&self, name: &str) -> Option<Value>;

    fn set_field(&mut self, name: &str, value: Value) -> Result<(), ValidationError>;
}

/// Applies defaults and enforces constraints on a builder before it runs.
pub trait ConfigValidator: Send + Sync {
    fn validate(&self, target: &mut dyn Fields) -> Result<(), ValidationError>;
}

/// Validator driven by the builder's declared [`Schema`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl ConfigValidator for SchemaValidator {
    fn validate(&self, target: &mut dyn Fields) -> Result<(), ValidationError> {
        let specs: Vec<FieldSpec> = target.schema().fields().cloned().collect();
        for spec in &specs {
            let mut value = target
                .field(&spec.name)
                .unwrap_or_else(|| Value::zero(spec.kind));
            check_kind(spec, &value)?;

            if value.is_zero() {
                if let Some(ref default) = spec.default {
                    check_kind(spec, default)?;
                    target.set_field(&spec.name, default.clone())?;
                    value = default.clone();
                }
            }

            check_constraints(spec, &value)?;
        }
        Ok(())
    }
}

fn check_kind(spec: &FieldSpec, value: &Value) -> Result<(), ValidationError> {
    if value.kind() != spec.kind {
        return Err(ValidationError::Kind {
            field: spec.name.clone(),
            expected: spec.kind.to_string(),
            actual: value.kind().to_string(),
        });
    }
    Ok(())
}

fn unsupported(spec: &FieldSpec, constraint: &str) -> ValidationError {
    ValidationError::Unsupported {
        field: spec.name.clone(),
        kind: spec.kind.to_string(),
        constraint: constraint.to_string(),
    }
}

fn check_constraints(spec: &FieldSpec, value: &Value) -> Result<(), ValidationError> {
    if spec.required && value.is_zero() {
        if spec.kind == FieldKind::Bool {
            return Err(unsupported(spec, "required"));
        }
        return Err(ValidationError::Required {
            field: spec.name.clone(),
        });
    }

    // Strings and bytes are bounded by length, ints by value.
    let measured = match value {
        Value::String(s) => s.chars().count() as i64,
        Value::Bytes(b) => b.len() as i64,
        Value::Int(n) => *n,
        Value::Bool(_) => {
            if spec.min.is_some() {
                return Err(unsupported(spec, "min"));
            }
            if spec.max.is_some() {
                return Err(unsupported(spec, "max"));
            }
            if spec.size.is_some() {
                return Err(unsupported(spec, "size"));
            }
            return Ok(());
        }
    };

    // Unset optional fields are exempt from bounds.
    if value.is_zero() && !spec.required {
        return Ok(());
    }

    if let Some(min) = spec.min {
        if measured < min {
            return Err(ValidationError::Min {
                field: spec.name.clone(),
                min,
                actual: measured,
            });
        }
    }
    if let Some(max) = spec.max {
        if measured > max {
            return Err(ValidationError::Max {
                field: spec.name.clone(),
                max,
                actual: measured,
            });
        }
    }
    if let Some(size) = spec.size {
        if spec.kind == FieldKind::Int {
            return Err(unsupported(spec, "size"));
        }
        let actual = measured as usize;
        if actual != size {
            return Err(ValidationError::Size {
                field: spec.name.clone(),
                size,
                actual,
            });
        }
    }
    Ok(())
}

/// A schema plus values in one struct, for builders that keep their fields
/// dynamically (YAML recipes, the config's root params).
#[derive(Debug, Clone, Default)]
pub struct Params {
    schema: Schema,
    values: IndexMap<String, Value>,
}

impl Params {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            values: IndexMap::new(),
        }
    }

    /// Derive a schema from the kinds of the given values (no constraints).
    pub fn inferred(values: IndexMap<String, Value>) -> Self {
        let mut builder = Schema::builder();
        for (name, value) in &values {
            builder = builder.field(FieldSpec::new(name, value.kind()));
        }
        Self {
            schema: builder.build(),
            values,
        }
    }

    pub fn values(&self) -> &IndexMap<String, Value> {
        &self.values
    }
}

impl Fields for Params {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn field(&self, name: &str) -> Option<Value> {
        let spec = self.schema.get(name)?;
        Some(
            self.values
                .get(name)
                .cloned()
                .unwrap_or_else(|| Value::zero(spec.kind)),
        )
    }

    fn set_field(&mut self, name: &str, value: Value) -> Result<(), ValidationError> {
        let spec = self
            .schema
            .get(name)
            .ok_or_else(|| ValidationError::UnknownField {
                field: name.to_string(),
            })?;
        check_kind(spec, &value)?;
        self.values.insert(name.to_string(), value);
        Ok(())
    }
}
