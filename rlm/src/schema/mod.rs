//! JSON Schema model for structured extraction
//!
//! The keywords structured completion reasons about (types, properties,
//! items, enum, nullable and the common constraints) are modelled as fields;
//! anything else is carried through untouched in `extra`, so validation sees
//! the whole document.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::debug;

mod decompose;
mod describe;
mod validate;

pub use decompose::{DecomposedTask, SchemaDecomposition, TaskKind, decompose, is_simple};
pub use describe::{build_example, describe_constraints, field_query};
pub use validate::{IssueKind, ValidationIssue, check_schema, validate, value_summary};

/// JSON Schema primitive types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Null,
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Integer => "integer",
            SchemaType::Boolean => "boolean",
            SchemaType::Array => "array",
            SchemaType::Object => "object",
            SchemaType::Null => "null",
        };
        f.write_str(name)
    }
}

/// `type`: one type name or a list of them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeDecl {
    One(SchemaType),
    Many(Vec<SchemaType>),
}

impl TypeDecl {
    fn contains(&self, t: SchemaType) -> bool {
        match self {
            TypeDecl::One(one) => *one == t,
            TypeDecl::Many(many) => many.contains(&t),
        }
    }
}

/// `additionalProperties`: either a flag or a schema for extra keys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdditionalProperties {
    Allowed(bool),
    Schema(Box<JsonSchema>),
}

/// A JSON Schema document or fragment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonSchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_decl: Option<TypeDecl>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, JsonSchema>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<JsonSchema>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub nullable: bool,

    // Number constraints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiple_of: Option<f64>,

    // String constraints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    // Array constraints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique_items: bool,

    // Object constraints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<AdditionalProperties>,

    // Union/intersection
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any_of: Vec<JsonSchema>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all_of: Vec<JsonSchema>,

    /// Keywords not modelled above (`const`, `oneOf`, `exclusiveMinimum`, ...)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl JsonSchema {
    /// Shorthand for a schema of one type with no constraints
    pub fn of(schema_type: SchemaType) -> Self {
        Self {
            type_decl: Some(TypeDecl::One(schema_type)),
            ..Self::default()
        }
    }

    /// Object schema with the given properties, all required
    pub fn object<I, K>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, JsonSchema)>,
        K: Into<String>,
    {
        let properties: IndexMap<String, JsonSchema> = properties.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self {
            type_decl: Some(TypeDecl::One(SchemaType::Object)),
            required: properties.keys().cloned().collect(),
            properties,
            ..Self::default()
        }
    }

    /// Array schema with the given item schema
    pub fn array(items: JsonSchema) -> Self {
        Self {
            type_decl: Some(TypeDecl::One(SchemaType::Array)),
            items: Some(Box::new(items)),
            ..Self::default()
        }
    }

    /// The declared type, ignoring `null` in a type list
    pub fn schema_type(&self) -> Option<SchemaType> {
        match self.type_decl.as_ref()? {
            TypeDecl::One(t) => Some(*t),
            TypeDecl::Many(types) => types
                .iter()
                .copied()
                .find(|t| *t != SchemaType::Null)
                .or_else(|| types.first().copied()),
        }
    }

    /// `nullable: true`, or `null` among the declared types
    pub fn allows_null(&self) -> bool {
        self.nullable || self.type_decl.as_ref().is_some_and(|d| d.contains(SchemaType::Null))
    }

    /// Treats a schema with properties but no type as an object
    pub fn is_object(&self) -> bool {
        self.schema_type() == Some(SchemaType::Object) || (self.type_decl.is_none() && !self.properties.is_empty())
    }

    pub fn is_array(&self) -> bool {
        self.schema_type() == Some(SchemaType::Array)
    }

    /// Array whose items are objects
    pub fn is_array_of_objects(&self) -> bool {
        self.is_array() && self.items.as_deref().is_some_and(JsonSchema::is_object)
    }

    /// Object, or array of objects
    pub fn is_branch(&self) -> bool {
        self.is_object() || self.is_array_of_objects()
    }

    pub fn is_required(&self, field: &str) -> bool {
        self.required.iter().any(|r| r == field)
    }

    /// Human-readable type name, e.g. "array of object" or "string or null"
    pub fn type_name(&self) -> String {
        if let Some(TypeDecl::Many(types)) = &self.type_decl
            && types.len() > 1
        {
            let names: Vec<String> = types
                .iter()
                .map(|t| match t {
                    SchemaType::Array => self.array_name(),
                    other => other.to_string(),
                })
                .collect();
            return names.join(" or ");
        }
        match self.schema_type() {
            Some(SchemaType::Array) => self.array_name(),
            Some(t) => t.to_string(),
            None if self.is_object() => "object".to_string(),
            None if !self.any_of.is_empty() => "any of several schemas".to_string(),
            None => "any".to_string(),
        }
    }

    fn array_name(&self) -> String {
        match &self.items {
            Some(items) => format!("array of {}", items.type_name()),
            None => "array".to_string(),
        }
    }

    /// Standard JSON Schema document for this fragment
    ///
    /// `nullable: true` is not a JSON Schema keyword; it is folded into the
    /// type list (and the enum, when one is declared).
    pub fn to_document(&self) -> Value {
        let mut document = serde_json::to_value(self).unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
        fold_nullable(&mut document);
        document
    }

    /// Pretty JSON rendering of this schema for prompts
    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Flatten the schema tree into nodes, parents before children
    pub fn nodes(&self) -> Vec<SchemaNode<'_>> {
        debug!("JsonSchema::nodes: called");
        let mut out = Vec::new();
        collect_nodes(self, String::new(), true, &mut out);
        out
    }

    /// Declared constraints of this fragment, not of its children
    pub fn constraints(&self) -> Vec<Constraint> {
        let mut out = Vec::new();
        if let Some(v) = self.minimum {
            out.push(Constraint::Minimum(v));
        }
        if let Some(v) = self.maximum {
            out.push(Constraint::Maximum(v));
        }
        if let Some(v) = self.multiple_of {
            out.push(Constraint::MultipleOf(v));
        }
        if let Some(v) = self.min_length {
            out.push(Constraint::MinLength(v));
        }
        if let Some(v) = self.max_length {
            out.push(Constraint::MaxLength(v));
        }
        if let Some(p) = &self.pattern {
            out.push(Constraint::Pattern(p.clone()));
        }
        if let Some(f) = &self.format {
            out.push(Constraint::Format(f.clone()));
        }
        if let Some(v) = self.min_items {
            out.push(Constraint::MinItems(v));
        }
        if let Some(v) = self.max_items {
            out.push(Constraint::MaxItems(v));
        }
        if self.unique_items {
            out.push(Constraint::UniqueItems);
        }
        match &self.additional_properties {
            Some(AdditionalProperties::Allowed(false)) => out.push(Constraint::NoAdditionalProperties),
            Some(AdditionalProperties::Schema(s)) => out.push(Constraint::AdditionalPropertiesSchema(s.type_name())),
            _ => {}
        }
        if !self.enum_values.is_empty() {
            out.push(Constraint::Enum(self.enum_values.clone()));
        }
        if !self.any_of.is_empty() {
            out.push(Constraint::AnyOf(self.any_of.iter().map(JsonSchema::type_name).collect()));
        }
        if !self.all_of.is_empty() {
            out.push(Constraint::AllOf(self.all_of.len()));
        }
        out
    }
}

/// Keywords whose value is a map of subschemas
const SCHEMA_MAPS: &[&str] = &["properties", "patternProperties", "$defs", "definitions"];
/// Keywords whose value is a single subschema
const SCHEMA_SINGLES: &[&str] = &["items", "additionalProperties", "not", "contains", "if", "then", "else"];
/// Keywords whose value is a list of subschemas
const SCHEMA_LISTS: &[&str] = &["anyOf", "allOf", "oneOf", "prefixItems"];

fn fold_nullable(document: &mut Value) {
    let Value::Object(map) = document else { return };
    for key in SCHEMA_MAPS {
        if let Some(Value::Object(children)) = map.get_mut(*key) {
            children.values_mut().for_each(fold_nullable);
        }
    }
    for key in SCHEMA_SINGLES {
        if let Some(child) = map.get_mut(*key) {
            fold_nullable(child);
        }
    }
    for key in SCHEMA_LISTS {
        if let Some(Value::Array(children)) = map.get_mut(*key) {
            children.iter_mut().for_each(fold_nullable);
        }
    }

    if map.remove("nullable") != Some(Value::Bool(true)) {
        return;
    }
    let null = Value::String("null".to_string());
    match map.get_mut("type") {
        Some(Value::Array(types)) if !types.contains(&null) => types.push(null),
        Some(single @ Value::String(_)) if *single != null => *single = Value::Array(vec![single.clone(), null]),
        _ => {}
    }
    if let Some(Value::Array(options)) = map.get_mut("enum")
        && !options.contains(&Value::Null)
    {
        options.push(Value::Null);
    }
}

fn collect_nodes<'a>(schema: &'a JsonSchema, path: String, required: bool, out: &mut Vec<SchemaNode<'a>>) {
    out.push(SchemaNode {
        path: path.clone(),
        schema,
        required,
        constraints: schema.constraints(),
    });
    for (name, child) in &schema.properties {
        collect_nodes(child, join_path(&path, name), schema.is_required(name), out);
    }
    if let Some(items) = &schema.items {
        collect_nodes(items, format!("{path}[]"), true, out);
    }
}

/// Join a parent path and a field name with `.`
///
/// Names that would read as path syntax are bracketed and quoted instead,
/// so `user.info` as a single key renders as `["user.info"]`.
pub fn join_path(parent: &str, field: &str) -> String {
    let plain = !field.is_empty() && !field.contains(['.', '[', ']', '"']);
    match (parent.is_empty(), plain) {
        (true, true) => field.to_string(),
        (false, true) => format!("{parent}.{field}"),
        (_, false) => format!("{parent}[{}]", serde_json::Value::from(field)),
    }
}

/// Display path for a sequence of property names
pub fn path_of<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .fold(String::new(), |path, segment| join_path(&path, segment.as_ref()))
}

/// One position in the schema tree
#[derive(Debug, Clone)]
pub struct SchemaNode<'a> {
    /// Dotted path from the root, e.g. `address.city` or `phrases[]`
    pub path: String,
    pub schema: &'a JsonSchema,
    /// Whether the enclosing object lists this field as required
    pub required: bool,
    pub constraints: Vec<Constraint>,
}

/// A declared constraint on a schema fragment
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Minimum(f64),
    Maximum(f64),
    MultipleOf(f64),
    MinLength(usize),
    MaxLength(usize),
    Pattern(String),
    Format(String),
    MinItems(usize),
    MaxItems(usize),
    UniqueItems,
    NoAdditionalProperties,
    AdditionalPropertiesSchema(String),
    Enum(Vec<Value>),
    AnyOf(Vec<String>),
    AllOf(usize),
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Minimum(v) => write!(f, "at least {}", format_number(*v)),
            Constraint::Maximum(v) => write!(f, "at most {}", format_number(*v)),
            Constraint::MultipleOf(v) => write!(f, "a multiple of {}", format_number(*v)),
            Constraint::MinLength(n) => write!(f, "at least {n} characters long"),
            Constraint::MaxLength(n) => write!(f, "at most {n} characters long"),
            Constraint::Pattern(p) => write!(f, "matching the pattern /{p}/"),
            Constraint::Format(fmt_name) => write!(f, "a valid {fmt_name}"),
            Constraint::MinItems(n) => write!(f, "containing at least {n} item(s)"),
            Constraint::MaxItems(n) => write!(f, "containing at most {n} item(s)"),
            Constraint::UniqueItems => f.write_str("containing only unique items"),
            Constraint::NoAdditionalProperties => f.write_str("with no properties beyond those listed"),
            Constraint::AdditionalPropertiesSchema(t) => write!(f, "with any extra properties of type {t}"),
            Constraint::Enum(values) => write!(f, "one of {}", format_enum(values)),
            Constraint::AnyOf(types) => write!(f, "matching at least one of: {}", types.join(", ")),
            Constraint::AllOf(n) => write!(f, "satisfying all {n} combined schemas"),
        }
    }
}

/// Render integers without a trailing `.0`
pub(crate) fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

pub(crate) fn format_enum(values: &[Value]) -> String {
    values.iter().map(Value::to_string).collect::<Vec<_>>().join(", ")
}
