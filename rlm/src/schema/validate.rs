//! Schema validation with field-level diagnostics
//!
//! Validation itself is done by `jsonschema`; each of its errors is turned
//! into a [`ValidationIssue`] naming the field path, the expected constraint
//! and what was actually received, so that retries can tell the model exactly
//! what to fix.

use jsonschema::{ValidationError, Validator};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

use super::{AdditionalProperties, Constraint, JsonSchema, format_enum, join_path};

/// Category of a validation problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Required field absent
    Missing,
    /// Value has the wrong JSON type
    TypeMismatch,
    /// Type is right but a declared constraint fails
    Constraint,
    /// Property not allowed by `additionalProperties: false`
    UnexpectedField,
    /// No parseable JSON in the model output
    NoJson,
}

/// One field-level validation failure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    /// Dotted path to the field (`""` for the root value)
    pub field_path: String,
    pub kind: IssueKind,
    /// Expected type or constraint, in words
    pub expected: String,
    /// What was actually received, in words
    pub actual: String,
}

impl ValidationIssue {
    pub fn new(
        field_path: impl Into<String>,
        kind: IssueKind,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self {
            field_path: field_path.into(),
            kind,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Extraction found nothing: every field of `schema` counts as missing
    pub fn no_json(schema: &JsonSchema) -> Self {
        Self::new(
            "",
            IssueKind::NoJson,
            format!("a JSON {}", schema.type_name()),
            "no parseable JSON value",
        )
    }

    /// Path shown to humans and models
    pub fn display_path(&self) -> &str {
        if self.field_path.is_empty() {
            "(root)"
        } else {
            &self.field_path
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            IssueKind::Missing => write!(f, "missing required field '{}' ({})", self.display_path(), self.expected),
            IssueKind::NoJson => write!(f, "no JSON found in response (expected {})", self.expected),
            IssueKind::UnexpectedField => write!(f, "unexpected field '{}'", self.display_path()),
            _ => write!(
                f,
                "field '{}': expected {}, received {}",
                self.display_path(),
                self.expected,
                self.actual
            ),
        }
    }
}

/// Compile `schema`; a schema the validator rejects (a bad regex, an unknown
/// draft) is reported with the validator's message
pub fn check_schema(schema: &JsonSchema) -> Result<(), String> {
    compile(&schema.to_document()).map(|_| ())
}

fn compile(document: &Value) -> Result<Validator, String> {
    jsonschema::options()
        .should_validate_formats(true)
        .build(document)
        .map_err(|e| e.to_string())
}

/// Validate `value` against `schema`, returning every issue found
pub fn validate(value: &Value, schema: &JsonSchema) -> Vec<ValidationIssue> {
    let document = schema.to_document();
    let validator = match compile(&document) {
        Ok(validator) => validator,
        Err(message) => {
            warn!(%message, "validate: schema does not compile");
            return vec![ValidationIssue::new(
                "",
                IssueKind::Constraint,
                format!("a value for a valid schema ({message})"),
                value_summary(value),
            )];
        }
    };

    let mut issues: Vec<ValidationIssue> = Vec::new();
    for error in validator.iter_errors(value) {
        for issue in describe_error(&error, value, &document) {
            if !issues.contains(&issue) {
                issues.push(issue);
            }
        }
    }
    debug!(issues = issues.len(), "validate: done");
    issues
}

/// Split a JSON pointer into unescaped tokens
fn pointer_tokens(pointer: &str) -> Vec<String> {
    pointer
        .split('/')
        .skip(1)
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect()
}

/// `/phrases/0/text` -> `phrases[0].text`, using `root` to tell indices from keys
fn field_path(pointer: &str, root: &Value) -> String {
    let mut path = String::new();
    let mut node = Some(root);
    for token in pointer_tokens(pointer) {
        match node {
            Some(Value::Array(items)) if token.parse::<usize>().is_ok() => {
                path.push_str(&format!("[{token}]"));
                node = token.parse::<usize>().ok().and_then(|i| items.get(i));
            }
            _ => {
                path = join_path(&path, &token);
                node = node.and_then(|n| n.get(&token));
            }
        }
    }
    path
}

fn describe_error(error: &ValidationError<'_>, root: &Value, document: &Value) -> Vec<ValidationIssue> {
    let path = field_path(&error.instance_path.to_string(), root);
    let instance: &Value = &error.instance;

    let schema_pointer = error.schema_path.to_string();
    let (parent, keyword) = schema_pointer.rsplit_once('/').unwrap_or(("", schema_pointer.as_str()));
    let fragment: Option<JsonSchema> = document
        .pointer(parent)
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    let Some(fragment) = fragment else {
        return vec![ValidationIssue::new(path, IssueKind::Constraint, error.to_string(), value_summary(instance))];
    };

    let constraint = |c: Constraint, actual: String| vec![ValidationIssue::new(&path, IssueKind::Constraint, c.to_string(), actual)];
    let char_count = || format!("{} characters", instance.as_str().map_or(0, |s| s.chars().count()));
    let item_count = || format!("{} item(s)", instance.as_array().map_or(0, Vec::len));

    match keyword {
        "required" => {
            let Value::Object(present) = instance else { return Vec::new() };
            fragment
                .required
                .iter()
                .filter(|field| !present.contains_key(*field))
                .map(|field| {
                    let expected = fragment
                        .properties
                        .get(field)
                        .map(JsonSchema::type_name)
                        .unwrap_or_else(|| "a value".to_string());
                    ValidationIssue::new(join_path(&path, field), IssueKind::Missing, expected, "missing")
                })
                .collect()
        }
        "type" => vec![ValidationIssue::new(
            &path,
            IssueKind::TypeMismatch,
            fragment.type_name(),
            value_summary(instance),
        )],
        "additionalProperties" if fragment.additional_properties == Some(AdditionalProperties::Allowed(false)) => {
            let Value::Object(present) = instance else { return Vec::new() };
            present
                .keys()
                .filter(|key| !fragment.properties.contains_key(*key))
                .map(|key| {
                    ValidationIssue::new(
                        join_path(&path, key),
                        IssueKind::UnexpectedField,
                        Constraint::NoAdditionalProperties.to_string(),
                        "extra field",
                    )
                })
                .collect()
        }
        "minimum" if fragment.minimum.is_some() => {
            constraint(Constraint::Minimum(fragment.minimum.unwrap_or_default()), value_summary(instance))
        }
        "maximum" if fragment.maximum.is_some() => {
            constraint(Constraint::Maximum(fragment.maximum.unwrap_or_default()), value_summary(instance))
        }
        "multipleOf" if fragment.multiple_of.is_some() => {
            constraint(Constraint::MultipleOf(fragment.multiple_of.unwrap_or_default()), value_summary(instance))
        }
        "minLength" if fragment.min_length.is_some() => {
            constraint(Constraint::MinLength(fragment.min_length.unwrap_or_default()), char_count())
        }
        "maxLength" if fragment.max_length.is_some() => {
            constraint(Constraint::MaxLength(fragment.max_length.unwrap_or_default()), char_count())
        }
        "minItems" if fragment.min_items.is_some() => {
            constraint(Constraint::MinItems(fragment.min_items.unwrap_or_default()), item_count())
        }
        "maxItems" if fragment.max_items.is_some() => {
            constraint(Constraint::MaxItems(fragment.max_items.unwrap_or_default()), item_count())
        }
        "pattern" if fragment.pattern.is_some() => constraint(
            Constraint::Pattern(fragment.pattern.clone().unwrap_or_default()),
            value_summary(instance),
        ),
        "format" if fragment.format.is_some() => constraint(
            Constraint::Format(fragment.format.clone().unwrap_or_default()),
            value_summary(instance),
        ),
        "uniqueItems" => {
            let items = instance.as_array().map(Vec::as_slice).unwrap_or_default();
            let duplicate = items
                .iter()
                .enumerate()
                .find(|(i, item)| items[..*i].contains(item))
                .map_or_else(|| "duplicate items".to_string(), |(_, item)| format!("duplicate {}", value_summary(item)));
            constraint(Constraint::UniqueItems, duplicate)
        }
        "enum" => vec![ValidationIssue::new(
            &path,
            IssueKind::Constraint,
            format!("one of {}", format_enum(&fragment.enum_values)),
            value_summary(instance),
        )],
        "anyOf" => {
            let types = fragment.any_of.iter().map(JsonSchema::type_name).collect();
            constraint(Constraint::AnyOf(types), value_summary(instance))
        }
        _ => vec![ValidationIssue::new(&path, IssueKind::Constraint, error.to_string(), value_summary(instance))],
    }
}

/// Short description of a JSON value for diagnostics
pub fn value_summary(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => {
            let shown: String = s.chars().take(40).collect();
            if shown.len() < s.len() {
                format!("string \"{shown}...\"")
            } else {
                format!("string \"{shown}\"")
            }
        }
        Value::Array(items) => format!("array with {} item(s)", items.len()),
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            format!("object with keys [{}]", keys.join(", "))
        }
    }
}
