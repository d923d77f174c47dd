//! Natural-language rendering of schemas for extraction prompts

use serde_json::{Value, json};

use super::{Constraint, JsonSchema, SchemaType, format_enum, format_number};

/// One line per constrained field, e.g. `- score must be a number between 1 and 5`
pub fn describe_constraints(schema: &JsonSchema) -> Vec<String> {
    schema
        .nodes()
        .into_iter()
        .filter_map(|node| {
            let clauses = clauses(node.schema);
            if clauses.is_empty() {
                return None;
            }
            Some(format!(
                "- {} must be {} {}",
                label(&node.path),
                type_phrase(node.schema),
                clauses.join(", ")
            ))
        })
        .collect()
}

fn label(path: &str) -> String {
    if path.is_empty() {
        "the value".to_string()
    } else {
        path.replace("[]", "[*]")
    }
}

fn type_phrase(schema: &JsonSchema) -> String {
    match schema.schema_type() {
        Some(SchemaType::Integer) => "an integer".to_string(),
        Some(SchemaType::Object) => "an object".to_string(),
        Some(SchemaType::Array) => match &schema.items {
            Some(items) => format!("a JSON array of {}", items.type_name()),
            None => "a JSON array".to_string(),
        },
        Some(t) => format!("a {t}"),
        None if schema.is_object() => "an object".to_string(),
        None => "a value".to_string(),
    }
}

fn range(min: Option<String>, max: Option<String>, unit: &str) -> Option<String> {
    match (min, max) {
        (Some(a), Some(b)) => Some(format!("between {a} and {b}{unit}")),
        (Some(a), None) => Some(format!("at least {a}{unit}")),
        (None, Some(b)) => Some(format!("at most {b}{unit}")),
        (None, None) => None,
    }
}

fn clauses(schema: &JsonSchema) -> Vec<String> {
    let mut out = Vec::new();

    if let Some(r) = range(schema.minimum.map(format_number), schema.maximum.map(format_number), "") {
        out.push(r);
    }
    if let Some(step) = schema.multiple_of {
        out.push(format!("a multiple of {}", format_number(step)));
    }
    if let Some(r) = range(
        schema.min_length.map(|n| n.to_string()),
        schema.max_length.map(|n| n.to_string()),
        " characters long",
    ) {
        out.push(r);
    }
    if let Some(p) = &schema.pattern {
        out.push(format!("matching the pattern /{p}/"));
    }
    if let Some(f) = &schema.format {
        out.push(format!("in {f} format"));
    }
    if let Some(r) = range(
        schema.min_items.map(|n| n.to_string()),
        schema.max_items.map(|n| n.to_string()),
        " item(s)",
    ) {
        out.push(format!("containing {r}"));
    }
    if schema.unique_items {
        out.push("with no duplicate items".to_string());
    }
    if !schema.enum_values.is_empty() {
        out.push(format!(
            "EXACTLY one of these values: {} (use the exact values, do not paraphrase)",
            format_enum(&schema.enum_values)
        ));
    }
    if schema.is_object() && !schema.required.is_empty() {
        out.push(format!("with these REQUIRED fields: {}", schema.required.join(", ")));
    }
    for c in schema.constraints() {
        if matches!(
            c,
            Constraint::NoAdditionalProperties
                | Constraint::AdditionalPropertiesSchema(_)
                | Constraint::AnyOf(_)
                | Constraint::AllOf(_)
        ) {
            out.push(c.to_string());
        }
    }
    out
}

/// Example value built from required fields, for object schemas
///
/// Returns `None` when the schema is not an object or requires nothing.
pub fn build_example(schema: &JsonSchema) -> Option<Value> {
    if !schema.is_object() || schema.required.is_empty() {
        return None;
    }
    let mut example = serde_json::Map::new();
    for (name, field) in &schema.properties {
        if schema.is_required(name) {
            example.insert(name.clone(), example_value(field));
        }
    }
    (!example.is_empty()).then_some(Value::Object(example))
}

fn example_value(schema: &JsonSchema) -> Value {
    if let Some(first) = schema.enum_values.first() {
        return first.clone();
    }
    match schema.schema_type() {
        Some(SchemaType::String) => json!("example value"),
        Some(SchemaType::Number) => json!(example_number(schema)),
        Some(SchemaType::Integer) => json!(example_number(schema).round() as i64),
        Some(SchemaType::Boolean) => json!(true),
        Some(SchemaType::Array) => match &schema.items {
            Some(items) if schema.min_items.unwrap_or(0) > 0 || items.is_object() => json!([example_value(items)]),
            _ => json!([]),
        },
        Some(SchemaType::Null) => Value::Null,
        Some(SchemaType::Object) | None if schema.is_object() => build_example(schema).unwrap_or_else(|| json!({})),
        _ => Value::Null,
    }
}

fn example_number(schema: &JsonSchema) -> f64 {
    match (schema.minimum, schema.maximum) {
        (Some(a), Some(b)) => (a + b) / 2.0,
        (Some(a), None) => a,
        (None, Some(b)) => b.min(0.0),
        (None, None) => 0.0,
    }
}

/// Focused instruction for extracting one field
pub fn field_query(field: &str, schema: &JsonSchema) -> String {
    let mut parts = vec![format!("Extract the {field} from the context.")];

    match schema.schema_type() {
        Some(SchemaType::Array) => match &schema.items {
            Some(items) if items.is_object() => {
                let (required, optional): (Vec<_>, Vec<_>) =
                    items.properties.iter().partition(|(name, _)| items.is_required(name));
                let render = |fields: Vec<(&String, &JsonSchema)>| {
                    fields
                        .iter()
                        .map(|(name, s)| format!("'{}' ({})", name, s.type_name()))
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                let mut desc = Vec::new();
                if !required.is_empty() {
                    desc.push(format!("REQUIRED fields: {}", render(required)));
                }
                if !optional.is_empty() {
                    desc.push(format!("Optional fields: {}", render(optional)));
                }
                parts.push(format!(
                    "Return a JSON array where each item is an object with {}.",
                    desc.join(". ")
                ));
            }
            Some(items) => parts.push(format!("Return a JSON array of {} values.", items.type_name())),
            None => parts.push("Return a JSON array.".to_string()),
        },
        Some(SchemaType::String) if !schema.enum_values.is_empty() => parts.push(format!(
            "Return EXACTLY one of these values: {} (use exact strings).",
            format_enum(&schema.enum_values)
        )),
        Some(SchemaType::String) => parts.push("Return a string value.".to_string()),
        Some(SchemaType::Number) => parts.push("Return a numeric value.".to_string()),
        Some(SchemaType::Integer) => parts.push("Return an integer value.".to_string()),
        Some(SchemaType::Boolean) => parts.push("Return a boolean value (true or false).".to_string()),
        _ if schema.is_object() => {
            let fields: Vec<String> = schema
                .required
                .iter()
                .filter_map(|name| {
                    schema
                        .properties
                        .get(name)
                        .map(|s| format!("'{}' ({})", name, s.type_name()))
                })
                .collect();
            if fields.is_empty() {
                parts.push("Return a JSON object.".to_string());
            } else {
                parts.push(format!("Return a JSON object with these REQUIRED fields: {}.", fields.join(", ")));
                if let Some(example) = build_example(schema) {
                    parts.push(format!("Example format: {example}"));
                }
            }
        }
        _ => {}
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(value: Value) -> JsonSchema {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_describe_number_range() {
        let s = schema(json!({
            "type": "object",
            "properties": {"rating": {"type": "integer", "minimum": 1, "maximum": 5}},
            "required": ["rating"]
        }));
        let lines = describe_constraints(&s);
        assert!(lines.contains(&"- rating must be an integer between 1 and 5".to_string()));
        assert!(lines.iter().any(|l| l.contains("REQUIRED fields: rating")));
    }

    #[test]
    fn test_describe_array_items() {
        let s = schema(json!({
            "type": "array",
            "items": {"type": "string", "pattern": "^[A-Z]+$"},
            "minItems": 1,
            "maxItems": 5,
            "uniqueItems": true
        }));
        let lines = describe_constraints(&s);
        assert_eq!(
            lines[0],
            "- the value must be a JSON array of string containing between 1 and 5 item(s), with no duplicate items"
        );
        assert_eq!(lines[1], "- [*] must be a string matching the pattern /^[A-Z]+$/");
    }

    #[test]
    fn test_describe_enum() {
        let s = schema(json!({"type": "object", "properties": {"label": {"type": "string", "enum": ["pos", "neg"]}}}));
        let lines = describe_constraints(&s);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("EXACTLY one of these values: \"pos\", \"neg\""));
    }

    #[test]
    fn test_unconstrained_fields_skipped() {
        let s = schema(json!({"type": "object", "properties": {"name": {"type": "string"}}}));
        assert!(describe_constraints(&s).is_empty());
    }

    #[test]
    fn test_build_example() {
        let s = schema(json!({
            "type": "object",
            "properties": {
                "score": {"type": "number", "minimum": 1, "maximum": 5},
                "label": {"type": "string", "enum": ["pos", "neg"]},
                "tags": {"type": "array", "items": {"type": "string"}},
                "meta": {"type": "object", "properties": {"ok": {"type": "boolean"}}, "required": ["ok"]},
                "note": {"type": "string"}
            },
            "required": ["score", "label", "tags", "meta"]
        }));
        assert_eq!(
            build_example(&s),
            Some(json!({"score": 3.0, "label": "pos", "tags": [], "meta": {"ok": true}}))
        );
        assert_eq!(build_example(&JsonSchema::of(SchemaType::String)), None);
    }

    #[test]
    fn test_field_query_array_of_objects() {
        let s = schema(json!({
            "type": "array",
            "items": {
                "type": "object",
                "properties": {"phrase": {"type": "string"}, "weight": {"type": "number"}},
                "required": ["phrase"]
            }
        }));
        let q = field_query("phrases", &s);
        assert!(q.starts_with("Extract the phrases from the context."));
        assert!(q.contains("REQUIRED fields: 'phrase' (string)"));
        assert!(q.contains("Optional fields: 'weight' (number)"));
    }

    #[test]
    fn test_field_query_object() {
        let s = schema(json!({
            "type": "object",
            "properties": {"score": {"type": "number"}},
            "required": ["score"]
        }));
        let q = field_query("sentiment", &s);
        assert!(q.contains("'score' (number)"));
        assert!(q.contains("Example format: {\"score\":0.0}"));
    }
}
