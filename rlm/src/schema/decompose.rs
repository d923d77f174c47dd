//! Schema decomposition into independently extracted branches
//!
//! An object whose properties include nested objects (or arrays of objects)
//! is split one level at a time: its scalar properties become one `Fields`
//! task and each nested branch becomes its own task, recursing into branches
//! that are themselves non-simple. Arrays are never split per element.

use indexmap::IndexMap;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::{JsonSchema, SchemaType, TypeDecl, field_query, path_of};

/// How a task's value is merged back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// The whole, undecomposed schema
    Whole,
    /// A subset of an object's non-branch properties, merged key by key
    Fields,
    /// One nested object or array-of-object property, merged at its path
    Branch,
}

/// One unit of extraction produced by [`decompose`]
#[derive(Debug, Clone)]
pub struct DecomposedTask {
    /// Stable id, e.g. `fields:$`, `branch:sentiment`
    pub id: String,
    /// Where the value lands in the merged result (`""` is the root)
    pub path: String,
    /// Property names leading to `path`; empty at the root
    pub segments: Vec<String>,
    pub kind: TaskKind,
    pub schema: JsonSchema,
    /// Focused instruction for this branch
    pub query: String,
    /// `name: type` of every field of the enclosing object
    pub sibling_context: Vec<String>,
    /// Ids of tasks whose values must be known before this one runs
    pub dependencies: BTreeSet<String>,
}

/// Result of decomposing a schema
#[derive(Debug, Clone)]
pub struct SchemaDecomposition {
    pub tasks: Vec<DecomposedTask>,
    /// Container (as property names from the root) -> ids of every task
    /// writing beneath it
    ///
    /// A container is only validated once all of these are terminal; it is
    /// never blocked from dispatch.
    pub completion_graph: BTreeMap<Vec<String>, Vec<String>>,
}

impl SchemaDecomposition {
    /// Single-task decomposition for simple schemas and fallback
    pub fn whole(schema: &JsonSchema, query: &str) -> Self {
        Self {
            tasks: vec![DecomposedTask {
                id: "whole".to_string(),
                path: String::new(),
                segments: Vec::new(),
                kind: TaskKind::Whole,
                schema: schema.clone(),
                query: query.to_string(),
                sibling_context: Vec::new(),
                dependencies: BTreeSet::new(),
            }],
            completion_graph: BTreeMap::from([(Vec::new(), vec!["whole".to_string()])]),
        }
    }

    pub fn is_decomposed(&self) -> bool {
        !matches!(self.tasks.as_slice(), [only] if only.kind == TaskKind::Whole)
    }

    /// Containers, deepest first
    pub fn containers_bottom_up(&self) -> Vec<&[String]> {
        let mut containers: Vec<&[String]> = self.completion_graph.keys().map(Vec::as_slice).collect();
        containers.sort_by_key(|c| std::cmp::Reverse(c.len()));
        containers
    }
}

/// A schema is simple when it is not an object or none of its properties branch
pub fn is_simple(schema: &JsonSchema) -> bool {
    !schema.is_object() || !schema.properties.values().any(JsonSchema::is_branch)
}

/// Split `schema` into subtasks, or a single whole-schema task when simple
pub fn decompose(schema: &JsonSchema) -> SchemaDecomposition {
    debug!("decompose: called");
    if is_simple(schema) {
        debug!("decompose: simple schema, single task");
        return SchemaDecomposition::whole(schema, "");
    }

    let mut out = SchemaDecomposition {
        tasks: Vec::new(),
        completion_graph: BTreeMap::new(),
    };
    split_object(schema, &[], &mut out);
    debug!(tasks = out.tasks.len(), "decompose: split");
    out
}

/// Split one object; returns the ids of every task beneath it
fn split_object(schema: &JsonSchema, segments: &[String], out: &mut SchemaDecomposition) -> Vec<String> {
    let path = path_of(segments);
    let path = path.as_str();
    let siblings = sibling_context(schema);
    let mut beneath = Vec::new();

    let scalars: IndexMap<String, JsonSchema> = schema
        .properties
        .iter()
        .filter(|(_, s)| !s.is_branch())
        .map(|(k, s)| (k.clone(), s.clone()))
        .collect();

    if !scalars.is_empty() {
        let required = schema
            .required
            .iter()
            .filter(|r| scalars.contains_key(*r))
            .cloned()
            .collect();
        let names: Vec<String> = scalars
            .iter()
            .map(|(k, s)| format!("'{}' ({})", k, s.type_name()))
            .collect();
        let subject = if path.is_empty() { "the result".to_string() } else { format!("'{path}'") };
        let id = format!("fields:{}", if path.is_empty() { "$" } else { path });
        out.tasks.push(DecomposedTask {
            id: id.clone(),
            path: path.to_string(),
            segments: segments.to_vec(),
            kind: TaskKind::Fields,
            schema: JsonSchema {
                type_decl: Some(TypeDecl::One(SchemaType::Object)),
                description: schema.description.clone(),
                properties: scalars,
                required,
                ..JsonSchema::default()
            },
            query: format!("Extract these fields of {}: {}.", subject, names.join(", ")),
            sibling_context: siblings.clone(),
            dependencies: BTreeSet::new(),
        });
        beneath.push(id);
    }

    for (name, child) in schema.properties.iter().filter(|(_, s)| s.is_branch()) {
        let mut child_segments = segments.to_vec();
        child_segments.push(name.clone());
        if child.is_object() && !is_simple(child) {
            beneath.extend(split_object(child, &child_segments, out));
            continue;
        }
        let child_path = path_of(&child_segments);

        let mut branch_schema = child.clone();
        if !schema.is_required(name) {
            branch_schema.nullable = true;
        }
        let id = format!("branch:{child_path}");
        out.tasks.push(DecomposedTask {
            id: id.clone(),
            path: child_path,
            segments: child_segments,
            kind: TaskKind::Branch,
            schema: branch_schema,
            query: field_query(name, child),
            sibling_context: siblings.clone(),
            dependencies: BTreeSet::new(),
        });
        beneath.push(id);
    }

    out.completion_graph.insert(segments.to_vec(), beneath.clone());
    beneath
}

fn sibling_context(schema: &JsonSchema) -> Vec<String> {
    schema
        .properties
        .iter()
        .map(|(name, s)| {
            let marker = if schema.is_required(name) { " (required)" } else { "" };
            format!("{}: {}{}", name, s.type_name(), marker)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(value: serde_json::Value) -> JsonSchema {
        serde_json::from_value(value).unwrap()
    }

    fn key(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn sentiment_schema() -> JsonSchema {
        schema(json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string"},
                "sentiment": {
                    "type": "object",
                    "properties": {"score": {"type": "number"}, "confidence": {"type": "number"}},
                    "required": ["score", "confidence"]
                },
                "phrases": {
                    "type": "array",
                    "items": {"type": "object", "properties": {"phrase": {"type": "string"}}, "required": ["phrase"]}
                }
            },
            "required": ["summary", "sentiment"]
        }))
    }

    #[test]
    fn test_flat_schema_is_simple() {
        let s = schema(json!({
            "type": "object",
            "properties": {"name": {"type": "string"}, "tags": {"type": "array", "items": {"type": "string"}}}
        }));
        assert!(is_simple(&s));
        let d = decompose(&s);
        assert!(!d.is_decomposed());
        assert_eq!(d.tasks[0].kind, TaskKind::Whole);
    }

    #[test]
    fn test_non_object_is_simple() {
        assert!(is_simple(&JsonSchema::array(JsonSchema::object([(
            "a",
            JsonSchema::of(SchemaType::String)
        )]))));
    }

    #[test]
    fn test_splits_branches() {
        let d = decompose(&sentiment_schema());
        assert!(d.is_decomposed());

        let ids: Vec<&str> = d.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["fields:$", "branch:sentiment", "branch:phrases"]);

        let fields = &d.tasks[0];
        assert_eq!(fields.kind, TaskKind::Fields);
        assert_eq!(fields.schema.properties.len(), 1);
        assert_eq!(fields.schema.required, vec!["summary"]);

        let sentiment = &d.tasks[1];
        assert_eq!(sentiment.path, "sentiment");
        assert!(!sentiment.schema.nullable);
        assert!(sentiment.query.contains("'score' (number)"));
        assert!(sentiment.sibling_context.contains(&"phrases: array of object".to_string()));

        // Optional branches accept null
        assert!(d.tasks[2].schema.nullable);

        assert_eq!(d.completion_graph[&key(&[])].len(), 3);
    }

    #[test]
    fn test_recurses_into_non_simple_branches() {
        let s = schema(json!({
            "type": "object",
            "properties": {
                "customer": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "address": {
                            "type": "object",
                            "properties": {"city": {"type": "string"}},
                            "required": ["city"]
                        }
                    },
                    "required": ["name", "address"]
                }
            },
            "required": ["customer"]
        }));

        let d = decompose(&s);
        let ids: Vec<&str> = d.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["fields:customer", "branch:customer.address"]);
        assert_eq!(d.completion_graph[&key(&["customer"])].len(), 2);
        assert_eq!(d.completion_graph[&key(&[])].len(), 2);
        let containers: Vec<String> = d.containers_bottom_up().into_iter().map(path_of).collect();
        assert_eq!(containers, vec!["customer", ""]);
        assert_eq!(d.tasks[1].segments, key(&["customer", "address"]));
    }

    #[test]
    fn test_dotted_property_names_stay_whole() {
        let s = schema(json!({
            "type": "object",
            "properties": {
                "user.info": {
                    "type": "object",
                    "properties": {"name": {"type": "string"}},
                    "required": ["name"]
                },
                "user": {
                    "type": "object",
                    "properties": {
                        "id": {"type": "integer"},
                        "info": {"type": "object", "properties": {"age": {"type": "integer"}}}
                    }
                }
            },
            "required": ["user.info", "user"]
        }));

        let d = decompose(&s);
        let ids: Vec<&str> = d.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![r#"branch:["user.info"]"#, "fields:user", "branch:user.info"]);
        assert_eq!(d.tasks[0].segments, key(&["user.info"]));
        assert_eq!(d.tasks[2].segments, key(&["user", "info"]));
    }
}
