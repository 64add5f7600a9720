//! Typed data shapes for contract operation inputs and outputs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Declared shape of an operation's input or output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    Null,
    Boolean,
    Integer,
    Number,
    String,
    /// One of a fixed set of string values
    Enum { values: Vec<String> },
    Array { items: Box<Shape> },
    Object {
        #[serde(default)]
        properties: BTreeMap<String, Shape>,
    },
    #[default]
    Any,
}

impl Shape {
    pub fn array(items: Shape) -> Self {
        Self::Array {
            items: Box::new(items),
        }
    }

    pub fn object<I, K>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, Shape)>,
        K: Into<String>,
    {
        Self::Object {
            properties: properties.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// JSON Schema equivalent, used to validate call inputs
    pub fn to_json_schema(&self) -> Value {
        match self {
            Shape::Null => json!({ "type": "null" }),
            Shape::Boolean => json!({ "type": "boolean" }),
            Shape::Integer => json!({ "type": "integer" }),
            Shape::Number => json!({ "type": "number" }),
            Shape::String => json!({ "type": "string" }),
            Shape::Enum { values } => json!({ "type": "string", "enum": values }),
            Shape::Array { items } => json!({ "type": "array", "items": items.to_json_schema() }),
            Shape::Object { properties } => {
                let mut props = Map::new();
                for (name, shape) in properties {
                    props.insert(name.clone(), shape.to_json_schema());
                }
                let required: Vec<&String> = properties.keys().collect();
                json!({ "type": "object", "properties": props, "required": required })
            }
            Shape::Any => json!({}),
        }
    }

    /// Reject shapes no value can satisfy
    pub fn check(&self, path: &str) -> Result<(), String> {
        match self {
            Shape::Enum { values } if values.is_empty() => {
                Err(format!("enum shape at '{}' declares no values", path))
            }
            Shape::Array { items } => items.check(&format!("{}[]", path)),
            Shape::Object { properties } => {
                for (name, shape) in properties {
                    shape.check(&format!("{}.{}", path, name))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Feed a canonical encoding of the shape into a hasher
    pub(crate) fn feed(&self, hasher: &mut blake3::Hasher) {
        match self {
            Shape::Null => {
                hasher.update(b"null;");
            }
            Shape::Boolean => {
                hasher.update(b"boolean;");
            }
            Shape::Integer => {
                hasher.update(b"integer;");
            }
            Shape::Number => {
                hasher.update(b"number;");
            }
            Shape::String => {
                hasher.update(b"string;");
            }
            Shape::Enum { values } => {
                hasher.update(b"enum(");
                for value in values {
                    hasher.update(value.as_bytes());
                    hasher.update(b",");
                }
                hasher.update(b");");
            }
            Shape::Array { items } => {
                hasher.update(b"array(");
                items.feed(hasher);
                hasher.update(b");");
            }
            Shape::Object { properties } => {
                hasher.update(b"object(");
                for (name, shape) in properties {
                    hasher.update(name.as_bytes());
                    hasher.update(b":");
                    shape.feed(hasher);
                }
                hasher.update(b");");
            }
            Shape::Any => {
                hasher.update(b"any;");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_shape() {
        let shape: Shape = serde_yaml::from_str(
            "type: object\nproperties:\n  id: { type: integer }\n  tags: { type: array, items: { type: string } }\n",
        )
        .unwrap();
        assert_eq!(
            shape,
            Shape::object([
                ("id", Shape::Integer),
                ("tags", Shape::array(Shape::String)),
            ])
        );
    }

    #[test]
    fn test_json_schema_requires_all_properties() {
        let schema = Shape::object([("name", Shape::String)]).to_json_schema();
        assert_eq!(schema["required"], json!(["name"]));
        assert_eq!(schema["properties"]["name"]["type"], "string");
        assert_eq!(Shape::Any.to_json_schema(), json!({}));
    }

    #[test]
    fn test_empty_enum_rejected() {
        let shape = Shape::object([("mode", Shape::Enum { values: vec![] })]);
        let err = shape.check("output").unwrap_err();
        assert!(err.contains("output.mode"));
    }
}
