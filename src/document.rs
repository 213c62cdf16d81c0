//! Managed documents and their baseline shape
//!
//! A document is one JSON file holding a map of entity-id to entity fields.
//! Shape repair never rejects an entity: malformed entries are coerced to
//! defaults and negative counters are clamped to zero.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::errors::{VaultError, VaultResult};

/// Shape enforced on a document body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentSchema {
    /// Map of entity-id to entity object with counter fields
    Entities {
        #[serde(default)]
        counters: Vec<String>,
        /// Fields backfilled with `null` when missing
        #[serde(default)]
        optional: Vec<String>,
    },
    /// Any JSON object
    Object,
}

/// A document the vault manages: logical name, file name and schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSpec {
    pub name: String,
    pub file: String,
    pub schema: DocumentSchema,
}

impl DocumentSpec {
    pub fn entities(name: &str, file: &str, counters: &[&str], optional: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            file: file.to_string(),
            schema: DocumentSchema::Entities {
                counters: counters.iter().map(|c| c.to_string()).collect(),
                optional: optional.iter().map(|o| o.to_string()).collect(),
            },
        }
    }

    pub fn object(name: &str, file: &str) -> Self {
        Self {
            name: name.to_string(),
            file: file.to_string(),
            schema: DocumentSchema::Object,
        }
    }

    /// Name fragments the recovery scanner accepts for this document
    pub fn match_stems(&self) -> Vec<String> {
        let mut stems = vec![self.name.to_lowercase()];
        if let Some(stem) = self.file.strip_suffix(".json") {
            let stem = stem.to_lowercase();
            if !stems.contains(&stem) {
                stems.push(stem);
            }
        }
        stems
    }

    /// Build a default entity for this schema
    pub fn default_entity(&self) -> Value {
        let mut entity = Map::new();
        if let DocumentSchema::Entities { counters, optional } = &self.schema {
            for counter in counters {
                entity.insert(counter.clone(), Value::from(0));
            }
            for field in optional {
                entity.insert(field.clone(), Value::Null);
            }
        }
        Value::Object(entity)
    }
}

/// Default managed documents: accounts, item catalog and emoji symbol table
pub fn default_documents() -> Vec<DocumentSpec> {
    vec![
        DocumentSpec::entities(
            "accounts",
            "users.json",
            &["cartridge", "voiceTime", "totalVoice", "lastClaim"],
            &["joinTime"],
        ),
        DocumentSpec::object("catalog", "shop.json"),
        DocumentSpec::object("symbol-table", "emojis.json"),
    ]
}

/// A loaded document
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub name: String,
    pub body: Map<String, Value>,
    pub path: PathBuf,
}

impl Document {
    pub fn empty(name: &str, path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            body: Map::new(),
            path,
        }
    }

    pub fn entity_count(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Result of a shape repair pass
#[derive(Debug, Clone, PartialEq)]
pub struct Repaired {
    pub body: Map<String, Value>,
    /// Number of fields or entities that had to be corrected
    pub repairs: usize,
}

/// Validate and repair a document body.
///
/// Fails only when the root is not a JSON object; everything below the root
/// is coerced into shape.
pub fn repair(spec: &DocumentSpec, value: Value) -> VaultResult<Repaired> {
    let Value::Object(mut body) = value else {
        return Err(VaultError::validation(
            spec.name.as_str(),
            "document root must be a JSON object",
        ));
    };

    let mut repairs = 0;
    if let DocumentSchema::Entities { counters, optional } = &spec.schema {
        for (_, entity) in body.iter_mut() {
            if !entity.is_object() {
                *entity = spec.default_entity();
                repairs += 1;
                continue;
            }
            if let Value::Object(fields) = entity {
                repairs += repair_entity(fields, counters, optional);
            }
        }
    }

    Ok(Repaired { body, repairs })
}

fn repair_entity(fields: &mut Map<String, Value>, counters: &[String], optional: &[String]) -> usize {
    let mut repairs = 0;

    for counter in counters {
        let fixed = match fields.get(counter) {
            Some(Value::Number(n)) => {
                if n.as_f64().map(|v| v < 0.0).unwrap_or(false) {
                    Some(Value::from(0))
                } else {
                    None
                }
            }
            _ => Some(Value::from(0)),
        };
        if let Some(value) = fixed {
            fields.insert(counter.clone(), value);
            repairs += 1;
        }
    }

    for field in optional {
        if !fields.contains_key(field) {
            fields.insert(field.clone(), Value::Null);
            repairs += 1;
        }
    }

    repairs
}

/// Whether parsed JSON is plausible content for a document.
///
/// Used by snapshot creation and the recovery scanner: the root must be an
/// object, and an entity document must hold at least one entity to count as
/// a recovery source.
pub fn plausible_shape(spec: &DocumentSpec, value: &Value, require_entities: bool) -> bool {
    match value {
        Value::Object(map) => match spec.schema {
            DocumentSchema::Entities { .. } if require_entities => !map.is_empty(),
            _ => true,
        },
        _ => false,
    }
}
