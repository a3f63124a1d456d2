//! Schema definitions and the built-in schemas the engine depends on.
//!
//! A schema is a JSON-Schema-like document extended with `x-lix-*`
//! keywords:
//!
//! | keyword              | meaning                                             |
//! |----------------------|-----------------------------------------------------|
//! | `x-lix-key`          | schema key, `[a-z0-9_]+`                            |
//! | `x-lix-version`      | schema version string                               |
//! | `x-lix-primary-key`  | properties forming the entity id, in order          |
//! | `x-lix-foreign-keys` | `{properties, references: {schemaKey, properties}}` |
//! | `x-lix-defaults`     | values filled in for missing properties             |

use serde_json::{Map, Value, json};

use crate::{Error, Result, validate};

pub const STORED_SCHEMA_KEY: &str = "quire_stored_schema";
pub const FILE_DESCRIPTOR_SCHEMA_KEY: &str = "quire_file_descriptor";
pub const VERSION_DESCRIPTOR_SCHEMA_KEY: &str = "quire_version_descriptor";
pub const KEY_VALUE_SCHEMA_KEY: &str = "quire_key_value";

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
  pub properties: Vec<String>,
  pub references: ForeignKeyTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyTarget {
  pub schema_key: String,
  pub properties: Vec<String>,
}

/// A parsed, structurally valid schema document.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDefinition {
  pub key:          String,
  pub version:      String,
  /// Empty when the schema declares no primary key; entity ids must then be
  /// supplied by the writer.
  pub primary_key:  Vec<String>,
  pub foreign_keys: Vec<ForeignKey>,
  pub defaults:     Map<String, Value>,
  document:         Value,
}

// ─── Parsing ─────────────────────────────────────────────────────────────────

impl SchemaDefinition {
  /// Validate a schema document and extract its `x-lix-*` metadata.
  pub fn parse(document: Value) -> Result<Self> {
    let Some(obj) = document.as_object() else {
      return Err(Error::schema_invalid("/", "schema must be a JSON object"));
    };

    if obj.get("type").and_then(Value::as_str) != Some("object") {
      return Err(Error::schema_invalid("/type", "type must be \"object\""));
    }

    let key = match obj.get("x-lix-key").and_then(Value::as_str) {
      Some(k) if is_valid_key(k) => k.to_owned(),
      Some(k) => {
        return Err(Error::schema_invalid(
          "/x-lix-key",
          format!("{k:?} must match [a-z0-9_]+"),
        ));
      }
      None => {
        return Err(Error::schema_invalid(
          "/x-lix-key",
          "missing string x-lix-key",
        ));
      }
    };

    let Some(version) = obj.get("x-lix-version").and_then(Value::as_str)
    else {
      return Err(Error::schema_invalid(
        "/x-lix-version",
        "missing string x-lix-version",
      ));
    };

    let Some(properties) = obj.get("properties").and_then(Value::as_object)
    else {
      return Err(Error::schema_invalid(
        "/properties",
        "properties must be an object",
      ));
    };

    validate::check_schema_node(&document, "")?;

    let primary_key = match obj.get("x-lix-primary-key") {
      None => Vec::new(),
      Some(v) => property_list(v, "/x-lix-primary-key")?,
    };
    for (i, name) in primary_key.iter().enumerate() {
      if !properties.contains_key(name) {
        return Err(Error::schema_invalid(
          format!("/x-lix-primary-key/{i}"),
          format!("primary key property {name:?} is not declared"),
        ));
      }
    }

    let foreign_keys = match obj.get("x-lix-foreign-keys") {
      None => Vec::new(),
      Some(Value::Array(items)) => items
        .iter()
        .enumerate()
        .map(|(i, fk)| {
          parse_foreign_key(fk, &format!("/x-lix-foreign-keys/{i}"))
        })
        .collect::<Result<_>>()?,
      Some(_) => {
        return Err(Error::schema_invalid(
          "/x-lix-foreign-keys",
          "x-lix-foreign-keys must be an array",
        ));
      }
    };

    let defaults = match obj.get("x-lix-defaults") {
      None => Map::new(),
      Some(Value::Object(map)) => map.clone(),
      Some(_) => {
        return Err(Error::schema_invalid(
          "/x-lix-defaults",
          "x-lix-defaults must be an object",
        ));
      }
    };

    Ok(Self {
      key,
      version: version.to_owned(),
      primary_key,
      foreign_keys,
      defaults,
      document,
    })
  }

  /// Parse the content of a `quire_stored_schema` entity, enforcing that the
  /// stored key and version match the embedded document.
  pub fn from_stored(content: &Value) -> Result<Self> {
    let key = content.get("key").and_then(Value::as_str);
    let version = content.get("version").and_then(Value::as_str);
    let Some(value) = content.get("value") else {
      return Err(Error::schema_invalid("/value", "missing schema document"));
    };
    let schema = Self::parse(value.clone())?;
    if key != Some(schema.key.as_str()) {
      return Err(Error::schema_invalid(
        "/key",
        format!("stored key does not match x-lix-key {:?}", schema.key),
      ));
    }
    if version != Some(schema.version.as_str()) {
      return Err(Error::schema_invalid(
        "/version",
        format!(
          "stored version does not match x-lix-version {:?}",
          schema.version
        ),
      ));
    }
    Ok(schema)
  }

  /// Wrap this schema as `quire_stored_schema` content.
  pub fn to_stored(&self) -> Value {
    json!({
      "key": self.key,
      "version": self.version,
      "value": self.document,
    })
  }

  pub fn document(&self) -> &Value { &self.document }

  /// Declared top-level property names, sorted.
  pub fn property_names(&self) -> Vec<String> {
    self
      .document
      .get("properties")
      .and_then(Value::as_object)
      .map(|p| p.keys().cloned().collect())
      .unwrap_or_default()
  }
}

fn is_valid_key(key: &str) -> bool {
  !key.is_empty()
    && key
      .chars()
      .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Accepts both bare names and JSON-pointer form (`"/id"`).
fn property_list(value: &Value, path: &str) -> Result<Vec<String>> {
  let Some(items) = value.as_array() else {
    return Err(Error::schema_invalid(path, "expected an array of properties"));
  };
  if items.is_empty() {
    return Err(Error::schema_invalid(path, "property list is empty"));
  }
  items
    .iter()
    .enumerate()
    .map(|(i, item)| match item.as_str() {
      Some(s) => Ok(s.strip_prefix('/').unwrap_or(s).to_owned()),
      None => Err(Error::schema_invalid(
        format!("{path}/{i}"),
        "property name must be a string",
      )),
    })
    .collect()
}

fn parse_foreign_key(value: &Value, path: &str) -> Result<ForeignKey> {
  let properties = property_list(
    value.get("properties").unwrap_or(&Value::Null),
    &format!("{path}/properties"),
  )?;
  let Some(references) = value.get("references") else {
    return Err(Error::schema_invalid(
      format!("{path}/references"),
      "missing references",
    ));
  };
  let Some(schema_key) = references.get("schemaKey").and_then(Value::as_str)
  else {
    return Err(Error::schema_invalid(
      format!("{path}/references/schemaKey"),
      "missing referenced schemaKey",
    ));
  };
  let ref_properties = property_list(
    references.get("properties").unwrap_or(&Value::Null),
    &format!("{path}/references/properties"),
  )?;
  if ref_properties.len() != properties.len() {
    return Err(Error::schema_invalid(
      path,
      "properties and references.properties differ in length",
    ));
  }
  Ok(ForeignKey {
    properties,
    references: ForeignKeyTarget {
      schema_key: schema_key.to_owned(),
      properties: ref_properties,
    },
  })
}

// ─── Instances ───────────────────────────────────────────────────────────────

impl SchemaDefinition {
  /// Validate an instance against this schema.
  pub fn validate(&self, data: &Value) -> Result<()> {
    validate::validate_instance(&self.key, &self.document, data, "")
  }

  /// Fill properties missing from `data` with `x-lix-defaults`.
  pub fn apply_defaults(&self, data: &mut Value) {
    let Some(obj) = data.as_object_mut() else { return };
    for (name, default) in &self.defaults {
      obj.entry(name.clone()).or_insert_with(|| default.clone());
    }
  }

  /// Canonical entity id from the primary-key values of `data`.
  ///
  /// Returns `Ok(None)` when the schema has no primary key.
  pub fn entity_id_for(&self, data: &Value) -> Result<Option<String>> {
    if self.primary_key.is_empty() {
      return Ok(None);
    }
    self.key_for(&self.primary_key, data).map(Some)
  }

  /// Join the values of `properties` the same way entity ids are formed.
  /// A missing or null value is `DataInvalid`.
  pub fn key_for(&self, properties: &[String], data: &Value) -> Result<String> {
    let mut parts = Vec::with_capacity(properties.len());
    for name in properties {
      match data.get(name) {
        None | Some(Value::Null) => {
          return Err(Error::DataInvalid {
            schema_key: self.key.clone(),
            path:       format!("/{name}"),
            value:      data.get(name).cloned().unwrap_or(Value::Null),
            message:    "primary key value is missing".to_owned(),
          });
        }
        Some(Value::String(s)) => parts.push(s.clone()),
        Some(other) => parts.push(other.to_string()),
      }
    }
    Ok(parts.join(","))
  }
}

// ─── Built-in schemas ────────────────────────────────────────────────────────

/// Schemas the engine itself writes. They are known in code and never need
/// to be registered.
pub fn builtin_schemas() -> Vec<SchemaDefinition> {
  let documents = [
    json!({
      "type": "object",
      "x-lix-key": STORED_SCHEMA_KEY,
      "x-lix-version": "1.0",
      "x-lix-primary-key": ["key", "version"],
      "properties": {
        "key":     { "type": "string" },
        "version": { "type": "string" },
        "value":   { "type": "object" }
      },
      "required": ["key", "version", "value"],
      "additionalProperties": false
    }),
    json!({
      "type": "object",
      "x-lix-key": FILE_DESCRIPTOR_SCHEMA_KEY,
      "x-lix-version": "1.0",
      "x-lix-primary-key": ["id"],
      "x-lix-defaults": { "metadata": null },
      "properties": {
        "id":       { "type": "string" },
        "path":     { "type": "string", "minLength": 1 },
        "metadata": { "type": ["object", "null"] }
      },
      "required": ["id", "path"],
      "additionalProperties": false
    }),
    json!({
      "type": "object",
      "x-lix-key": VERSION_DESCRIPTOR_SCHEMA_KEY,
      "x-lix-version": "1.0",
      "x-lix-primary-key": ["id"],
      "x-lix-defaults": { "inherits_from_version_id": null, "hidden": false },
      "properties": {
        "id":                       { "type": "string" },
        "name":                     { "type": "string" },
        "inherits_from_version_id": { "type": ["string", "null"] },
        "hidden":                   { "type": "boolean" }
      },
      "required": ["id", "name"],
      "additionalProperties": false
    }),
    json!({
      "type": "object",
      "x-lix-key": KEY_VALUE_SCHEMA_KEY,
      "x-lix-version": "1.0",
      "x-lix-primary-key": ["key"],
      "properties": {
        "key":   { "type": "string" },
        "value": {}
      },
      "required": ["key", "value"],
      "additionalProperties": false
    }),
  ];

  documents
    .into_iter()
    .filter_map(|doc| SchemaDefinition::parse(doc).ok())
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn person_doc() -> Value {
    json!({
      "type": "object",
      "x-lix-key": "person",
      "x-lix-version": "1.0",
      "x-lix-primary-key": ["/first", "last"],
      "x-lix-defaults": { "nickname": null },
      "properties": {
        "first":    { "type": "string" },
        "last":     { "type": "string" },
        "age":      { "type": "integer" },
        "nickname": { "type": ["string", "null"] }
      },
      "required": ["first", "last"]
    })
  }

  #[test]
  fn parses_metadata() {
    let schema = SchemaDefinition::parse(person_doc()).unwrap();
    assert_eq!(schema.key, "person");
    assert_eq!(schema.version, "1.0");
    assert_eq!(schema.primary_key, vec!["first", "last"]);
  }

  #[test]
  fn rejects_bad_key() {
    let mut doc = person_doc();
    doc["x-lix-key"] = json!("Person-1");
    let err = SchemaDefinition::parse(doc).unwrap_err();
    match err {
      Error::SchemaInvalid { path, .. } => assert_eq!(path, "/x-lix-key"),
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn rejects_undeclared_primary_key() {
    let mut doc = person_doc();
    doc["x-lix-primary-key"] = json!(["email"]);
    assert!(SchemaDefinition::parse(doc).is_err());
  }

  #[test]
  fn rejects_mismatched_foreign_key_lengths() {
    let mut doc = person_doc();
    doc["x-lix-foreign-keys"] = json!([{
      "properties": ["first"],
      "references": { "schemaKey": "other", "properties": ["a", "b"] }
    }]);
    assert!(SchemaDefinition::parse(doc).is_err());
  }

  #[test]
  fn composite_entity_id_is_comma_joined() {
    let schema = SchemaDefinition::parse(person_doc()).unwrap();
    let id = schema
      .entity_id_for(&json!({ "last": "Parker", "first": "Peter" }))
      .unwrap();
    assert_eq!(id.as_deref(), Some("Peter,Parker"));
  }

  #[test]
  fn non_string_key_values_use_json_text() {
    let schema = SchemaDefinition::parse(json!({
      "type": "object",
      "x-lix-key": "counter",
      "x-lix-version": "1",
      "x-lix-primary-key": ["n"],
      "properties": { "n": { "type": "integer" } }
    }))
    .unwrap();
    assert_eq!(
      schema.entity_id_for(&json!({ "n": 7 })).unwrap().as_deref(),
      Some("7")
    );
    assert!(schema.entity_id_for(&json!({})).is_err());
  }

  #[test]
  fn defaults_fill_missing_properties_only() {
    let schema = SchemaDefinition::parse(person_doc()).unwrap();
    let mut data = json!({ "first": "Peter", "last": "Parker" });
    schema.apply_defaults(&mut data);
    assert_eq!(data["nickname"], Value::Null);

    let mut data = json!({ "first": "a", "last": "b", "nickname": "Spidey" });
    schema.apply_defaults(&mut data);
    assert_eq!(data["nickname"], "Spidey");
  }

  #[test]
  fn stored_schema_must_match_document() {
    let schema = SchemaDefinition::parse(person_doc()).unwrap();
    let stored = schema.to_stored();
    assert_eq!(SchemaDefinition::from_stored(&stored).unwrap(), schema);

    let mut wrong = stored.clone();
    wrong["version"] = json!("2.0");
    assert!(SchemaDefinition::from_stored(&wrong).is_err());
  }

  #[test]
  fn builtins_all_parse() {
    let keys: Vec<_> = builtin_schemas().into_iter().map(|s| s.key).collect();
    assert_eq!(
      keys,
      vec![
        STORED_SCHEMA_KEY,
        FILE_DESCRIPTOR_SCHEMA_KEY,
        VERSION_DESCRIPTOR_SCHEMA_KEY,
        KEY_VALUE_SCHEMA_KEY,
      ]
    );
  }
}
