//! Instance validation against the JSON-Schema subset understood by the
//! registry.
//!
//! Supported keywords: `type` (string or list), `properties`, `required`,
//! `additionalProperties: false`, `enum`, `const`, `items`, `minimum`,
//! `maximum`, `minLength`, `maxLength`. Unknown keywords are ignored, so
//! documents written for a full validator still load.

use serde_json::Value;

use crate::{Error, Result};

const TYPE_NAMES: &[&str] =
  &["object", "array", "string", "number", "integer", "boolean", "null"];

/// Check that a schema node only uses keyword values this module can
/// interpret. `path` is the JSON pointer of `node` within the document.
pub(crate) fn check_schema_node(node: &Value, path: &str) -> Result<()> {
  let Some(obj) = node.as_object() else {
    return Err(Error::schema_invalid(path, "schema node must be an object"));
  };

  if let Some(ty) = obj.get("type") {
    let names: Vec<&Value> = match ty {
      Value::Array(items) => items.iter().collect(),
      other => vec![other],
    };
    for name in names {
      match name.as_str() {
        Some(n) if TYPE_NAMES.contains(&n) => {}
        _ => {
          return Err(Error::schema_invalid(
            format!("{path}/type"),
            format!("unknown type {name}"),
          ));
        }
      }
    }
  }

  if let Some(props) = obj.get("properties") {
    let Some(props) = props.as_object() else {
      return Err(Error::schema_invalid(
        format!("{path}/properties"),
        "properties must be an object",
      ));
    };
    for (name, child) in props {
      check_schema_node(child, &format!("{path}/properties/{name}"))?;
    }
  }

  if let Some(required) = obj.get("required") {
    let ok = required
      .as_array()
      .is_some_and(|items| items.iter().all(Value::is_string));
    if !ok {
      return Err(Error::schema_invalid(
        format!("{path}/required"),
        "required must be an array of strings",
      ));
    }
  }

  if let Some(items) = obj.get("items") {
    check_schema_node(items, &format!("{path}/items"))?;
  }

  Ok(())
}

/// Validate `data` against `node`, reporting the first violation.
pub(crate) fn validate_instance(
  schema_key: &str,
  node: &Value,
  data: &Value,
  path: &str,
) -> Result<()> {
  let fail = |message: String| {
    Err(Error::DataInvalid {
      schema_key: schema_key.to_owned(),
      path: if path.is_empty() { "/".to_owned() } else { path.to_owned() },
      value: data.clone(),
      message,
    })
  };

  let Some(obj) = node.as_object() else {
    return Ok(());
  };

  if let Some(ty) = obj.get("type") {
    let allowed: Vec<&str> = match ty {
      Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
      Value::String(s) => vec![s.as_str()],
      _ => Vec::new(),
    };
    if !allowed.is_empty() && !allowed.iter().any(|t| type_matches(t, data)) {
      return fail(format!("expected type {}", allowed.join(" | ")));
    }
  }

  if let Some(options) = obj.get("enum").and_then(Value::as_array)
    && !options.contains(data)
  {
    return fail("value is not one of the enumerated options".to_owned());
  }

  if let Some(expected) = obj.get("const")
    && expected != data
  {
    return fail(format!("expected constant {expected}"));
  }

  match data {
    Value::Number(n) => {
      let n = n.as_f64().unwrap_or_default();
      if let Some(min) = obj.get("minimum").and_then(Value::as_f64)
        && n < min
      {
        return fail(format!("must be >= {min}"));
      }
      if let Some(max) = obj.get("maximum").and_then(Value::as_f64)
        && n > max
      {
        return fail(format!("must be <= {max}"));
      }
    }
    Value::String(s) => {
      let len = s.chars().count() as u64;
      if let Some(min) = obj.get("minLength").and_then(Value::as_u64)
        && len < min
      {
        return fail(format!("length must be >= {min}"));
      }
      if let Some(max) = obj.get("maxLength").and_then(Value::as_u64)
        && len > max
      {
        return fail(format!("length must be <= {max}"));
      }
    }
    Value::Array(items) => {
      if let Some(item_schema) = obj.get("items") {
        for (i, item) in items.iter().enumerate() {
          validate_instance(
            schema_key,
            item_schema,
            item,
            &format!("{path}/{i}"),
          )?;
        }
      }
    }
    Value::Object(fields) => {
      let properties = obj.get("properties").and_then(Value::as_object);

      if let Some(required) = obj.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
          if !fields.contains_key(name) {
            return fail(format!("missing required property {name:?}"));
          }
        }
      }

      if obj.get("additionalProperties") == Some(&Value::Bool(false)) {
        for name in fields.keys() {
          if !properties.is_some_and(|p| p.contains_key(name)) {
            return fail(format!("unexpected property {name:?}"));
          }
        }
      }

      if let Some(properties) = properties {
        for (name, value) in fields {
          if let Some(child) = properties.get(name) {
            validate_instance(
              schema_key,
              child,
              value,
              &format!("{path}/{name}"),
            )?;
          }
        }
      }
    }
    _ => {}
  }

  Ok(())
}

fn type_matches(ty: &str, data: &Value) -> bool {
  match ty {
    "object" => data.is_object(),
    "array" => data.is_array(),
    "string" => data.is_string(),
    "number" => data.is_number(),
    "integer" => {
      data.is_i64()
        || data.is_u64()
        || data.as_f64().is_some_and(|f| f.fract() == 0.0)
    }
    "boolean" => data.is_boolean(),
    "null" => data.is_null(),
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn person() -> Value {
    json!({
      "type": "object",
      "properties": {
        "name": { "type": "string", "minLength": 1 },
        "age":  { "type": "integer", "minimum": 0 },
        "tags": { "type": "array", "items": { "type": "string" } },
        "role": { "type": ["string", "null"], "enum": ["admin", "user", null] }
      },
      "required": ["name"],
      "additionalProperties": false
    })
  }

  #[test]
  fn accepts_valid_instance() {
    let data = json!({ "name": "Peter", "age": 50, "tags": ["a"], "role": null });
    validate_instance("person", &person(), &data, "").unwrap();
  }

  #[test]
  fn reports_path_of_nested_violation() {
    let data = json!({ "name": "Peter", "tags": ["a", 3] });
    let err = validate_instance("person", &person(), &data, "").unwrap_err();
    match err {
      Error::DataInvalid { path, value, .. } => {
        assert_eq!(path, "/tags/1");
        assert_eq!(value, json!(3));
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn rejects_missing_required_and_unknown_properties() {
    assert!(validate_instance("person", &person(), &json!({}), "").is_err());
    assert!(
      validate_instance(
        "person",
        &person(),
        &json!({ "name": "x", "extra": true }),
        ""
      )
      .is_err()
    );
  }

  #[test]
  fn integer_rejects_fractions() {
    let data = json!({ "name": "Peter", "age": 50.5 });
    assert!(validate_instance("person", &person(), &data, "").is_err());
  }

  #[test]
  fn schema_check_rejects_unknown_type_names() {
    let err = check_schema_node(&json!({ "type": "text" }), "").unwrap_err();
    assert!(matches!(err, Error::SchemaInvalid { .. }));
  }
}
