//! Reference plugin for flat JSON object files.
//!
//! Every top-level property becomes one entity whose id is the property name
//! and whose content is `{property, value, position}`. Rendering writes
//! compact JSON in position order, so a compact input round-trips
//! byte-for-byte.

use std::fmt;

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde_json::{Value, json};

use crate::{
  Error, Result,
  plugin::{FileSnapshot, Plugin, PluginChange},
  schema::SchemaDefinition,
};

pub const JSON_PLUGIN_KEY: &str = "quire_plugin_json";
pub const JSON_PROPERTY_SCHEMA_KEY: &str = "quire_json_property";
const JSON_PROPERTY_SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonObjectPlugin;

impl Plugin for JsonObjectPlugin {
  fn key(&self) -> &str { JSON_PLUGIN_KEY }

  fn matches(&self, path: &str) -> bool { path.ends_with(".json") }

  fn detect_changes(
    &self,
    before: Option<&FileSnapshot>,
    after: &FileSnapshot,
  ) -> Result<Vec<PluginChange>> {
    let old = match before {
      Some(file) => parse_object(file.data.as_deref())?,
      None => Vec::new(),
    };
    let new = parse_object(after.data.as_deref())?;

    let mut changes = Vec::new();
    for (position, (property, value)) in new.iter().enumerate() {
      let unchanged = old
        .iter()
        .position(|(k, _)| k == property)
        .is_some_and(|i| i == position && &old[i].1 == value);
      if !unchanged {
        changes.push(property_change(property, Some((value, position))));
      }
    }
    for (property, _) in &old {
      if !new.iter().any(|(k, _)| k == property) {
        changes.push(property_change(property, None));
      }
    }
    Ok(changes)
  }

  fn apply_changes(
    &self,
    file: &FileSnapshot,
    changes: &[PluginChange],
  ) -> Result<Vec<u8>> {
    // (position, from_change, property, value); changed entries claim their
    // position ahead of untouched ones.
    let mut entries: Vec<(u64, bool, String, Value)> =
      parse_object(file.data.as_deref())?
        .into_iter()
        .enumerate()
        .map(|(i, (k, v))| (i as u64, false, k, v))
        .collect();

    for change in changes {
      if change.schema_key != JSON_PROPERTY_SCHEMA_KEY {
        return Err(Error::plugin(
          JSON_PLUGIN_KEY,
          format!("unexpected schema {}", change.schema_key),
        ));
      }
      entries.retain(|(_, _, k, _)| *k != change.entity_id);
      let Some(content) = &change.snapshot_content else { continue };
      let value = content.get("value").cloned().unwrap_or(Value::Null);
      let position = content
        .get("position")
        .and_then(Value::as_u64)
        .unwrap_or(u64::MAX);
      entries.push((position, true, change.entity_id.clone(), value));
    }

    entries.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

    let body = entries
      .iter()
      .map(|(_, _, k, v)| format!("{}:{}", Value::String(k.clone()), v))
      .collect::<Vec<_>>()
      .join(",");
    Ok(format!("{{{body}}}").into_bytes())
  }

  fn schemas(&self) -> Vec<SchemaDefinition> {
    SchemaDefinition::parse(json!({
      "type": "object",
      "x-lix-key": JSON_PROPERTY_SCHEMA_KEY,
      "x-lix-version": JSON_PROPERTY_SCHEMA_VERSION,
      "x-lix-primary-key": ["property"],
      "properties": {
        "property": { "type": "string" },
        "value":    {},
        "position": { "type": "integer", "minimum": 0 }
      },
      "required": ["property", "value", "position"],
      "additionalProperties": false
    }))
    .into_iter()
    .collect()
  }
}

fn property_change(
  property: &str,
  content: Option<(&Value, usize)>,
) -> PluginChange {
  PluginChange {
    entity_id:        property.to_owned(),
    schema_key:       JSON_PROPERTY_SCHEMA_KEY.to_owned(),
    schema_version:   JSON_PROPERTY_SCHEMA_VERSION.to_owned(),
    snapshot_content: content.map(|(value, position)| {
      json!({ "property": property, "value": value, "position": position })
    }),
  }
}

// ─── Order-preserving parse ──────────────────────────────────────────────────

/// A top-level JSON object with its keys in document order.
struct OrderedObject(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for OrderedObject {
  fn deserialize<D: Deserializer<'de>>(
    deserializer: D,
  ) -> std::result::Result<Self, D::Error> {
    struct ObjectVisitor;

    impl<'de> Visitor<'de> for ObjectVisitor {
      type Value = OrderedObject;

      fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a JSON object")
      }

      fn visit_map<A: MapAccess<'de>>(
        self,
        mut map: A,
      ) -> std::result::Result<OrderedObject, A::Error> {
        let mut entries = Vec::new();
        while let Some((key, value)) = map.next_entry::<String, Value>()? {
          entries.retain(|(k, _): &(String, Value)| *k != key);
          entries.push((key, value));
        }
        Ok(OrderedObject(entries))
      }
    }

    deserializer.deserialize_map(ObjectVisitor)
  }
}

fn parse_object(data: Option<&[u8]>) -> Result<Vec<(String, Value)>> {
  match data {
    None => Ok(Vec::new()),
    Some(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
    Some(bytes) => serde_json::from_slice::<OrderedObject>(bytes)
      .map(|o| o.0)
      .map_err(|e| Error::plugin(JSON_PLUGIN_KEY, e.to_string())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn file(data: &str) -> FileSnapshot {
    FileSnapshot {
      id:   "f1".into(),
      path: "/a.json".into(),
      data: Some(data.as_bytes().to_vec()),
    }
  }

  #[test]
  fn matches_json_paths_only() {
    assert!(JsonObjectPlugin.matches("/data/a.json"));
    assert!(!JsonObjectPlugin.matches("/data/a.md"));
  }

  #[test]
  fn new_file_yields_one_change_per_property() {
    let changes = JsonObjectPlugin
      .detect_changes(None, &file(r#"{"name":"Peter","age":50}"#))
      .unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].entity_id, "name");
    assert_eq!(
      changes[1].snapshot_content,
      Some(json!({ "property": "age", "value": 50, "position": 1 }))
    );
  }

  #[test]
  fn update_reports_only_changed_and_removed_properties() {
    let before = file(r#"{"name":"Peter","age":50,"city":"NYC"}"#);
    let after = file(r#"{"name":"Peter","age":51}"#);
    let changes = JsonObjectPlugin.detect_changes(Some(&before), &after).unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].entity_id, "age");
    assert_eq!(changes[1].entity_id, "city");
    assert!(changes[1].snapshot_content.is_none());
  }

  #[test]
  fn full_render_from_changes_round_trips() {
    let source = r#"{"name":"Peter","age":50,"tags":["a","b"]}"#;
    let changes = JsonObjectPlugin.detect_changes(None, &file(source)).unwrap();
    let empty = FileSnapshot { data: None, ..file("") };
    let bytes = JsonObjectPlugin.apply_changes(&empty, &changes).unwrap();
    assert_eq!(String::from_utf8(bytes).unwrap(), source);
  }

  #[test]
  fn incremental_apply_keeps_untouched_order() {
    let before = file(r#"{"name":"Peter","age":50}"#);
    let after = file(r#"{"id":1,"name":"Peter","age":50}"#);
    let changes = JsonObjectPlugin.detect_changes(Some(&before), &after).unwrap();
    let bytes = JsonObjectPlugin.apply_changes(&before, &changes).unwrap();
    assert_eq!(
      String::from_utf8(bytes).unwrap(),
      r#"{"id":1,"name":"Peter","age":50}"#
    );
  }

  #[test]
  fn rejects_non_object_documents() {
    let err = JsonObjectPlugin.detect_changes(None, &file("[1,2]")).unwrap_err();
    assert!(matches!(err, Error::Plugin { .. }));
  }
}
