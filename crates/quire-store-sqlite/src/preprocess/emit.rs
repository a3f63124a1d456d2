//! SQL emitted for terminal virtual relations.

use std::collections::BTreeMap;

use super::{
  parse::{quote_ident, quote_literal},
  shape::{RelationShape, ResolutionPath},
};
use crate::schema::CACHE_COLUMNS;

/// `( subquery ) AS binding` for one analyzed relation.
pub fn relation_sql(
  shape: &RelationShape,
  cache_tables: &BTreeMap<String, String>,
  depth_limit: usize,
) -> String {
  let body = match &shape.path {
    ResolutionPath::Cache { schema_keys, version_ids } => {
      let tables: Vec<&String> = match schema_keys {
        Some(keys) => {
          keys.iter().filter_map(|k| cache_tables.get(k)).collect()
        }
        None => cache_tables.values().collect(),
      };
      let version_filter = version_ids.as_ref().map(|ids| {
        let list: Vec<String> =
          ids.iter().map(|id| quote_literal(id)).collect();
        format!(" WHERE version_id IN ({})", list.join(", "))
      });
      let no_versions =
        version_ids.as_ref().is_some_and(|ids| ids.is_empty());
      if tables.is_empty() || no_versions {
        empty_relation(CACHE_COLUMNS)
      } else {
        cache_union(&tables, version_filter.as_deref().unwrap_or_default())
      }
    }
    ResolutionPath::History { root_commit_id } => {
      history(root_commit_id.as_deref(), depth_limit)
    }
  };
  format!("({body}) AS {}", quote_ident(&shape.binding))
}

fn cache_union(tables: &[&String], version_filter: &str) -> String {
  let columns = CACHE_COLUMNS.join(", ");
  tables
    .iter()
    .map(|t| {
      format!("SELECT {columns} FROM {}{version_filter}", quote_ident(t))
    })
    .collect::<Vec<_>>()
    .join(" UNION ALL ")
}

fn empty_relation(columns: &[&str]) -> String {
  let columns: Vec<String> =
    columns.iter().map(|c| format!("NULL AS {c}")).collect();
  format!("SELECT {} WHERE 0", columns.join(", "))
}

/// Every change recorded in every ancestor of each root commit, with the
/// ancestor's minimum hop depth from that root.
fn history(root_commit_id: Option<&str>, depth_limit: usize) -> String {
  let roots = match root_commit_id {
    Some(id) => format!(
      "SELECT id, id, 0 FROM commits WHERE id = {}",
      quote_literal(id)
    ),
    None => "SELECT id, id, 0 FROM commits".to_owned(),
  };
  format!(
    "WITH RECURSIVE quire_walk (root_commit_id, commit_id, depth) AS (\
       {roots} \
       UNION \
       SELECT w.root_commit_id, e.parent_id, w.depth + 1 \
       FROM quire_walk w JOIN commit_edge e ON e.child_id = w.commit_id \
       WHERE w.depth < {depth_limit}\
     ), \
     quire_depth (root_commit_id, commit_id, depth) AS (\
       SELECT root_commit_id, commit_id, MIN(depth) FROM quire_walk \
       GROUP BY root_commit_id, commit_id\
     ) \
     SELECT c.entity_id AS entity_id, c.schema_key AS schema_key, \
       c.file_id AS file_id, c.plugin_key AS plugin_key, \
       s.content AS snapshot_content, c.schema_version AS schema_version, \
       c.metadata AS metadata, c.id AS change_id, d.commit_id AS commit_id, \
       d.root_commit_id AS root_commit_id, d.depth AS depth \
     FROM quire_depth d \
     JOIN commits cm ON cm.id = d.commit_id \
     JOIN change_set_element el ON el.change_set_id = cm.change_set_id \
     JOIN change c ON c.id = el.change_id \
     LEFT JOIN snapshot s ON s.id = c.snapshot_id"
  )
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeSet;

  use super::*;
  use crate::preprocess::shape::VirtualRelation;

  fn cache_shape(
    schema_keys: Option<&[&str]>,
    version_ids: Option<&[&str]>,
  ) -> RelationShape {
    let set =
      |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();
    RelationShape {
      relation: VirtualRelation::StateByVersion,
      binding:  "s".into(),
      path:     ResolutionPath::Cache {
        schema_keys: schema_keys.map(set),
        version_ids: version_ids.map(set),
      },
    }
  }

  fn tables() -> BTreeMap<String, String> {
    BTreeMap::from([
      ("a".to_owned(), "state_cache_a".to_owned()),
      ("b".to_owned(), "state_cache_b".to_owned()),
    ])
  }

  #[test]
  fn cache_path_unions_the_selected_tables() {
    let sql = relation_sql(&cache_shape(None, Some(&["v"])), &tables(), 10);
    assert!(sql.starts_with("(SELECT entity_id, "));
    assert!(sql.contains("FROM \"state_cache_a\" WHERE version_id IN ('v')"));
    assert!(sql.contains(" UNION ALL SELECT "));
    assert!(sql.ends_with(") AS \"s\""));

    let sql = relation_sql(&cache_shape(Some(&["b"]), None), &tables(), 10);
    assert!(!sql.contains("state_cache_a"));
    assert!(!sql.contains("UNION ALL"));
  }

  #[test]
  fn unknown_schemas_yield_an_empty_relation() {
    let sql = relation_sql(&cache_shape(Some(&["zzz"]), None), &tables(), 10);
    assert!(sql.contains("NULL AS entity_id"));
    assert!(sql.contains("WHERE 0"));
  }

  #[test]
  fn history_path_bounds_the_walk() {
    let shape = RelationShape {
      relation: VirtualRelation::StateHistory,
      binding:  "h".into(),
      path:     ResolutionPath::History {
        root_commit_id: Some("c'1".into()),
      },
    };
    let sql = relation_sql(&shape, &tables(), 7);
    assert!(sql.contains("WHERE id = 'c''1'"));
    assert!(sql.contains("w.depth < 7"));
  }
}
