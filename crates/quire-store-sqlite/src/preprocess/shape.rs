//! Typed description of which virtual relations a query reads, and how.
//!
//! Analysis walks the expanded tree one SELECT core at a time. For every
//! terminal virtual relation it collects the equality and IN filters found
//! among the top-level AND conjuncts of the same core's WHERE clause.
//! Anything it cannot prove is left unrestricted.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value;

use super::{
  parse::{Node, RelationRef},
  tokenize::Token,
};

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  strum::Display,
  strum::EnumString,
  strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum VirtualRelation {
  StateByVersion,
  StateHistory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum ResolutionPath {
  /// Served from the per-schema cache tables. `None` means unrestricted.
  Cache {
    schema_keys: Option<BTreeSet<String>>,
    version_ids: Option<BTreeSet<String>>,
  },
  /// Computed from the commit graph on every read.
  History { root_commit_id: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationShape {
  pub relation: VirtualRelation,
  pub binding:  String,
  pub path:     ResolutionPath,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryShape {
  pub relations: Vec<RelationShape>,
}

impl QueryShape {
  /// Versions the cache must be fresh for. `None` when no relation reads the
  /// cache, `Some(None)` when every version may be read.
  pub fn cache_scope(&self) -> Option<Option<Vec<String>>> {
    let mut scope: Option<BTreeSet<String>> = Some(BTreeSet::new());
    let mut any = false;
    for shape in &self.relations {
      let ResolutionPath::Cache { version_ids, .. } = &shape.path else {
        continue;
      };
      any = true;
      match (version_ids, scope.as_mut()) {
        (Some(ids), Some(acc)) => acc.extend(ids.iter().cloned()),
        _ => scope = None,
      }
    }
    any.then(|| scope.map(|s| s.into_iter().collect()))
  }
}

/// Replace every terminal virtual relation in `nodes` with a
/// [`Node::Virtual`] and describe it in the returned shape.
pub fn analyze(
  nodes: &mut [Node],
  ctes: &BTreeSet<String>,
  parameters: &[Value],
) -> QueryShape {
  let mut shape = QueryShape::default();
  analyze_level(nodes, ctes, parameters, &mut shape);
  shape
}

pub fn terminal(
  relation: &RelationRef,
  ctes: &BTreeSet<String>,
) -> Option<VirtualRelation> {
  if relation.schema.is_some()
    || ctes.contains(&relation.name.to_ascii_lowercase())
  {
    return None;
  }
  relation.name.parse().ok()
}

fn analyze_level(
  nodes: &mut [Node],
  ctes: &BTreeSet<String>,
  parameters: &[Value],
  shape: &mut QueryShape,
) {
  let mut start = 0;
  for end in core_ends(nodes) {
    let core = &mut nodes[start..end];
    let filters = where_filters(core, parameters);
    for node in core.iter_mut() {
      match node {
        Node::Relation(r) => {
          if let Some(relation) = terminal(r, ctes) {
            let path = resolution_path(relation, r.binding(), &filters);
            let index = shape.relations.len();
            shape.relations.push(RelationShape {
              relation,
              binding: r.binding().to_owned(),
              path,
            });
            *node = Node::Virtual(index);
          }
        }
        Node::Group(inner) => analyze_level(inner, ctes, parameters, shape),
        // View bodies never see the outer statement's CTEs.
        Node::Derived { body, .. } => {
          analyze_level(body, &BTreeSet::new(), parameters, shape);
        }
        Node::Token(_) | Node::Virtual(_) => {}
      }
    }
    start = end;
  }
}

/// Split points between compound-select cores.
fn core_ends(nodes: &[Node]) -> Vec<usize> {
  let mut ends: Vec<usize> = nodes
    .iter()
    .enumerate()
    .filter(|(_, n)| {
      matches!(n, Node::Token(t)
        if t.is_keyword("UNION") || t.is_keyword("INTERSECT")
          || t.is_keyword("EXCEPT"))
    })
    .map(|(i, _)| i)
    .collect();
  ends.push(nodes.len());
  ends
}

// ─── Filters ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct ColumnFilter {
  qualifier: Option<String>,
  column:    String,
  values:    BTreeSet<String>,
}

fn resolution_path(
  relation: VirtualRelation,
  binding: &str,
  filters: &[ColumnFilter],
) -> ResolutionPath {
  let values = |column: &str| -> Option<BTreeSet<String>> {
    filters
      .iter()
      .filter(|f| f.column.eq_ignore_ascii_case(column))
      .filter(|f| {
        f.qualifier
          .as_deref()
          .is_none_or(|q| q.eq_ignore_ascii_case(binding))
      })
      .map(|f| f.values.clone())
      .reduce(|a, b| a.intersection(&b).cloned().collect())
  };
  match relation {
    VirtualRelation::StateByVersion => ResolutionPath::Cache {
      schema_keys: values("schema_key"),
      version_ids: values("version_id"),
    },
    VirtualRelation::StateHistory => ResolutionPath::History {
      root_commit_id: values("root_commit_id")
        .filter(|v| v.len() == 1)
        .and_then(|v| v.into_iter().next()),
    },
  }
}

const WHERE_END: &[&str] =
  &["GROUP", "ORDER", "LIMIT", "HAVING", "WINDOW", "RETURNING"];

fn where_filters(core: &[Node], parameters: &[Value]) -> Vec<ColumnFilter> {
  let is_kw =
    |n: &Node, kw: &str| matches!(n, Node::Token(t) if t.is_keyword(kw));

  let Some(start) = core.iter().position(|n| is_kw(n, "WHERE")) else {
    return Vec::new();
  };
  let clause = &core[start + 1..];
  let end = clause
    .iter()
    .position(|n| WHERE_END.iter().any(|kw| is_kw(n, *kw)))
    .unwrap_or(clause.len());
  let clause = &clause[..end];
  if clause.iter().any(|n| is_kw(n, "OR")) {
    return Vec::new();
  }

  let mut conjuncts = Vec::new();
  let mut current = Vec::new();
  let mut in_between = false;
  for node in clause {
    if is_kw(node, "BETWEEN") {
      in_between = true;
    } else if is_kw(node, "AND") {
      if in_between {
        in_between = false;
      } else {
        conjuncts.push(std::mem::take(&mut current));
        continue;
      }
    }
    current.push(node);
  }
  conjuncts.push(current);

  conjuncts
    .iter()
    .filter_map(|c| conjunct_filter(c, parameters))
    .collect()
}

fn conjunct_filter(
  conjunct: &[&Node],
  parameters: &[Value],
) -> Option<ColumnFilter> {
  if let Some(i) =
    position(conjunct, |t| t.is_symbol("=") || t.is_symbol("=="))
  {
    let (left, right) = (&conjunct[..i], &conjunct[i + 1..]);
    let (column, value) = match (column_ref(left), column_ref(right)) {
      (Some(col), _) => (col, literal(right, parameters)?),
      (None, Some(col)) => (col, literal(left, parameters)?),
      (None, None) => return None,
    };
    return Some(ColumnFilter {
      qualifier: column.0,
      column:    column.1,
      values:    BTreeSet::from([value]),
    });
  }

  if let Some(i) = position(conjunct, |t| t.is_keyword("IN")) {
    let (qualifier, column) = column_ref(&conjunct[..i])?;
    let [Node::Group(list)] = &conjunct[i + 1..] else {
      return None;
    };
    let mut values = BTreeSet::new();
    let comma = |n: &Node| matches!(n, Node::Token(t) if t.is_symbol(","));
    for item in list.split(comma) {
      let item: Vec<&Node> = item.iter().collect();
      values.insert(literal(&item, parameters)?);
    }
    return Some(ColumnFilter { qualifier, column, values });
  }

  None
}

fn position(nodes: &[&Node], pred: impl Fn(&Token) -> bool) -> Option<usize> {
  nodes
    .iter()
    .position(|n| matches!(n, Node::Token(t) if pred(t)))
}

fn ident(node: &Node) -> Option<String> {
  match node {
    Node::Token(t) => t.ident().map(str::to_owned),
    _ => None,
  }
}

/// `column` or `qualifier.column`.
fn column_ref(nodes: &[&Node]) -> Option<(Option<String>, String)> {
  match nodes {
    [col] => Some((None, ident(col)?)),
    [q, Node::Token(dot), col] if dot.is_symbol(".") => {
      Some((Some(ident(q)?), ident(col)?))
    }
    _ => None,
  }
}

/// A single string, number or bound parameter, as text.
fn literal(nodes: &[&Node], parameters: &[Value]) -> Option<String> {
  let [Node::Token(token)] = nodes else { return None };
  match token {
    Token::Str(s) | Token::Number(s) => Some(s.clone()),
    Token::Param { index, .. } => {
      match parameters.get(index.checked_sub(1)?)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
      }
    }
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::preprocess::{parse::parse, tokenize::tokenize};

  fn shape(sql: &str, parameters: &[Value]) -> QueryShape {
    let mut statement = parse(tokenize(sql).unwrap()).unwrap();
    analyze(&mut statement.nodes, &statement.ctes, parameters)
  }

  fn keys(values: &[&str]) -> Option<BTreeSet<String>> {
    Some(values.iter().map(|v| v.to_string()).collect())
  }

  #[test]
  fn equality_and_in_filters_restrict_the_cache_path() {
    let s = shape(
      "SELECT * FROM state_by_version s WHERE s.schema_key = 'todo' \
       AND version_id IN ('a', ?1) AND entity_id = 'x'",
      &[json!("b")],
    );
    assert_eq!(s.relations.len(), 1);
    assert_eq!(s.relations[0].binding, "s");
    assert_eq!(s.relations[0].path, ResolutionPath::Cache {
      schema_keys: keys(&["todo"]),
      version_ids: keys(&["a", "b"]),
    });
    assert_eq!(s.cache_scope(), Some(Some(vec!["a".into(), "b".into()])));
  }

  #[test]
  fn disjunctions_and_foreign_qualifiers_do_not_restrict() {
    let s = shape(
      "SELECT * FROM state_by_version WHERE schema_key = 'a' OR schema_key = 'b'",
      &[],
    );
    assert_eq!(s.relations[0].path, ResolutionPath::Cache {
      schema_keys: None,
      version_ids: None,
    });
    assert_eq!(s.cache_scope(), Some(None));

    let s = shape(
      "SELECT * FROM state_by_version v WHERE other.version_id = 'x'",
      &[],
    );
    assert_eq!(s.relations[0].path, ResolutionPath::Cache {
      schema_keys: None,
      version_ids: None,
    });
  }

  #[test]
  fn history_path_picks_up_the_root_commit() {
    let s = shape(
      "SELECT * FROM state_history WHERE root_commit_id = :root \
       AND depth BETWEEN 0 AND 3",
      &[json!("c1")],
    );
    assert_eq!(s.relations[0].path, ResolutionPath::History {
      root_commit_id: Some("c1".into()),
    });
    assert_eq!(s.cache_scope(), None);
  }

  #[test]
  fn cte_names_shadow_virtual_relations() {
    let s = shape(
      "WITH state_by_version AS (SELECT 1) SELECT * FROM state_by_version",
      &[],
    );
    assert!(s.relations.is_empty());
  }

  #[test]
  fn each_compound_core_has_its_own_filters() {
    let s = shape(
      "SELECT entity_id FROM state_by_version WHERE version_id = 'a' \
       UNION ALL SELECT entity_id FROM state_by_version",
      &[],
    );
    assert_eq!(s.relations.len(), 2);
    assert_eq!(s.cache_scope(), Some(None));
  }
}
