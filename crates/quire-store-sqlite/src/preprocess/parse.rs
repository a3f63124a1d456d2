//! Parenthesis tree with annotated relation references.

use std::collections::BTreeSet;

use super::tokenize::Token;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
  Token(Token),
  /// `( ... )`
  Group(Vec<Node>),
  /// A table reference in FROM, JOIN, INTO or UPDATE position.
  Relation(RelationRef),
  /// An expanded view: `( body ) AS alias`.
  Derived { body: Vec<Node>, alias: String },
  /// A terminal virtual relation, indexing into the analyzed shape.
  Virtual(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationRef {
  pub schema: Option<String>,
  pub name:   String,
  pub alias:  Option<String>,
}

impl RelationRef {
  /// The name the rest of the statement refers to this relation by.
  pub fn binding(&self) -> &str { self.alias.as_deref().unwrap_or(&self.name) }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
  pub nodes:    Vec<Node>,
  /// Lower-cased names of common table expressions.
  pub ctes:     BTreeSet<String>,
  /// Upper-cased leading keyword after any WITH clause.
  pub leading:  String,
}

impl Statement {
  pub fn is_query(&self) -> bool {
    matches!(self.leading.as_str(), "SELECT" | "VALUES")
  }
}

/// Words that end a table reference instead of aliasing it.
const RESERVED: &[&str] = &[
  "AS", "CROSS", "DEFAULT", "EXCEPT", "FROM", "FULL", "GROUP", "HAVING",
  "INDEXED", "INNER", "INTERSECT", "JOIN", "LEFT", "LIMIT", "NATURAL", "NOT",
  "OFFSET", "ON", "ORDER", "OUTER", "RETURNING", "RIGHT", "SELECT", "SET",
  "UNION", "USING", "VALUES", "WHERE", "WINDOW",
];

/// Words that close a FROM clause.
const CLAUSE_END: &[&str] = &[
  "EXCEPT", "GROUP", "HAVING", "INTERSECT", "LIMIT", "ON", "ORDER",
  "RETURNING", "SELECT", "SET", "UNION", "USING", "VALUES", "WHERE", "WINDOW",
];

fn is_reserved(token: &Token) -> bool {
  RESERVED.iter().any(|k| token.is_keyword(k))
}

pub fn parse(mut tokens: Vec<Token>) -> Result<Statement> {
  while tokens.last().is_some_and(|t| t.is_symbol(";")) {
    tokens.pop();
  }
  if tokens.iter().any(|t| t.is_symbol(";")) {
    return Err(Error::SqlParse(
      "multiple statements are not supported".into(),
    ));
  }
  if tokens.is_empty() {
    return Err(Error::SqlParse("empty statement".into()));
  }

  let nodes = annotate(group(tokens)?, true);
  let (ctes, body_start) = cte_names(&nodes);
  let leading = nodes[body_start..]
    .iter()
    .find_map(|n| match n {
      Node::Token(Token::Word(w)) => Some(w.to_ascii_uppercase()),
      _ => None,
    })
    .unwrap_or_default();

  Ok(Statement { nodes, ctes, leading })
}

fn group(tokens: Vec<Token>) -> Result<Vec<Node>> {
  let mut stack: Vec<Vec<Node>> = vec![Vec::new()];
  for token in tokens {
    if token.is_symbol("(") {
      stack.push(Vec::new());
    } else if token.is_symbol(")") {
      let inner = stack
        .pop()
        .filter(|_| !stack.is_empty())
        .ok_or_else(|| Error::SqlParse("unbalanced ')'".into()))?;
      if let Some(parent) = stack.last_mut() {
        parent.push(Node::Group(inner));
      }
    } else if let Some(current) = stack.last_mut() {
      current.push(Node::Token(token));
    }
  }
  match stack.pop() {
    Some(top) if stack.is_empty() => Ok(top),
    _ => Err(Error::SqlParse("unbalanced '('".into())),
  }
}

/// Replace table references with [`Node::Relation`] at this level and in
/// every nested group.
fn annotate(nodes: Vec<Node>, statement_start: bool) -> Vec<Node> {
  let nodes: Vec<Node> = nodes
    .into_iter()
    .map(|n| match n {
      Node::Group(inner) => Node::Group(annotate(inner, false)),
      other => other,
    })
    .collect();

  let mut out = Vec::with_capacity(nodes.len());
  let mut expect = false;
  let mut target = false;
  let mut in_from = false;
  let mut i = 0;
  while i < nodes.len() {
    let node = &nodes[i];
    let Node::Token(token) = node else {
      expect = false;
      out.push(node.clone());
      i += 1;
      continue;
    };

    if expect
      && token.ident().is_some()
      && !is_reserved(token)
      && let Some((relation, next)) = relation_at(&nodes, i, target)
    {
      out.push(Node::Relation(relation));
      expect = false;
      i = next;
      continue;
    }
    expect = false;
    target = false;

    if token.is_keyword("FROM") || token.is_keyword("JOIN") {
      expect = true;
      in_from = true;
    } else if token.is_keyword("INTO")
      || (token.is_keyword("UPDATE") && statement_start && out.is_empty())
    {
      expect = true;
      target = true;
    } else if token.is_symbol(",") && in_from {
      expect = true;
    } else if CLAUSE_END.iter().any(|k| token.is_keyword(k)) {
      in_from = false;
    }
    out.push(node.clone());
    i += 1;
  }
  out
}

/// Read `[schema .] name [[AS] alias]` starting at `start`. Returns `None`
/// for a table-valued function call. A write `target` may be followed by a
/// column list instead.
fn relation_at(
  nodes: &[Node],
  start: usize,
  target: bool,
) -> Option<(RelationRef, usize)> {
  let ident = |i: usize| match nodes.get(i) {
    Some(Node::Token(t)) => t.ident().map(str::to_owned),
    _ => None,
  };
  let token = |i: usize| match nodes.get(i) {
    Some(Node::Token(t)) => Some(t),
    _ => None,
  };

  let mut name = ident(start)?;
  let mut schema = None;
  let mut i = start + 1;
  if token(i).is_some_and(|t| t.is_symbol(".")) {
    schema = Some(name);
    name = ident(i + 1)?;
    i += 2;
  }
  if matches!(nodes.get(i), Some(Node::Group(_))) {
    return target.then_some((RelationRef { schema, name, alias: None }, i));
  }

  let mut alias = None;
  if token(i).is_some_and(|t| t.is_keyword("AS")) {
    alias = ident(i + 1);
    i += 2;
  } else if let Some(t) = token(i)
    && t.ident().is_some()
    && !is_reserved(t)
  {
    alias = ident(i);
    i += 1;
  }
  Some((RelationRef { schema, name, alias }, i))
}

/// Names bound by a leading WITH clause, and the index where the statement
/// body starts.
fn cte_names(nodes: &[Node]) -> (BTreeSet<String>, usize) {
  let mut names = BTreeSet::new();
  let is_kw = |i: usize, kw: &str| {
    matches!(nodes.get(i), Some(Node::Token(t)) if t.is_keyword(kw))
  };
  if !is_kw(0, "WITH") {
    return (names, 0);
  }
  let mut i = 1;
  if is_kw(i, "RECURSIVE") {
    i += 1;
  }
  loop {
    let Some(Node::Token(t)) = nodes.get(i) else { break };
    let Some(name) = t.ident() else { break };
    names.insert(name.to_ascii_lowercase());
    i += 1;
    if matches!(nodes.get(i), Some(Node::Group(_))) {
      i += 1;
    }
    if !is_kw(i, "AS") {
      break;
    }
    i += 1;
    if is_kw(i, "NOT") {
      i += 1;
    }
    if is_kw(i, "MATERIALIZED") {
      i += 1;
    }
    if !matches!(nodes.get(i), Some(Node::Group(_))) {
      break;
    }
    i += 1;
    if matches!(nodes.get(i), Some(Node::Token(t)) if t.is_symbol(",")) {
      i += 1;
    } else {
      break;
    }
  }
  (names, i)
}

// ─── Rendering ───────────────────────────────────────────────────────────────

pub fn quote_ident(ident: &str) -> String {
  format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn quote_literal(text: &str) -> String {
  format!("'{}'", text.replace('\'', "''"))
}

/// Render nodes back to SQL. `virtual_sql` supplies the text for
/// [`Node::Virtual`] entries.
pub fn render_with(
  nodes: &[Node],
  virtual_sql: &dyn Fn(usize) -> String,
) -> String {
  let mut out = String::new();
  let mut after_dot = false;
  for node in nodes {
    let piece = match node {
      Node::Token(t) => t.to_string(),
      Node::Group(inner) => format!("({})", render_with(inner, virtual_sql)),
      Node::Relation(r) => {
        let mut s = match &r.schema {
          Some(schema) => {
            format!("{}.{}", quote_ident(schema), quote_ident(&r.name))
          }
          None => quote_ident(&r.name),
        };
        if let Some(alias) = &r.alias {
          s.push_str(" AS ");
          s.push_str(&quote_ident(alias));
        }
        s
      }
      Node::Derived { body, alias } => format!(
        "({}) AS {}",
        render_with(body, virtual_sql),
        quote_ident(alias)
      ),
      Node::Virtual(index) => virtual_sql(*index),
    };
    let tight = matches!(
      node,
      Node::Token(t) if t.is_symbol(",") || t.is_symbol(".")
    );
    if !out.is_empty() && !after_dot && !tight {
      out.push(' ');
    }
    after_dot = matches!(node, Node::Token(t) if t.is_symbol("."));
    out.push_str(&piece);
  }
  out
}

pub fn render(nodes: &[Node]) -> String {
  render_with(nodes, &|i| format!("<virtual {i}>"))
}

/// Visit every relation reference, descending into groups and derived
/// bodies.
pub fn for_each_relation(nodes: &[Node], f: &mut dyn FnMut(&RelationRef)) {
  for node in nodes {
    match node {
      Node::Relation(r) => f(r),
      Node::Group(inner) | Node::Derived { body: inner, .. } => {
        for_each_relation(inner, f)
      }
      Node::Token(_) | Node::Virtual(_) => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::preprocess::tokenize::tokenize;

  fn statement(sql: &str) -> Statement { parse(tokenize(sql).unwrap()).unwrap() }

  fn relations(sql: &str) -> Vec<RelationRef> {
    let mut found = Vec::new();
    for_each_relation(&statement(sql).nodes, &mut |r| found.push(r.clone()));
    found
  }

  #[test]
  fn annotates_from_and_join_targets() {
    let found = relations(
      "SELECT * FROM a AS x JOIN main.b y ON x.id = y.id, c WHERE x.n IN \
       (SELECT n FROM d)",
    );
    let names: Vec<_> = found
      .iter()
      .map(|r| (r.schema.as_deref(), r.name.as_str(), r.binding()))
      .collect();
    assert_eq!(names, vec![
      (None, "a", "x"),
      (Some("main"), "b", "y"),
      (None, "c", "c"),
      (None, "d", "d"),
    ]);
  }

  #[test]
  fn table_functions_and_subqueries_are_not_relations() {
    let found = relations("SELECT * FROM json_each('[1]') j, (SELECT 1) s");
    assert!(found.is_empty());
  }

  #[test]
  fn collects_cte_names_and_leading_keyword() {
    let s = statement(
      "WITH RECURSIVE walk(id) AS (SELECT 1), Other AS (SELECT 2) \
       SELECT * FROM walk",
    );
    assert_eq!(
      s.ctes,
      ["other", "walk"].into_iter().map(String::from).collect()
    );
    assert!(s.is_query());

    let s = statement("INSERT INTO t (a) VALUES (1)");
    assert_eq!(s.leading, "INSERT");
    assert!(!s.is_query());
  }

  #[test]
  fn rejects_multiple_statements_and_unbalanced_groups() {
    assert!(parse(tokenize("SELECT 1; SELECT 2").unwrap()).is_err());
    assert!(parse(tokenize("SELECT (1").unwrap()).is_err());
    assert!(parse(tokenize("SELECT 1)").unwrap()).is_err());
    assert!(parse(tokenize("SELECT 1;").unwrap()).is_ok());
  }

  #[test]
  fn renders_valid_sql() {
    let s = statement("select count(*) from t as x where x.a in (1, 2)");
    assert_eq!(
      render(&s.nodes),
      "select count (*) from \"t\" AS \"x\" where x.a in (1, 2)"
    );
  }
}
