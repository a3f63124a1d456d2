//! SQL query preprocessor.
//!
//! Callers query the virtual relations `state`, `state_by_version`,
//! `state_history` and one view pair per schema (`<key>` and
//! `<key>_by_version`) as if they were tables. The preprocessor expands the
//! views, works out which cache tables and versions a statement can touch,
//! and emits plain SQL over the cache tables and the commit graph.
//!
//! The pipeline is split in two: [`prepare`] runs everything up to analysis,
//! and [`Prepared::emit`] renders the final statement once the caller has
//! refreshed the cache scopes the analysis asked for.

mod context;
mod emit;
mod parse;
mod shape;
mod tokenize;

use std::collections::BTreeSet;

pub use context::{PreprocessorContext, ViewDef, compare_versions};
use parse::{Node, Statement};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
pub use shape::{QueryShape, RelationShape, ResolutionPath, VirtualRelation};

use crate::{Error, Result};

/// Maximum nesting of view expansions.
pub const VIEW_EXPANSION_LIMIT: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessRequest {
  pub sql:        String,
  #[serde(default)]
  pub parameters: Vec<Value>,
  #[serde(default)]
  pub trace:      bool,
}

impl PreprocessRequest {
  pub fn new(sql: impl Into<String>) -> Self {
    Self { sql: sql.into(), ..Self::default() }
  }

  pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
    self.parameters = parameters;
    self
  }

  pub fn traced(mut self) -> Self {
    self.trace = true;
    self
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreprocessOutput {
  pub sql:        String,
  /// The request's parameters, untouched.
  pub parameters: Vec<Value>,
  pub shape:      QueryShape,
  pub trace:      Option<Vec<TraceEntry>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TraceStep {
  Tokenize,
  Parse,
  Detect,
  ExpandViews,
  Analyze,
  EnsureFresh,
  Emit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
  pub step:   TraceStep,
  pub detail: Value,
}

/// A statement analyzed against one context, waiting to be emitted.
#[derive(Debug)]
pub struct Prepared {
  original:   String,
  /// `None` when the statement reads no virtual relation.
  statement:  Option<Statement>,
  shape:      QueryShape,
  parameters: Vec<Value>,
  trace:      Option<Vec<TraceEntry>>,
}

impl Prepared {
  pub fn shape(&self) -> &QueryShape { &self.shape }

  pub fn record(&mut self, step: TraceStep, detail: impl FnOnce() -> Value) {
    if let Some(trace) = self.trace.as_mut() {
      trace.push(TraceEntry { step, detail: detail() });
    }
  }

  /// Render the final SQL against `ctx`'s cache tables.
  pub fn emit(
    mut self,
    ctx: &PreprocessorContext,
    depth_limit: usize,
  ) -> PreprocessOutput {
    let sql = match &self.statement {
      None => self.original.clone(),
      Some(statement) => {
        let relations = &self.shape.relations;
        parse::render_with(&statement.nodes, &|i| {
          emit::relation_sql(&relations[i], &ctx.cache_tables, depth_limit)
        })
      }
    };
    self.record(TraceStep::Emit, || json!({ "sql": sql }));
    tracing::trace!(%sql, "emitted statement");
    PreprocessOutput {
      sql,
      parameters: self.parameters,
      shape: self.shape,
      trace: self.trace,
    }
  }
}

/// Tokenize, parse, detect, expand and analyze `request`.
pub fn prepare(
  ctx: &PreprocessorContext,
  active_version_id: &str,
  request: PreprocessRequest,
) -> Result<Prepared> {
  let PreprocessRequest { sql, parameters, trace } = request;
  let mut prepared = Prepared {
    original: sql,
    statement: None,
    shape: QueryShape::default(),
    parameters,
    trace: trace.then(Vec::new),
  };

  let tokens = tokenize::tokenize(&prepared.original)?;
  let token_count = tokens.len();
  prepared.record(TraceStep::Tokenize, || json!({ "tokens": token_count }));

  let mut statement = parse::parse(tokens)?;
  prepared.record(TraceStep::Parse, || {
    json!({ "leading": statement.leading, "ctes": statement.ctes })
  });

  let touched = virtual_names(&statement, ctx);
  prepared.record(TraceStep::Detect, || json!({ "relations": touched }));
  if touched.is_empty() {
    return Ok(prepared);
  }
  if !statement.is_query() {
    return Err(Error::UnsupportedStatement {
      relation: touched.into_iter().next().unwrap_or_default(),
    });
  }

  expand(&mut statement.nodes, ctx, active_version_id, &statement.ctes, 0)?;
  prepared.record(TraceStep::ExpandViews, || {
    json!({ "sql": parse::render(&statement.nodes) })
  });

  prepared.shape = shape::analyze(
    &mut statement.nodes,
    &statement.ctes,
    &prepared.parameters,
  );
  let shape_detail = serde_json::to_value(&prepared.shape)?;
  prepared.record(TraceStep::Analyze, || shape_detail);

  prepared.statement = Some(statement);
  Ok(prepared)
}

/// Names of the virtual relations and views a statement references.
fn virtual_names(
  statement: &Statement,
  ctx: &PreprocessorContext,
) -> Vec<String> {
  let mut found = Vec::new();
  parse::for_each_relation(&statement.nodes, &mut |r| {
    let shadowed = r.schema.is_some()
      || statement.ctes.contains(&r.name.to_ascii_lowercase());
    let is_virtual = shape::terminal(r, &statement.ctes).is_some()
      || ctx.view(&r.name).is_some();
    if !shadowed && is_virtual && !found.contains(&r.name) {
      found.push(r.name.clone());
    }
  });
  found
}

fn expand(
  nodes: &mut [Node],
  ctx: &PreprocessorContext,
  active_version_id: &str,
  ctes: &BTreeSet<String>,
  depth: usize,
) -> Result<()> {
  for node in nodes.iter_mut() {
    match node {
      Node::Group(inner) => {
        expand(inner, ctx, active_version_id, ctes, depth)?;
      }
      Node::Derived { body, .. } => {
        expand(body, ctx, active_version_id, &BTreeSet::new(), depth)?;
      }
      Node::Relation(r) => {
        if r.schema.is_some()
          || ctes.contains(&r.name.to_ascii_lowercase())
          || shape::terminal(r, ctes).is_some()
        {
          continue;
        }
        let Some(view) = ctx.view(&r.name) else { continue };
        if depth >= VIEW_EXPANSION_LIMIT {
          return Err(Error::SqlParse(format!(
            "view expansion deeper than {VIEW_EXPANSION_LIMIT} at {}",
            r.name
          )));
        }
        let mut body =
          parse::parse(tokenize::tokenize(&view.sql(active_version_id))?)?
            .nodes;
        let none = BTreeSet::new();
        expand(&mut body, ctx, active_version_id, &none, depth + 1)?;
        let alias = r.binding().to_owned();
        *node = Node::Derived { body, alias };
      }
      Node::Token(_) | Node::Virtual(_) => {}
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use quire_core::schema::SchemaDefinition;

  use super::*;

  fn context() -> PreprocessorContext {
    let mut ctx = PreprocessorContext::default();
    ctx.add_schema(
      SchemaDefinition::parse(json!({
        "type": "object",
        "x-lix-key": "todo",
        "x-lix-version": "1.0",
        "x-lix-primary-key": ["id"],
        "properties": {
          "id": { "type": "string" },
          "title": { "type": "string" }
        }
      }))
      .unwrap(),
    );
    ctx.cache_tables =
      BTreeMap::from([("todo".to_owned(), "state_cache_todo".to_owned())]);
    ctx.build_views();
    ctx
  }

  fn run(sql: &str) -> PreprocessOutput {
    prepare(&context(), "v1", PreprocessRequest::new(sql).traced())
      .unwrap()
      .emit(&context(), 32)
  }

  #[test]
  fn plain_statements_pass_through() {
    let out = run("SELECT * FROM change WHERE id = ?");
    assert_eq!(out.sql, "SELECT * FROM change WHERE id = ?");
    assert!(out.shape.relations.is_empty());
  }

  #[test]
  fn schema_views_resolve_through_the_cache() {
    let out = run("SELECT title FROM todo WHERE id = 'a'");
    assert_eq!(out.shape.relations.len(), 1);
    assert_eq!(out.shape.relations[0].path, ResolutionPath::Cache {
      schema_keys: Some(BTreeSet::from(["todo".to_owned()])),
      version_ids: Some(BTreeSet::from(["v1".to_owned()])),
    });
    assert!(out.sql.contains("FROM \"state_cache_todo\""));
    assert!(out.sql.contains(") AS \"todo\""));
    assert!(!out.sql.contains("FROM state_by_version"));
  }

  #[test]
  fn state_expands_to_the_active_version() {
    let out = run("SELECT count(*) FROM state");
    assert_eq!(out.shape.cache_scope(), Some(Some(vec!["v1".to_owned()])));
  }

  #[test]
  fn trace_records_every_step_in_order() {
    let out = run("SELECT * FROM state_by_version");
    let steps: Vec<TraceStep> =
      out.trace.unwrap().iter().map(|e| e.step).collect();
    assert_eq!(steps, vec![
      TraceStep::Tokenize,
      TraceStep::Parse,
      TraceStep::Detect,
      TraceStep::ExpandViews,
      TraceStep::Analyze,
      TraceStep::Emit,
    ]);
  }

  #[test]
  fn writes_to_virtual_relations_are_rejected() {
    for sql in [
      "INSERT INTO state_by_version (entity_id) VALUES ('x')",
      "UPDATE todo SET title = 'x'",
      "DELETE FROM state WHERE 1",
    ] {
      let err = prepare(&context(), "v1", PreprocessRequest::new(sql));
      assert!(
        matches!(err, Err(Error::UnsupportedStatement { .. })),
        "{sql}: {err:?}"
      );
    }
  }
}
