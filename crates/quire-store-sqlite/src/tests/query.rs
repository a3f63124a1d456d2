use quire_core::{state::NewState, version::NewVersion};
use serde_json::json;

use super::{main_id, todo_engine};
use crate::{
  Error,
  preprocess::{PreprocessRequest, TraceStep},
};

async fn seeded() -> crate::Engine {
  let e = todo_engine().await;
  for (id, title) in [("t1", "Write"), ("t2", "Test"), ("t3", "Ship")] {
    e.insert_state(NewState::new("todo", json!({ "id": id, "title": title })))
      .await
      .unwrap();
  }
  e
}

#[tokio::test]
async fn schema_views_read_current_state() {
  let e = seeded().await;
  let result = e
    .query("SELECT id, title FROM todo ORDER BY id", vec![])
    .await
    .unwrap();
  assert_eq!(result.columns, vec!["id", "title"]);
  assert_eq!(result.rows, vec![
    vec![json!("t1"), json!("Write")],
    vec![json!("t2"), json!("Test")],
    vec![json!("t3"), json!("Ship")],
  ]);
}

#[tokio::test]
async fn parameters_bind_positionally() {
  let e = seeded().await;
  let result = e
    .query("SELECT title FROM todo WHERE id = ?", vec![json!("t2")])
    .await
    .unwrap();
  assert_eq!(result.rows, vec![vec![json!("Test")]]);
}

#[tokio::test]
async fn by_version_views_span_versions() {
  let e = seeded().await;
  let main = main_id(&e).await;
  let feature = e.create_version(NewVersion::named("feature")).await.unwrap();
  e.insert_state(
    NewState::new("todo", json!({ "id": "t4", "title": "Branch" }))
      .in_version(&feature.id),
  )
  .await
  .unwrap();

  let count = |version: String| {
    let e = e.clone();
    async move {
      e.query(
        "SELECT count(*) FROM todo_by_version WHERE _version_id = ?",
        vec![json!(version)],
      )
      .await
      .unwrap()
      .rows[0][0]
        .clone()
    }
  };
  assert_eq!(count(main).await, json!(3));
  assert_eq!(count(feature.id).await, json!(4));
}

#[tokio::test]
async fn plain_sql_passes_through() {
  let e = seeded().await;
  let result = e
    .query("SELECT count(*) FROM change WHERE schema_key = 'todo'", vec![])
    .await
    .unwrap();
  assert_eq!(result.rows, vec![vec![json!(3)]]);
}

#[tokio::test]
async fn writes_through_views_are_unsupported() {
  let e = seeded().await;
  let err = e
    .query("UPDATE todo SET title = 'x'", vec![])
    .await
    .unwrap_err();
  assert!(matches!(err, Error::UnsupportedStatement { .. }), "{err:?}");
}

#[tokio::test]
async fn traced_preprocessing_refreshes_the_cache() {
  let e = seeded().await;
  let output = e
    .preprocess(PreprocessRequest::new("SELECT * FROM state").traced())
    .await
    .unwrap();
  let steps: Vec<TraceStep> =
    output.trace.unwrap().iter().map(|t| t.step).collect();
  assert!(steps.contains(&TraceStep::EnsureFresh));
  assert_eq!(steps.last(), Some(&TraceStep::Emit));

  e.ensure_fresh(None).await.unwrap();
  let again = e.ensure_fresh(None).await.unwrap();
  assert!(again.refreshed.is_empty());
}
