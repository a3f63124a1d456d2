use std::sync::{Arc, Mutex};

use quire_core::{hooks::StateCommitRow, state::NewState};
use serde_json::json;

use super::todo_engine;
use crate::Error;

fn todo(id: &str) -> NewState {
  NewState::new("todo", json!({ "id": id, "title": id }))
}

fn recorder() -> (
  Arc<Mutex<Vec<StateCommitRow>>>,
  impl Fn(&[StateCommitRow]) + Send + Sync + 'static,
) {
  let seen = Arc::new(Mutex::new(Vec::new()));
  let sink = seen.clone();
  (seen, move |rows: &[StateCommitRow]| {
    sink.lock().unwrap().extend_from_slice(rows)
  })
}

#[tokio::test]
async fn subscribers_see_committed_rows_with_their_writer() {
  let e = todo_engine().await;
  let (seen, handler) = recorder();
  let _sub = e.on_state_commit(handler);

  e.insert_state(todo("t1")).await.unwrap();
  e.with_writer_key("sync", |txn| txn.insert_state(todo("t2")))
    .await
    .unwrap();

  let seen = seen.lock().unwrap();
  let rows: Vec<(&str, Option<&str>)> = seen
    .iter()
    .filter(|r| r.schema_key == "todo")
    .map(|r| (r.entity_id.as_str(), r.writer_key.as_deref()))
    .collect();
  assert_eq!(rows, vec![("t1", None), ("t2", Some("sync"))]);
  assert!(seen.iter().all(|r| r.commit_id.is_some()));
}

#[tokio::test]
async fn rolled_back_work_emits_nothing() {
  let e = todo_engine().await;
  let (seen, handler) = recorder();
  let _sub = e.on_state_commit(handler);

  let result = e
    .transaction(|txn| {
      txn.insert_state(todo("t1"))?;
      Err::<(), _>(Error::DeterministicModeDisabled)
    })
    .await;
  assert!(result.is_err());
  assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unsubscribed_handlers_stop_receiving() {
  let e = todo_engine().await;
  // The engine keeps one subscriber of its own.
  let baseline = e.hooks().subscriber_count();

  let (seen, handler) = recorder();
  let sub = e.on_state_commit(handler);
  assert_eq!(e.hooks().subscriber_count(), baseline + 1);

  e.insert_state(todo("t1")).await.unwrap();
  sub.unsubscribe();
  assert_eq!(e.hooks().subscriber_count(), baseline);
  e.insert_state(todo("t2")).await.unwrap();

  let seen = seen.lock().unwrap();
  assert_eq!(seen.len(), 1);
  assert_eq!(seen[0].entity_id, "t1");
}

#[tokio::test]
async fn untracked_writes_are_announced_without_a_commit() {
  let e = todo_engine().await;
  let (seen, handler) = recorder();
  let _sub = e.on_state_commit(handler);

  e.insert_state(todo("t1").untracked()).await.unwrap();

  let seen = seen.lock().unwrap();
  assert_eq!(seen.len(), 1);
  assert!(seen[0].untracked);
  assert_eq!(seen[0].commit_id, None);
}
