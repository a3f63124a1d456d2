use std::collections::BTreeSet;

use quire_core::{
  commit::Traversal,
  state::{NewState, StateAddress},
  version::NewVersion,
};
use serde_json::json;

use super::{engine, main_id, todo_engine};
use crate::Error;

fn todo(id: &str, title: &str) -> NewState {
  NewState::new("todo", json!({ "id": id, "title": title }))
}

// ─── Commit graph ────────────────────────────────────────────────────────────

#[tokio::test]
async fn each_write_commits_on_top_of_the_tip() {
  let e = todo_engine().await;
  let root = e.active_version().await.unwrap().commit_id;

  let first = e.insert_state(todo("t1", "A")).await.unwrap();
  let first = first.commit_id.unwrap();
  let second = e.insert_state(todo("t1", "B")).await.unwrap();
  let second = second.commit_id.unwrap();
  assert_eq!(e.active_version().await.unwrap().commit_id, second);

  let parents = e
    .ancestors_of(second.clone(), Traversal::depth(1))
    .await
    .unwrap();
  assert_eq!(parents, BTreeSet::from([first.clone()]));

  let with_self = e
    .ancestors_of(second.clone(), Traversal::depth(1).including_self())
    .await
    .unwrap();
  assert_eq!(with_self, BTreeSet::from([first.clone(), second.clone()]));

  let all = e
    .ancestors_of(second.clone(), Traversal::default())
    .await
    .unwrap();
  assert_eq!(all, BTreeSet::from([root.clone(), first.clone()]));

  let descendants = e
    .descendants_of(root.clone(), Traversal::default())
    .await
    .unwrap();
  assert_eq!(descendants, BTreeSet::from([first.clone(), second.clone()]));

  let depths = e.ancestry_depths(second.clone()).await.unwrap();
  assert_eq!(depths, vec![(second, 0), (first, 1), (root, 2)]);
}

#[tokio::test]
async fn unknown_commits_are_not_found() {
  let e = engine().await;
  let err = e
    .ancestors_of("missing", Traversal::default())
    .await
    .unwrap_err();
  assert!(matches!(err, Error::CommitNotFound(_)), "{err:?}");
}

#[tokio::test]
async fn commits_record_their_parents() {
  let e = todo_engine().await;
  let root = e.active_version().await.unwrap().commit_id;
  let row = e.insert_state(todo("t1", "A")).await.unwrap();

  let commit = e.commit(row.commit_id.unwrap()).await.unwrap();
  assert_eq!(commit.parent_commit_ids, vec![root]);
  let change = e.change(row.change_id.unwrap()).await.unwrap().unwrap();
  assert_eq!(change.entity_id, "t1");
  assert_eq!(change.schema_key, "todo");
}

// ─── Versions ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn new_versions_branch_from_the_active_tip() {
  let e = todo_engine().await;
  let main = main_id(&e).await;
  e.insert_state(todo("t1", "A")).await.unwrap();
  let tip = e.active_version().await.unwrap().commit_id;

  let feature = e.create_version(NewVersion::named("feature")).await.unwrap();
  assert_eq!(feature.name, "feature");
  assert_eq!(feature.commit_id, tip);
  assert_eq!(main_id(&e).await, main);

  e.insert_state(todo("t1", "B").in_version(&feature.id))
    .await
    .unwrap();
  let in_main = e
    .read(StateAddress::own("t1", "todo", &main))
    .await
    .unwrap()
    .unwrap();
  let in_feature = e
    .read(StateAddress::own("t1", "todo", &feature.id))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(in_main.snapshot_content["title"], "A");
  assert_eq!(in_feature.snapshot_content["title"], "B");

  e.switch_version(feature.id.clone()).await.unwrap();
  assert_eq!(main_id(&e).await, feature.id);
}

#[tokio::test]
async fn checkout_restores_an_old_commit() {
  let e = todo_engine().await;
  let first = e.insert_state(todo("t1", "A")).await.unwrap();
  e.insert_state(todo("t1", "B")).await.unwrap();

  let old = e.checkout(first.commit_id.unwrap()).await.unwrap();
  assert_eq!(main_id(&e).await, old.id);
  let row = e
    .read(StateAddress::own("t1", "todo", &old.id))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(row.snapshot_content["title"], "A");
}

#[tokio::test]
async fn pointer_updates_are_idempotent() {
  let e = todo_engine().await;
  let main = main_id(&e).await;
  let row = e.insert_state(todo("t1", "A")).await.unwrap();
  let change_id = row.change_id.unwrap();

  for _ in 0..2 {
    e.update_pointers(main.clone(), vec![change_id.clone()])
      .await
      .unwrap();
  }
  let pointers = e
    .transaction(move |txn| txn.pointers(&main))
    .await
    .unwrap();
  let ids: Vec<&str> = pointers
    .iter()
    .filter(|c| c.entity_id == "t1")
    .map(|c| c.id.as_str())
    .collect();
  assert_eq!(ids, vec![change_id.as_str()]);
}

// ─── Sequence ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn sequence_numbers_advance_by_one() {
  let e = engine().await;
  let first = e.next_sequence_number().await.unwrap();
  let second = e.next_sequence_number().await.unwrap();
  assert_eq!(second, first + 1);
}

#[tokio::test]
async fn deterministic_engines_agree() {
  let (a, b) = (todo_engine().await, todo_engine().await);
  let ra = a.insert_state(todo("t1", "A")).await.unwrap();
  let rb = b.insert_state(todo("t1", "A")).await.unwrap();
  assert_eq!(main_id(&a).await, main_id(&b).await);
  assert_eq!(ra.commit_id, rb.commit_id);
  assert_eq!(ra.change_id, rb.change_id);
  assert_eq!(
    a.deterministic_id().await.unwrap(),
    b.deterministic_id().await.unwrap()
  );
}

#[tokio::test]
async fn sequence_requires_deterministic_mode() {
  let e = crate::Engine::open_in_memory().await.unwrap();
  let err = e.next_sequence_number().await.unwrap_err();
  assert!(matches!(err, Error::DeterministicModeDisabled), "{err:?}");
}

// ─── Maintenance ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn gc_keeps_referenced_snapshots() {
  let e = todo_engine().await;
  let main = main_id(&e).await;
  e.insert_state(todo("t1", "A")).await.unwrap();
  e.transaction(|txn| {
    txn.connection().execute(
      "INSERT INTO snapshot (id, content) VALUES ('orphan', '{}')",
      [],
    )?;
    Ok(())
  })
  .await
  .unwrap();

  assert_eq!(e.gc_snapshots().await.unwrap(), 1);
  assert_eq!(e.gc_snapshots().await.unwrap(), 0);
  let row = e.read(StateAddress::own("t1", "todo", main)).await.unwrap();
  assert_eq!(row.unwrap().snapshot_content["title"], "A");
}
