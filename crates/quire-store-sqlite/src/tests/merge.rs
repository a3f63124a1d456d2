use quire_core::{
  state::{NewState, StateAddress},
  version::NewVersion,
};
use serde_json::json;

use super::{main_id, todo_engine};
use crate::Error;

fn todo(id: &str, title: &str) -> NewState {
  NewState::new("todo", json!({ "id": id, "title": title }))
}

async fn title(engine: &crate::Engine, id: &str, version: &str) -> String {
  let row = engine
    .read(StateAddress::own(id, "todo", version))
    .await
    .unwrap()
    .unwrap();
  row.snapshot_content["title"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn difference_lists_what_the_other_version_lacks() {
  let e = todo_engine().await;
  let main = main_id(&e).await;
  e.insert_state(todo("t1", "A")).await.unwrap();
  let feature = e.create_version(NewVersion::named("feature")).await.unwrap();

  let same = e
    .version_change_in_difference(feature.id.clone(), main.clone())
    .await
    .unwrap();
  assert!(same.is_empty());

  e.insert_state(todo("t2", "B").in_version(&feature.id))
    .await
    .unwrap();
  let ahead = e
    .version_change_in_difference(feature.id.clone(), main.clone())
    .await
    .unwrap();
  let ids: Vec<&str> = ahead.iter().map(|c| c.entity_id.as_str()).collect();
  assert_eq!(ids, vec!["t2"]);

  let behind = e
    .version_change_in_difference(main, feature.id)
    .await
    .unwrap();
  assert!(behind.is_empty());
}

#[tokio::test]
async fn disjoint_edits_merge_cleanly() {
  let e = todo_engine().await;
  let main = main_id(&e).await;
  e.insert_state(todo("t1", "A")).await.unwrap();
  let feature = e.create_version(NewVersion::named("feature")).await.unwrap();

  e.insert_state(todo("t2", "from feature").in_version(&feature.id))
    .await
    .unwrap();
  e.insert_state(todo("t3", "from main")).await.unwrap();
  let feature_tip = e
    .version(feature.id.clone())
    .await
    .unwrap()
    .unwrap()
    .commit_id;

  let outcome = e
    .merge_version(feature.id.clone(), main.clone())
    .await
    .unwrap();
  assert!(outcome.conflicts.is_empty());
  let applied: Vec<&str> =
    outcome.applied.iter().map(|c| c.entity_id.as_str()).collect();
  assert_eq!(applied, vec!["t2"]);

  let merge = e.commit(outcome.commit_id.unwrap()).await.unwrap();
  assert_eq!(merge.parent_commit_ids.len(), 2);
  assert!(merge.parent_commit_ids.contains(&feature_tip));

  assert_eq!(title(&e, "t2", &main).await, "from feature");
  assert_eq!(title(&e, "t3", &main).await, "from main");
  assert_eq!(title(&e, "t1", &main).await, "A");
}

#[tokio::test]
async fn merging_twice_changes_nothing() {
  let e = todo_engine().await;
  let main = main_id(&e).await;
  let feature = e.create_version(NewVersion::named("feature")).await.unwrap();
  e.insert_state(todo("t1", "A").in_version(&feature.id))
    .await
    .unwrap();

  e.merge_version(feature.id.clone(), main.clone()).await.unwrap();
  let again = e.merge_version(feature.id, main).await.unwrap();
  assert_eq!(again.commit_id, None);
  assert!(again.applied.is_empty());
  assert!(again.conflicts.is_empty());
}

#[tokio::test]
async fn divergent_edits_conflict_until_resolved() {
  let e = todo_engine().await;
  let main = main_id(&e).await;
  e.insert_state(todo("t1", "A")).await.unwrap();
  let feature = e.create_version(NewVersion::named("feature")).await.unwrap();

  let theirs = e
    .insert_state(todo("t1", "B").in_version(&feature.id))
    .await
    .unwrap();
  let ours = e.insert_state(todo("t1", "C")).await.unwrap();

  let outcome = e
    .merge_version(feature.id.clone(), main.clone())
    .await
    .unwrap();
  assert_eq!(outcome.commit_id, None);
  assert_eq!(outcome.conflicts.len(), 1);
  assert_eq!(title(&e, "t1", &main).await, "C");

  let conflicts = e.conflicts(main.clone()).await.unwrap();
  assert_eq!(conflicts.len(), 1);
  let conflict = &conflicts[0];
  assert_eq!(conflict.entity_key.entity_id, "t1");
  let theirs_id = theirs.change_id.unwrap();
  assert!(conflict.change_ids.contains(&theirs_id));
  assert!(conflict.change_ids.contains(&ours.change_id.unwrap()));

  let unrelated = e.insert_state(todo("t9", "Z")).await.unwrap();
  let err = e
    .resolve_conflict(
      main.clone(),
      conflict.id.clone(),
      unrelated.change_id.unwrap(),
    )
    .await
    .unwrap_err();
  assert!(
    matches!(err, Error::ChangeNotDirectChildOfConflict { .. }),
    "{err:?}"
  );

  e.resolve_conflict(main.clone(), conflict.id.clone(), theirs_id)
    .await
    .unwrap();
  assert_eq!(title(&e, "t1", &main).await, "B");
  assert!(e.conflicts(main.clone()).await.unwrap().is_empty());

  let err = e
    .resolve_conflict(main, conflict.id.clone(), "whatever")
    .await
    .unwrap_err();
  assert!(matches!(err, Error::ConflictNotFound(_)), "{err:?}");
}

#[tokio::test]
async fn merges_keep_newer_target_edits_across_uneven_branches() {
  let e = todo_engine().await;
  let main = main_id(&e).await;
  e.insert_state(todo("y", "base")).await.unwrap();
  let feature = e.create_version(NewVersion::named("feature")).await.unwrap();

  e.insert_state(todo("a", "from feature").in_version(&feature.id))
    .await
    .unwrap();
  e.insert_state(todo("y", "main edit")).await.unwrap();
  e.insert_state(todo("z", "Z")).await.unwrap();
  e.insert_state(todo("w", "W")).await.unwrap();

  let outcome = e
    .merge_version(feature.id.clone(), main.clone())
    .await
    .unwrap();
  assert!(outcome.conflicts.is_empty());
  let applied: Vec<&str> =
    outcome.applied.iter().map(|c| c.entity_id.as_str()).collect();
  assert_eq!(applied, vec!["a"]);

  assert_eq!(title(&e, "y", &main).await, "main edit");
  assert_eq!(title(&e, "a", &main).await, "from feature");
  assert_eq!(title(&e, "w", &main).await, "W");

  let old = e.checkout(outcome.commit_id.unwrap()).await.unwrap();
  assert_eq!(title(&e, "y", &old.id).await, "main edit");
  assert_eq!(title(&e, "a", &old.id).await, "from feature");
}

#[tokio::test]
async fn partial_merges_keep_the_target_side_of_conflicts() {
  let e = todo_engine().await;
  let main = main_id(&e).await;
  e.insert_state(todo("t1", "A")).await.unwrap();
  let feature = e.create_version(NewVersion::named("feature")).await.unwrap();

  e.insert_state(todo("t1", "B").in_version(&feature.id))
    .await
    .unwrap();
  e.insert_state(todo("t2", "new").in_version(&feature.id))
    .await
    .unwrap();
  e.insert_state(todo("t1", "C")).await.unwrap();

  let outcome = e
    .merge_version(feature.id.clone(), main.clone())
    .await
    .unwrap();
  let applied: Vec<&str> =
    outcome.applied.iter().map(|c| c.entity_id.as_str()).collect();
  assert_eq!(applied, vec!["t2"]);
  assert_eq!(outcome.conflicts.len(), 1);
  assert_eq!(outcome.conflicts[0].entity_key.entity_id, "t1");

  assert_eq!(title(&e, "t1", &main).await, "C");
  assert_eq!(title(&e, "t2", &main).await, "new");
  assert_eq!(e.conflicts(main.clone()).await.unwrap().len(), 1);

  let old = e.checkout(outcome.commit_id.unwrap()).await.unwrap();
  assert_eq!(title(&e, "t1", &old.id).await, "C");
  assert_eq!(title(&e, "t2", &old.id).await, "new");
}
