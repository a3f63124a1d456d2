use quire_core::{
  change::NewChange,
  json_plugin::{JSON_PLUGIN_KEY, JSON_PROPERTY_SCHEMA_KEY},
  state::StateAddress,
  version::NewVersion,
};
use serde_json::json;

use super::{engine, main_id};
use crate::Error;

const PETER_50: &[u8] = br#"{"name":"Peter","age":50}"#;
const PETER_51: &[u8] = br#"{"name":"Peter","age":51}"#;

// ─── Projection ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn files_render_from_their_entities() {
  let e = engine().await;
  let main = main_id(&e).await;
  let file = e.insert_file("/people.json", PETER_50.to_vec()).await.unwrap();
  assert_eq!(file.path, "/people.json");
  assert_eq!(file.data, PETER_50);

  let age = e
    .read(StateAddress::new("age", JSON_PROPERTY_SCHEMA_KEY, &file.id, &main))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(age.snapshot_content["value"], 50);
  assert_eq!(age.plugin_key, JSON_PLUGIN_KEY);

  let read = e.file(file.id.clone(), None).await.unwrap();
  assert_eq!(read.data, PETER_50);
}

#[tokio::test]
async fn update_history_and_checkout() {
  let e = engine().await;
  let file = e.insert_file("/people.json", PETER_50.to_vec()).await.unwrap();
  let first = e.active_version().await.unwrap().commit_id;

  let updated = e.update_file(file.id.clone(), PETER_51.to_vec()).await;
  assert_eq!(updated.unwrap().data, PETER_51);
  let tip = e.active_version().await.unwrap().commit_id;
  assert_ne!(tip, first);

  let history = e.file_history(file.id.clone(), tip.clone()).await.unwrap();
  let steps: Vec<(&str, usize)> = history
    .iter()
    .map(|h| (h.commit_id.as_str(), h.depth))
    .collect();
  assert_eq!(steps, vec![(tip.as_str(), 0), (first.as_str(), 1)]);
  assert_eq!(history[0].data, PETER_51);
  assert_eq!(history[1].data, PETER_50);

  e.checkout(first).await.unwrap();
  let restored = e.file(file.id, None).await.unwrap();
  assert_eq!(restored.data, PETER_50);
}

#[tokio::test]
async fn deleted_files_are_gone() {
  let e = engine().await;
  let file = e.insert_file("/people.json", PETER_50.to_vec()).await.unwrap();
  e.delete_file(file.id.clone()).await.unwrap();

  let err = e.file(file.id.clone(), None).await.unwrap_err();
  assert!(matches!(err, Error::FileNotFound(_)), "{err:?}");
  let rows = e
    .query(
      "SELECT entity_id FROM state WHERE file_id = ?",
      vec![json!(file.id)],
    )
    .await
    .unwrap();
  assert!(rows.rows.is_empty());
}

#[tokio::test]
async fn files_need_a_plugin() {
  let e = engine().await;
  let err = e.insert_file("/notes.txt", b"hi".to_vec()).await.unwrap_err();
  assert!(matches!(err, Error::PluginMissing { .. }), "{err:?}");
}

#[tokio::test]
async fn versions_see_their_own_bytes() {
  let e = engine().await;
  let main = main_id(&e).await;
  let file = e.insert_file("/people.json", PETER_50.to_vec()).await.unwrap();
  let feature = e.create_version(NewVersion::named("feature")).await.unwrap();

  e.switch_version(feature.id.clone()).await.unwrap();
  e.update_file(file.id.clone(), PETER_51.to_vec()).await.unwrap();

  let in_main = e.file(file.id.clone(), Some(main)).await.unwrap();
  let in_feature = e.file(file.id, Some(feature.id)).await.unwrap();
  assert_eq!(in_main.data, PETER_50);
  assert_eq!(in_feature.data, PETER_51);
}

// ─── Applying history ────────────────────────────────────────────────────────

#[tokio::test]
async fn apply_commit_replays_a_commit_elsewhere() {
  let e = engine().await;
  let main = main_id(&e).await;
  let file = e.insert_file("/people.json", PETER_50.to_vec()).await.unwrap();
  let feature = e.create_version(NewVersion::named("feature")).await.unwrap();

  e.update_file(file.id.clone(), PETER_51.to_vec()).await.unwrap();
  let bump = e.active_version().await.unwrap().commit_id;

  let applied = e.apply_commit(bump.clone(), feature.id.clone()).await.unwrap();
  let commit = e.commit(applied).await.unwrap();
  assert!(commit.parent_commit_ids.contains(&bump));

  let in_feature = e.file(file.id, Some(feature.id)).await.unwrap();
  assert_eq!(in_feature.data, PETER_51);
  assert_eq!(main_id(&e).await, main);
}

#[tokio::test]
async fn apply_changes_to_file_checks_ownership() {
  let e = engine().await;
  let file = e.insert_file("/people.json", PETER_50.to_vec()).await.unwrap();
  let other = e.insert_file("/other.json", br#"{"a":1}"#.to_vec()).await;
  let other = other.unwrap();

  let change = e
    .record_change(NewChange {
      id:               None,
      entity_id:        "age".to_owned(),
      schema_key:       JSON_PROPERTY_SCHEMA_KEY.to_owned(),
      schema_version:   "1.0".to_owned(),
      file_id:          file.id.clone(),
      plugin_key:       JSON_PLUGIN_KEY.to_owned(),
      snapshot_content: Some(
        json!({ "property": "age", "value": 51, "position": 1 }),
      ),
      metadata:         None,
    })
    .await
    .unwrap();

  let err = e
    .apply_changes_to_file(other.id, vec![change.id.clone()])
    .await
    .unwrap_err();
  assert!(
    matches!(err, Error::ChangeDoesNotBelongToFile { .. }),
    "{err:?}"
  );

  let data = e
    .apply_changes_to_file(file.id.clone(), vec![change.id])
    .await
    .unwrap();
  assert_eq!(data, PETER_51);
  assert_eq!(e.file(file.id, None).await.unwrap().data, PETER_51);
}
