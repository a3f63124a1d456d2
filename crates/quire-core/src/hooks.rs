//! In-process commit event bus.
//!
//! Subscribers receive every committed batch of state-shaped rows, each
//! tagged with the writer that produced it so a subscriber can skip its own
//! writes.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::{Deserialize, Serialize};

/// One entity write as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateCommitRow {
  pub entity_id:        String,
  pub schema_key:       String,
  pub file_id:          String,
  pub version_id:       String,
  /// `None` for untracked writes.
  pub commit_id:        Option<String>,
  pub change_id:        Option<String>,
  /// `None` for deletions.
  pub snapshot_content: Option<serde_json::Value>,
  pub untracked:        bool,
  pub writer_key:       Option<String>,
}

type Handler = Arc<dyn Fn(&[StateCommitRow]) + Send + Sync>;
type Handlers = Mutex<Vec<(u64, Handler)>>;

#[derive(Default)]
struct Registry {
  handlers: Handlers,
  next_id:  Mutex<u64>,
}

/// Cloneable handle onto a shared list of commit handlers.
#[derive(Clone, Default)]
pub struct HookBus {
  registry: Arc<Registry>,
}

impl HookBus {
  pub fn new() -> Self { Self::default() }

  pub fn subscribe<F>(&self, handler: F) -> Subscription
  where
    F: Fn(&[StateCommitRow]) + Send + Sync + 'static,
  {
    let id = {
      let mut next = self
        .registry
        .next_id
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      *next += 1;
      *next
    };
    self
      .registry
      .handlers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push((id, Arc::new(handler)));
    Subscription { id, registry: Arc::downgrade(&self.registry) }
  }

  /// Deliver a batch to every current subscriber. Empty batches are
  /// dropped.
  pub fn emit(&self, rows: &[StateCommitRow]) {
    if rows.is_empty() {
      return;
    }
    // Handlers run outside the lock so they may subscribe or unsubscribe.
    let handlers: Vec<Handler> = self
      .registry
      .handlers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .map(|(_, h)| h.clone())
      .collect();
    tracing::debug!(
      rows = rows.len(),
      subscribers = handlers.len(),
      "state commit"
    );
    for handler in handlers {
      handler(rows);
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self
      .registry
      .handlers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }
}

impl std::fmt::Debug for HookBus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HookBus")
      .field("subscribers", &self.subscriber_count())
      .finish()
  }
}

/// Disposer returned by [`HookBus::subscribe`]. Dropping it keeps the
/// subscription alive; call [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
  id:       u64,
  registry: Weak<Registry>,
}

impl Subscription {
  pub fn unsubscribe(self) {
    if let Some(registry) = self.registry.upgrade() {
      registry
        .handlers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|(id, _)| *id != self.id);
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  fn row(writer: Option<&str>) -> StateCommitRow {
    StateCommitRow {
      entity_id:        "e1".into(),
      schema_key:       "person".into(),
      file_id:          "quire".into(),
      version_id:       "v1".into(),
      commit_id:        Some("c1".into()),
      change_id:        Some("ch1".into()),
      snapshot_content: None,
      untracked:        false,
      writer_key:       writer.map(str::to_owned),
    }
  }

  #[test]
  fn delivers_batches_until_unsubscribed() {
    let bus = HookBus::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let sub = bus.subscribe(move |rows| {
      counter.fetch_add(rows.len(), Ordering::SeqCst);
    });

    bus.emit(&[row(None), row(Some("editor"))]);
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    sub.unsubscribe();
    bus.emit(&[row(None)]);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(bus.subscriber_count(), 0);
  }

  #[test]
  fn subscribers_can_filter_their_own_writes() {
    let bus = HookBus::new();
    let foreign = Arc::new(AtomicUsize::new(0));
    let counter = foreign.clone();
    let _sub = bus.subscribe(move |rows| {
      let n = rows
        .iter()
        .filter(|r| r.writer_key.as_deref() != Some("editor"))
        .count();
      counter.fetch_add(n, Ordering::SeqCst);
    });

    bus.emit(&[row(Some("editor")), row(Some("sync")), row(None)]);
    assert_eq!(foreign.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn empty_batches_are_not_delivered() {
    let bus = HookBus::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let _sub = bus.subscribe(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    bus.emit(&[]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }
}
