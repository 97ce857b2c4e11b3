//! WorkQueue - the collapsing priority queue behind the CrawlScheduler
//!
//! Items are ordered by `(priority, sequence)`: lower priority first, FIFO
//! within a priority. At most one item is pending per `(path, class)`; a newer
//! event on the same path folds into the pending item instead of queueing
//! twice. Folding keeps the original sequence and takes the more urgent
//! priority.
//!
//! Fold table for content items (pending + incoming):
//!
//! | pending          | incoming                       | result                                 |
//! |------------------|--------------------------------|----------------------------------------|
//! | Created          | Created/Updated/Attr           | Created                                |
//! | Created          | Deleted                        | nothing                                |
//! | Deleted          | Created/Updated/Attr           | Updated                                |
//! | Updated / Attr   | Attr / Updated                 | Updated                                |
//! | MovedTo          | Created/Updated/Attr           | MovedTo                                |
//! | MovedTo          | Deleted                        | Deleted, origin becomes Deleted        |
//! | MovedFrom        | Created/Updated/Attr           | Updated, destination becomes Created   |
//! | MovedFrom        | Deleted                        | MovedFrom                              |
//! | anything         | anything else                  | incoming                               |
//!
//! A path can hold one content item and one writeback item at once. Whichever
//! was queued first is handed out first, regardless of priority.
//!
//! Moves are a linked `MovedFrom`/`MovedTo` pair. The `MovedFrom` half is never
//! handed out on its own: popping the `MovedTo` claims both paths.
//!
//! This type does no locking; the scheduler wraps it in a mutex.

use std::{
  collections::{BTreeMap, HashMap, HashSet},
  path::{Path, PathBuf},
};

use tracing::trace;

use super::message::{KindClass, WorkItem, WorkKind};

type Slot = (i32, u64);

/// What happened to an item handed to [`WorkQueue::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
  Queued,
  Merged,
  /// The incoming event cancelled the pending item
  Cancelled,
}

enum Fold {
  Kind(WorkKind),
  Cancel,
}

fn fold(pending: WorkKind, incoming: WorkKind) -> Fold {
  use WorkKind::*;

  match (pending, incoming) {
    (Created, Created | Updated | AttributeChanged) => Fold::Kind(Created),
    (Created, Deleted) => Fold::Cancel,
    (Deleted, Created | Updated | AttributeChanged) => Fold::Kind(Updated),
    (Updated, AttributeChanged) | (AttributeChanged, Updated) => Fold::Kind(Updated),
    (MovedTo, Created | Updated | AttributeChanged) => Fold::Kind(MovedTo),
    (MovedFrom, Created | Updated | AttributeChanged) => Fold::Kind(Updated),
    (MovedFrom, Deleted) => Fold::Kind(MovedFrom),
    (_, incoming) => Fold::Kind(incoming),
  }
}

#[derive(Debug, Default)]
pub struct WorkQueue {
  ordered: BTreeMap<Slot, WorkItem>,
  index: HashMap<(PathBuf, KindClass), Slot>,
  next_seq: u64,
  in_flight: HashSet<PathBuf>,
}

impl WorkQueue {
  pub fn new() -> Self {
    Self::default()
  }

  /// Queued items, not counting in-flight ones
  pub fn len(&self) -> usize {
    self.ordered.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ordered.is_empty()
  }

  pub fn in_flight(&self) -> usize {
    self.in_flight.len()
  }

  pub fn has_pending_work(&self) -> bool {
    !self.ordered.is_empty() || !self.in_flight.is_empty()
  }

  /// The pending item for a path, if any
  pub fn pending(&self, path: &Path, class: KindClass) -> Option<&WorkItem> {
    let slot = self.index.get(&(path.to_path_buf(), class))?;
    self.ordered.get(slot)
  }

  pub fn push(&mut self, incoming: WorkItem) -> PushOutcome {
    let key = (incoming.target.clone(), incoming.kind.class());

    let Some(slot) = self.index.get(&key).copied() else {
      self.insert_new(incoming);
      return PushOutcome::Queued;
    };

    let Some(pending) = self.ordered.remove(&slot) else {
      self.index.remove(&key);
      self.insert_new(incoming);
      return PushOutcome::Queued;
    };
    self.index.remove(&key);

    if incoming.kind == WorkKind::Writeback {
      let merged = WorkItem {
        priority: pending.priority.min(incoming.priority),
        writeback: incoming.writeback,
        ..pending
      };
      self.insert_at(slot.1, merged);
      return PushOutcome::Merged;
    }

    let kind = match fold(pending.kind, incoming.kind) {
      Fold::Cancel => {
        trace!(path = %pending.target.display(), "Pending item cancelled");
        return PushOutcome::Cancelled;
      }
      Fold::Kind(kind) => kind,
    };

    let partner = if kind == incoming.kind && matches!(kind, WorkKind::MovedFrom | WorkKind::MovedTo) {
      incoming.partner.clone()
    } else if kind == pending.kind {
      pending.partner.clone()
    } else {
      None
    };

    if pending.partner.is_some() && pending.partner != partner {
      self.orphan_partner(&pending);
    }

    trace!(
      path = %pending.target.display(),
      from = ?pending.kind,
      incoming = ?incoming.kind,
      to = ?kind,
      "Folded work item"
    );

    let merged = WorkItem {
      kind,
      partner,
      priority: pending.priority.min(incoming.priority),
      check_parents: pending.check_parents || incoming.check_parents,
      ..pending
    };
    self.insert_at(slot.1, merged);
    PushOutcome::Merged
  }

  /// Queue a move. A move of a file that is still waiting to be created is
  /// just a create at the destination.
  pub fn push_move(&mut self, from: PathBuf, to: PathBuf, priority: i32) {
    let pending_create = self
      .pending(&from, KindClass::Content)
      .is_some_and(|item| item.kind == WorkKind::Created);

    if pending_create {
      self.remove_pending(&from, KindClass::Content);
      self.push(WorkItem::new(to, WorkKind::Created, priority));
      return;
    }

    self.push(WorkItem::new(from.clone(), WorkKind::MovedFrom, priority).with_partner(to.clone()));
    self.push(WorkItem::new(to, WorkKind::MovedTo, priority).with_partner(from));
  }

  /// Take the most urgent item whose path (and move partner) is not in flight.
  pub fn pop_ready(&mut self) -> Option<WorkItem> {
    let slot = self
      .ordered
      .iter()
      .find(|(slot, item)| self.is_ready(slot.1, item))
      .map(|(slot, _)| *slot)?;

    let item = self.ordered.remove(&slot)?;
    self.index.remove(&(item.target.clone(), item.kind.class()));
    self.in_flight.insert(item.target.clone());

    if item.kind == WorkKind::MovedTo
      && let Some(origin) = &item.partner
    {
      let paired = self
        .pending(origin, KindClass::Content)
        .is_some_and(|p| p.kind == WorkKind::MovedFrom && p.partner.as_deref() == Some(item.target.as_path()));
      if paired {
        self.remove_pending(origin, KindClass::Content);
      }
      self.in_flight.insert(origin.clone());
    }

    Some(item)
  }

  fn is_ready(&self, seq: u64, item: &WorkItem) -> bool {
    if self.in_flight.contains(&item.target) || self.has_earlier_sibling(seq, item) {
      return false;
    }
    match (&item.kind, &item.partner) {
      (WorkKind::MovedFrom, Some(_)) => false,
      (_, Some(partner)) => !self.in_flight.contains(partner),
      _ => true,
    }
  }

  /// The other class holds an older item for the same path. Priority only
  /// reorders distinct paths.
  fn has_earlier_sibling(&self, seq: u64, item: &WorkItem) -> bool {
    let other = match item.kind.class() {
      KindClass::Content => KindClass::Writeback,
      KindClass::Writeback => KindClass::Content,
    };
    self
      .index
      .get(&(item.target.clone(), other))
      .is_some_and(|slot| slot.1 < seq)
  }

  /// Release the paths claimed when `item` was popped
  pub fn complete(&mut self, item: &WorkItem) {
    self.in_flight.remove(&item.target);
    if item.kind == WorkKind::MovedTo
      && let Some(origin) = &item.partner
    {
      self.in_flight.remove(origin);
    }
  }

  /// Drop queued items matching `predicate`. Returns how many were dropped.
  pub fn remove_where(&mut self, predicate: impl Fn(&Path) -> bool) -> usize {
    let doomed: Vec<(PathBuf, KindClass)> = self
      .ordered
      .values()
      .filter(|item| predicate(&item.target))
      .map(|item| (item.target.clone(), item.kind.class()))
      .collect();

    let mut removed = 0;
    for (path, class) in doomed {
      if let Some(item) = self.remove_pending(&path, class) {
        self.orphan_partner(&item);
        removed += 1;
      }
    }
    removed
  }

  fn remove_pending(&mut self, path: &Path, class: KindClass) -> Option<WorkItem> {
    let slot = self.index.remove(&(path.to_path_buf(), class))?;
    self.ordered.remove(&slot)
  }

  /// `item` is leaving the queue without its move happening. Its partner can
  /// no longer rely on the pair: a lone origin is a deletion, a lone
  /// destination is a fresh file.
  fn orphan_partner(&mut self, item: &WorkItem) {
    let Some(partner) = &item.partner else {
      return;
    };
    let Some(slot) = self.index.get(&(partner.clone(), KindClass::Content)).copied() else {
      return;
    };
    let Some(other) = self.ordered.get_mut(&slot) else {
      return;
    };
    if other.partner.as_deref() != Some(item.target.as_path()) {
      return;
    }

    other.partner = None;
    other.kind = match item.kind {
      WorkKind::MovedTo => WorkKind::Deleted,
      WorkKind::MovedFrom => WorkKind::Created,
      _ => other.kind,
    };
    trace!(path = %other.target.display(), kind = ?other.kind, "Move partner orphaned");
  }

  fn insert_new(&mut self, item: WorkItem) {
    let seq = self.next_seq;
    self.next_seq += 1;
    self.insert_at(seq, item);
  }

  fn insert_at(&mut self, seq: u64, item: WorkItem) {
    let slot = (item.priority, seq);
    self.index.insert((item.target.clone(), item.kind.class()), slot);
    self.ordered.insert(slot, item);
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;
  use crate::actor::message::{WritebackData, priority};

  fn item(path: &str, kind: WorkKind, priority: i32) -> WorkItem {
    WorkItem::new(PathBuf::from(path), kind, priority)
  }

  fn drain(queue: &mut WorkQueue) -> Vec<(PathBuf, WorkKind)> {
    let mut out = Vec::new();
    while let Some(item) = queue.pop_ready() {
      queue.complete(&item);
      out.push((item.target, item.kind));
    }
    out
  }

  #[test]
  fn test_priority_then_fifo() {
    let mut queue = WorkQueue::new();
    queue.push(item("/a", WorkKind::Created, priority::BACKGROUND));
    queue.push(item("/b", WorkKind::Created, priority::DEFAULT));
    queue.push(item("/c", WorkKind::Created, priority::BACKGROUND));
    queue.push(item("/d", WorkKind::Created, priority::DEFAULT));

    let order: Vec<_> = drain(&mut queue).into_iter().map(|(p, _)| p).collect();
    assert_eq!(
      order,
      ["/b", "/d", "/a", "/c"].map(PathBuf::from).to_vec(),
      "lower priority first, FIFO within a band"
    );
  }

  #[test]
  fn test_create_then_delete_cancels() {
    let mut queue = WorkQueue::new();
    assert_eq!(queue.push(item("/a", WorkKind::Created, 5)), PushOutcome::Queued);
    assert_eq!(queue.push(item("/a", WorkKind::Updated, 5)), PushOutcome::Merged);
    assert_eq!(queue.push(item("/a", WorkKind::Deleted, 5)), PushOutcome::Cancelled);

    assert!(queue.is_empty());
    assert!(queue.pop_ready().is_none());
  }

  #[test]
  fn test_fold_table() {
    use WorkKind::*;

    let cases = [
      (Created, Updated, Some(Created)),
      (Created, AttributeChanged, Some(Created)),
      (Created, Deleted, None),
      (Deleted, Created, Some(Updated)),
      (Deleted, Updated, Some(Updated)),
      (Updated, AttributeChanged, Some(Updated)),
      (AttributeChanged, Updated, Some(Updated)),
      (Updated, Deleted, Some(Deleted)),
      (AttributeChanged, Deleted, Some(Deleted)),
      (Updated, Updated, Some(Updated)),
    ];

    for (pending, incoming, expected) in cases {
      let mut queue = WorkQueue::new();
      queue.push(item("/a", pending, 1));
      queue.push(item("/a", incoming, 1));
      let got = queue.pending(Path::new("/a"), KindClass::Content).map(|i| i.kind);
      assert_eq!(got, expected, "{pending:?} + {incoming:?}");
      assert!(queue.len() <= 1);
    }
  }

  #[test]
  fn test_merge_keeps_sequence_and_raises_priority() {
    let mut queue = WorkQueue::new();
    queue.push(item("/docs/a.txt", WorkKind::Created, priority::BACKGROUND));
    queue.push(item("/docs/b.jpg", WorkKind::Created, priority::BACKGROUND));
    queue.push(item("/docs/a.txt", WorkKind::Updated, priority::URGENT).with_check_parents(true));

    assert_eq!(queue.len(), 2);
    let first = queue.pop_ready().unwrap();
    assert_eq!(first.target, PathBuf::from("/docs/a.txt"));
    assert_eq!(first.kind, WorkKind::Created);
    assert_eq!(first.priority, priority::URGENT);
    assert!(first.check_parents);

    queue.complete(&first);
    assert_eq!(queue.pop_ready().unwrap().target, PathBuf::from("/docs/b.jpg"));
  }

  #[test]
  fn test_lower_priority_never_demotes() {
    let mut queue = WorkQueue::new();
    queue.push(item("/a", WorkKind::Updated, priority::URGENT));
    queue.push(item("/a", WorkKind::Updated, priority::BACKGROUND));
    assert_eq!(queue.pop_ready().unwrap().priority, priority::URGENT);
  }

  #[test]
  fn test_in_flight_path_waits() {
    let mut queue = WorkQueue::new();
    queue.push(item("/a", WorkKind::Created, 1));
    let first = queue.pop_ready().unwrap();

    queue.push(item("/a", WorkKind::Deleted, 1));
    queue.push(item("/b", WorkKind::Created, 2));

    let next = queue.pop_ready().unwrap();
    assert_eq!(next.target, PathBuf::from("/b"), "/a is busy");
    assert!(queue.pop_ready().is_none());

    queue.complete(&first);
    let deleted = queue.pop_ready().unwrap();
    assert_eq!((deleted.target, deleted.kind), (PathBuf::from("/a"), WorkKind::Deleted));
  }

  #[test]
  fn test_move_pops_as_a_pair() {
    let mut queue = WorkQueue::new();
    queue.push_move(PathBuf::from("/a"), PathBuf::from("/b"), 3);
    assert_eq!(queue.len(), 2);

    let moved = queue.pop_ready().unwrap();
    assert_eq!(moved.kind, WorkKind::MovedTo);
    assert_eq!(moved.partner, Some(PathBuf::from("/a")));
    assert!(queue.is_empty(), "MovedFrom claimed with its destination");
    assert_eq!(queue.in_flight(), 2);

    queue.complete(&moved);
    assert!(!queue.has_pending_work());
  }

  #[test]
  fn test_move_of_pending_create_is_a_create() {
    let mut queue = WorkQueue::new();
    queue.push(item("/a", WorkKind::Created, 3));
    queue.push_move(PathBuf::from("/a"), PathBuf::from("/b"), 3);

    assert_eq!(drain(&mut queue), vec![(PathBuf::from("/b"), WorkKind::Created)]);
  }

  #[test]
  fn test_deleting_move_destination_deletes_origin() {
    let mut queue = WorkQueue::new();
    queue.push_move(PathBuf::from("/a"), PathBuf::from("/b"), 3);
    queue.push(item("/b", WorkKind::Deleted, 3));

    let mut result = drain(&mut queue);
    result.sort();
    assert_eq!(
      result,
      vec![
        (PathBuf::from("/a"), WorkKind::Deleted),
        (PathBuf::from("/b"), WorkKind::Deleted),
      ]
    );
  }

  #[test]
  fn test_recreating_move_origin_makes_destination_fresh() {
    let mut queue = WorkQueue::new();
    queue.push_move(PathBuf::from("/a"), PathBuf::from("/b"), 3);
    queue.push(item("/a", WorkKind::Created, 3));

    let mut result = drain(&mut queue);
    result.sort();
    assert_eq!(
      result,
      vec![
        (PathBuf::from("/a"), WorkKind::Updated),
        (PathBuf::from("/b"), WorkKind::Created),
      ]
    );
  }

  #[test]
  fn test_remove_where_orphans_partners() {
    let mut queue = WorkQueue::new();
    queue.push(item("/root/x", WorkKind::Created, 1));
    queue.push_move(PathBuf::from("/elsewhere/y"), PathBuf::from("/root/y"), 1);
    queue.push(item("/other/z", WorkKind::Updated, 1));

    let removed = queue.remove_where(|p| p.starts_with("/root"));
    assert_eq!(removed, 2);

    let mut result = drain(&mut queue);
    result.sort();
    assert_eq!(
      result,
      vec![
        (PathBuf::from("/elsewhere/y"), WorkKind::Deleted),
        (PathBuf::from("/other/z"), WorkKind::Updated),
      ]
    );
  }

  #[test]
  fn test_writeback_is_its_own_class() {
    let mut queue = WorkQueue::new();
    let data = |t: &str| WritebackData {
      rdf_types: vec![t.to_string()],
      results: vec![],
    };

    queue.push(item("/a", WorkKind::Updated, 5));
    queue.push(item("/a", WorkKind::Writeback, 5).with_writeback(data("nfo:Image")));
    queue.push(item("/a", WorkKind::Writeback, 5).with_writeback(data("nmm:Photo")));
    assert_eq!(queue.len(), 2);

    let writeback = queue.pending(Path::new("/a"), KindClass::Writeback).unwrap();
    assert_eq!(writeback.writeback, Some(data("nmm:Photo")));
  }

  #[test]
  fn test_same_path_keeps_event_order_across_classes() {
    let mut queue = WorkQueue::new();
    queue.push(item("/docs/a.jpg", WorkKind::Created, priority::BACKGROUND));
    queue.push(item("/docs/b.jpg", WorkKind::Created, priority::BACKGROUND));
    queue.push(item("/docs/a.jpg", WorkKind::Writeback, priority::DEFAULT));

    let first = queue.pop_ready().unwrap();
    assert_eq!((first.target.clone(), first.kind), (PathBuf::from("/docs/a.jpg"), WorkKind::Created));

    let second = queue.pop_ready().unwrap();
    assert_eq!(second.target, PathBuf::from("/docs/b.jpg"), "writeback waits for the busy path");
    queue.complete(&second);
    assert!(queue.pop_ready().is_none());

    queue.complete(&first);
    let third = queue.pop_ready().unwrap();
    assert_eq!((third.target, third.kind), (PathBuf::from("/docs/a.jpg"), WorkKind::Writeback));
  }

  #[test]
  fn test_earlier_writeback_pops_before_later_content() {
    let mut queue = WorkQueue::new();
    queue.push(item("/a", WorkKind::Writeback, priority::BACKGROUND));
    queue.push(item("/a", WorkKind::Updated, priority::DEFAULT));

    assert_eq!(
      drain(&mut queue),
      vec![
        (PathBuf::from("/a"), WorkKind::Writeback),
        (PathBuf::from("/a"), WorkKind::Updated),
      ]
    );
  }
}
