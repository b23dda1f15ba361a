use crate::cue::Cue;
use crate::wire::{InboundFrame, ItemPatch};
use crate::QueueItem;
use thiserror::Error;

/// Ordered collection of appeals as last reported by the server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Queue {
    items: Vec<QueueItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionRefused {
    #[error("appeal {0} is not in the queue")]
    UnknownItem(String),
    #[error("appeal {0} already has an action in flight")]
    InFlight(String),
}

/// Apply one inbound frame to `queue`, returning the new queue and the cue to
/// play, if any. Pure: no I/O and no timers.
pub fn reduce(mut queue: Queue, frame: InboundFrame) -> (Queue, Option<Cue>) {
    let cue = queue.apply(frame);
    (queue, cue)
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<QueueItem>) -> Self {
        let mut queue = Self::new();
        queue.replace(items);
        queue
    }

    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&QueueItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.id.as_str()).collect()
    }

    pub fn apply(&mut self, frame: InboundFrame) -> Option<Cue> {
        match frame {
            InboundFrame::Snapshot(items) => {
                self.replace(items);
                None
            }
            InboundFrame::ItemUpdated(patch) => {
                self.merge(patch);
                Some(Cue::MessageReceived)
            }
            InboundFrame::ItemRemoved { id } => {
                self.remove(&id);
                None
            }
            InboundFrame::ItemInserted(item) => {
                self.insert(item);
                Some(Cue::NewItem)
            }
            InboundFrame::LivenessReply
            | InboundFrame::BatchSnapshot
            | InboundFrame::Unknown { .. } => None,
        }
    }

    pub fn replace(&mut self, items: Vec<QueueItem>) {
        self.items = items;
        for item in &mut self.items {
            item.action_in_flight = false;
        }
    }

    /// Returns false when the appeal is not (or no longer) in the queue.
    pub fn merge(&mut self, patch: ItemPatch) -> bool {
        match self.items.iter_mut().find(|item| item.id == patch.id) {
            Some(item) => {
                patch.merge_into(item);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<QueueItem> {
        let idx = self.items.iter().position(|item| item.id == id)?;
        Some(self.items.remove(idx))
    }

    /// Prepend `item`, replacing any stale entry with the same id, then rank
    /// the items that carry a last message by recency. A replaced entry
    /// hands its in-flight flag to the new one; only a snapshot clears it.
    pub fn insert(&mut self, mut item: QueueItem) {
        item.action_in_flight = self
            .remove(&item.id)
            .is_some_and(|stale| stale.action_in_flight);
        self.items.insert(0, item);
        self.rank_by_recency();
    }

    /// Reorders only the slots held by items with a last message, newest
    /// first and stable on ties. Items without one keep their positions.
    fn rank_by_recency(&mut self) {
        let slots: Vec<usize> = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.last_message.is_some())
            .map(|(idx, _)| idx)
            .collect();
        if slots.len() < 2 {
            return;
        }
        let mut ranked: Vec<QueueItem> = slots.iter().map(|&idx| self.items[idx].clone()).collect();
        ranked.sort_by(|a, b| b.recency().cmp(&a.recency()));
        for (idx, item) in slots.into_iter().zip(ranked) {
            self.items[idx] = item;
        }
    }

    pub fn begin_action(&mut self, id: &str) -> Result<&QueueItem, ActionRefused> {
        let item = self
            .items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| ActionRefused::UnknownItem(id.to_string()))?;
        if item.action_in_flight {
            return Err(ActionRefused::InFlight(id.to_string()));
        }
        item.action_in_flight = true;
        Ok(item)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
