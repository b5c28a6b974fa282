use chrono::Utc;
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::models::item::{DraftPayload, Item, ItemId, TempId};

/// Creates provisional items for local writes and tracks them until the backing store answers.
///
/// The manager owns the drafts in flight; the items themselves live in the reducer.
#[derive(Debug)]
pub struct OptimisticWriteManager {
    author_ref: String,
    next_seq: u64,
    in_flight: IndexMap<TempId, DraftPayload>,
}

impl OptimisticWriteManager {
    pub fn new(author_ref: impl Into<String>) -> Self {
        Self {
            author_ref: author_ref.into(),
            next_seq: 1,
            in_flight: IndexMap::new(),
        }
    }

    /// Starts counting temp ids at `seq` instead of 1.
    pub fn starting_at(mut self, seq: u64) -> Self {
        self.next_seq = seq;
        self
    }

    /// Builds the provisional item for `draft` and starts tracking it.
    pub fn create_local(&mut self, draft: DraftPayload) -> Item {
        let temp_id = TempId::from_sequence(self.next_seq);
        self.next_seq += 1;

        let item = Item {
            id: ItemId::Provisional(temp_id.clone()),
            author_ref: self.author_ref.clone(),
            payload: draft.payload.clone(),
            created_at: Utc::now(),
            community_ref: draft.community_ref.clone(),
        };
        debug!("Created optimistic item {temp_id}");
        self.in_flight.insert(temp_id, draft);
        item
    }

    /// Stops tracking `temp_id` after a confirmation. Returns `false` if it wasn't in flight.
    pub fn reconcile(&mut self, temp_id: &TempId) -> bool {
        let known = self.in_flight.shift_remove(temp_id).is_some();
        if !known {
            warn!("Confirmation for unknown or abandoned optimistic item {temp_id}");
        }
        known
    }

    /// Stops tracking `temp_id` after a failure and hands back its draft for resubmission.
    pub fn rollback(&mut self, temp_id: &TempId) -> Option<DraftPayload> {
        self.in_flight.shift_remove(temp_id)
    }

    /// Forgets every write in flight, e.g. on teardown.
    pub fn abandon_all(&mut self) -> usize {
        let abandoned = self.in_flight.len();
        self.in_flight.clear();
        abandoned
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &TempId> {
        self.in_flight.keys()
    }

    pub fn is_in_flight(&self, temp_id: &TempId) -> bool {
        self.in_flight.contains_key(temp_id)
    }
}
