//! The single point of mutation of the timeline.
//!
//! Every source of change (pages, push batches, local writes, scrolling) is turned
//! into a [`TimelineEvent`] and applied here, one at a time. Each event is
//! committed as a whole, so a reader never sees a half-merged sequence.

use std::collections::{HashMap, HashSet};

use chrono::TimeDelta;
use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use tracing::{debug, trace, warn};

use crate::{
    cursor::{self, Cursor, CursorToken},
    models::{
        errors::TimelineError,
        item::{Item, ItemId, TempId, display_order},
    },
    timeline::{
        paginator::MergedPage,
        scroll::{ScrollTracker, ScrollTransition},
    },
};

/// Everything that can change the timeline.
#[derive(Debug, Clone)]
pub enum TimelineEvent {
    /// A page request was sent.
    PaginationStarted,
    /// A page came back for the request made with `requested`.
    PageLoaded {
        requested: Option<CursorToken>,
        page: MergedPage,
    },
    /// A page request failed or was aborted.
    PaginationFailed(TimelineError),
    /// New confirmed items from the push channel.
    PushBatch {
        items: Vec<Item>,
        head_cursor: Option<CursorToken>,
    },
    /// Items deleted at the backing store.
    ItemsRemoved(Vec<String>),
    OptimisticCreated(Item),
    OptimisticReconciled { temp_id: TempId, item: Item },
    OptimisticRolledBack { temp_id: TempId, reason: String },
    ScrollUpdated { offset: f64 },
    /// The push connection was lost; the listener is reconnecting.
    PushDropped(String),
}

/// The externally observed state of the timeline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineState {
    /// Newest first, unique by effective id.
    items: Vec<Item>,
    /// Push items held back while the viewer is away from the top, keyed by id, newest first.
    #[serde(serialize_with = "serialize_pending")]
    pending_buffer: IndexMap<String, Item>,
    pending_count: usize,
    is_near_top: bool,
    loading: bool,
    has_more: bool,
    error: Option<TimelineError>,
    /// Cursor of the oldest loaded item, for the next page.
    next_cursor: Option<CursorToken>,
    /// Cursor of the newest merged item, for push resubscription.
    head_cursor: Option<CursorToken>,
}

fn serialize_pending<S>(pending: &IndexMap<String, Item>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_seq(pending.values())
}

impl TimelineState {
    fn new(is_near_top: bool) -> Self {
        Self {
            items: Vec::new(),
            pending_buffer: IndexMap::new(),
            pending_count: 0,
            is_near_top,
            loading: false,
            has_more: true,
            error: None,
            next_cursor: None,
            head_cursor: None,
        }
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn pending_buffer(&self) -> impl Iterator<Item = &Item> {
        self.pending_buffer.values()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count
    }

    pub fn is_near_top(&self) -> bool {
        self.is_near_top
    }

    pub fn loading(&self) -> bool {
        self.loading
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn error(&self) -> Option<&TimelineError> {
        self.error.as_ref()
    }

    pub fn next_cursor(&self) -> Option<&CursorToken> {
        self.next_cursor.as_ref()
    }

    pub fn head_cursor(&self) -> Option<&CursorToken> {
        self.head_cursor.as_ref()
    }
}

/// Owns the [`TimelineState`] and the dedup bookkeeping behind it.
#[derive(Debug)]
pub struct Reducer {
    state: TimelineState,
    /// Effective ids of everything in `state.items`.
    item_ids: HashSet<String>,
    /// tempId -> serverId of every reconciled write.
    reconciled: HashMap<TempId, String>,
    scroll: ScrollTracker,
    tail: Option<Cursor>,
    head: Option<Cursor>,
    closed: bool,
}

impl Default for Reducer {
    fn default() -> Self {
        Self::new(ScrollTracker::default())
    }
}

impl Reducer {
    pub fn new(scroll: ScrollTracker) -> Self {
        Self {
            state: TimelineState::new(scroll.is_near_top()),
            item_ids: HashSet::new(),
            reconciled: HashMap::new(),
            scroll,
            tail: None,
            head: None,
            closed: false,
        }
    }

    pub fn state(&self) -> &TimelineState {
        &self.state
    }

    /// The server id a reconciled temp id was replaced with.
    pub fn reconciled_id(&self, temp_id: &TempId) -> Option<&str> {
        self.reconciled.get(temp_id).map(String::as_str)
    }

    /// After this, every event is ignored.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Applies one event. Returns whether the observed state changed.
    pub fn apply(&mut self, event: TimelineEvent) -> bool {
        if self.closed {
            trace!("Ignoring {event:?} on a closed timeline");
            return false;
        }

        match event {
            TimelineEvent::PaginationStarted => {
                self.state.loading = true;
                true
            }
            TimelineEvent::PageLoaded { requested, page } => self.apply_page(requested, page),
            TimelineEvent::PaginationFailed(error) => {
                warn!("Pagination failed: {error}");
                self.state.loading = false;
                self.state.error = Some(error);
                true
            }
            TimelineEvent::PushBatch { items, head_cursor } => {
                self.apply_push_batch(items, head_cursor)
            }
            TimelineEvent::ItemsRemoved(ids) => self.remove_items(&ids),
            TimelineEvent::OptimisticCreated(item) => self.insert_optimistic(item),
            TimelineEvent::OptimisticReconciled { temp_id, item } => self.reconcile(temp_id, item),
            TimelineEvent::OptimisticRolledBack { temp_id, reason } => {
                let removed = self.remove_entry(temp_id.as_str());
                debug!("Rolled back optimistic item {temp_id} (present: {removed}): {reason}");
                self.state.error = Some(TimelineError::OptimisticWriteFailed {
                    temp_id: temp_id.to_string(),
                    reason,
                });
                true
            }
            TimelineEvent::ScrollUpdated { offset } => {
                let transition = self.scroll.update_scroll_offset(offset);
                self.state.is_near_top = self.scroll.is_near_top();
                if transition == ScrollTransition::EnteredTop && self.state.pending_count > 0 {
                    self.flush_pending();
                }
                transition != ScrollTransition::Unchanged
            }
            TimelineEvent::PushDropped(reason) => {
                self.state.error = Some(TimelineError::PushChannelDropped(reason));
                true
            }
        }
    }

    /// Moves the whole pending buffer to the head of `items`. Returns how many items moved.
    pub fn flush_pending(&mut self) -> usize {
        if self.closed || self.state.pending_buffer.is_empty() {
            return 0;
        }
        let drained: Vec<Item> = self
            .state
            .pending_buffer
            .drain(..)
            .map(|(_, item)| item)
            .collect();
        self.state.pending_count = 0;
        self.advance_head(&drained, None);
        let added = self.insert_items(drained);
        debug!("Flushed {added} pending items into the timeline");
        added
    }

    pub fn clear_error(&mut self) -> bool {
        !self.closed && self.state.error.take().is_some()
    }

    fn apply_page(&mut self, requested: Option<CursorToken>, page: MergedPage) -> bool {
        let is_current = requested == self.state.next_cursor;
        self.advance_head(&page.items, None);
        let added = self.insert_items(page.items.iter().cloned());

        if !is_current {
            debug!("Merged {added} items from a stale page, cursors untouched");
            return added > 0;
        }

        self.state.loading = false;
        match page.items.last().and_then(Item::cursor) {
            Some(tail) if self.tail.as_ref().is_none_or(|t| tail.is_older_than(t)) => {
                self.tail = Some(tail);
                self.state.next_cursor = page.next_cursor;
                self.state.has_more = page.has_more;
            }
            Some(tail) => {
                warn!("Page tail {tail:?} doesn't move past the current cursor, stopping pagination");
                self.state.has_more = false;
            }
            None => {
                self.state.has_more = false;
            }
        }
        true
    }

    fn apply_push_batch(&mut self, items: Vec<Item>, head_cursor: Option<CursorToken>) -> bool {
        let mut seen = HashSet::new();
        let mut fresh: Vec<Item> = items
            .into_iter()
            .filter(|item| {
                if item.is_optimistic() {
                    warn!("Push delivered a provisional item {}, dropping it", item.effective_id());
                    return false;
                }
                let id = item.effective_id();
                !self.item_ids.contains(id)
                    && !self.state.pending_buffer.contains_key(id)
                    && seen.insert(id.to_owned())
            })
            .collect();

        if fresh.is_empty() {
            trace!("Push batch only held known items");
            return false;
        }

        if self.state.is_near_top {
            let head_hint = head_cursor.as_ref().and_then(|t| cursor::decode(t).ok());
            self.advance_head(&fresh, head_hint);
            self.insert_items(fresh);
        } else {
            fresh.sort_by(display_order);
            for item in fresh {
                self.state
                    .pending_buffer
                    .insert(item.effective_id().to_owned(), item);
            }
            self.state
                .pending_buffer
                .sort_by(|_, a, _, b| display_order(a, b));
            self.state.pending_count = self.state.pending_buffer.len();
        }
        true
    }

    fn insert_optimistic(&mut self, mut item: Item) -> bool {
        if !item.is_optimistic() {
            warn!("OptimisticCreated with confirmed item {}, ignoring it", item.effective_id());
            return false;
        }
        if self.item_ids.contains(item.effective_id()) {
            return false;
        }
        // Always shown at the head, whatever the local clock says.
        if let Some(head) = self.state.items.first()
            && head.created_at >= item.created_at
        {
            item.created_at = head.created_at + TimeDelta::milliseconds(1);
        }
        self.item_ids.insert(item.effective_id().to_owned());
        self.state.items.insert(0, item);
        true
    }

    fn reconcile(&mut self, temp_id: TempId, item: Item) -> bool {
        let ItemId::Confirmed(server_id) = item.id.clone() else {
            warn!("Reconciliation of {temp_id} with a provisional item, ignoring it");
            return false;
        };
        let provisional = ItemId::Provisional(temp_id.clone());
        let position = self.state.items.iter().position(|i| i.id == provisional);

        let Some(position) = position else {
            if self.reconciled.contains_key(&temp_id) {
                debug!("{temp_id} was already reconciled");
                return false;
            }
            self.reconciled.insert(temp_id, server_id);
            self.advance_head(std::slice::from_ref(&item), None);
            return self.insert_items([item]) > 0;
        };

        self.item_ids.remove(temp_id.as_str());
        if self.item_ids.contains(&server_id) {
            // The confirmed item got here first through another path.
            self.state.items.remove(position);
        } else {
            if self.state.pending_buffer.shift_remove(&server_id).is_some() {
                self.state.pending_count = self.state.pending_buffer.len();
            }
            self.advance_head(std::slice::from_ref(&item), None);
            self.item_ids.insert(server_id.clone());
            self.state.items[position] = item;
            // Stable: the entry keeps its position unless the server timestamp moved it.
            self.state.items.sort_by(display_order);
        }
        debug!("Reconciled {temp_id} as {server_id}");
        self.reconciled.insert(temp_id, server_id);
        true
    }

    fn remove_items(&mut self, ids: &[String]) -> bool {
        let mut changed = false;
        for id in ids {
            changed |= self.remove_entry(id);
            self.reconciled.retain(|_, server_id| server_id != id);
        }
        changed
    }

    /// Removes `id` from `items` or the pending buffer.
    fn remove_entry(&mut self, id: &str) -> bool {
        if self.item_ids.remove(id) {
            self.state.items.retain(|item| item.effective_id() != id);
            return true;
        }
        if self.state.pending_buffer.shift_remove(id).is_some() {
            self.state.pending_count = self.state.pending_buffer.len();
            return true;
        }
        false
    }

    /// Adds the items not seen yet and restores display order. Returns how many were added.
    fn insert_items(&mut self, items: impl IntoIterator<Item = Item>) -> usize {
        let mut added = 0;
        for item in items {
            let id = item.effective_id();
            if self.item_ids.contains(id) || self.state.pending_buffer.contains_key(id) {
                continue;
            }
            self.item_ids.insert(id.to_owned());
            self.state.items.push(item);
            added += 1;
        }
        if added > 0 {
            self.state.items.sort_by(display_order);
        }
        added
    }

    fn advance_head(&mut self, items: &[Item], hint: Option<Cursor>) {
        let newest = items
            .iter()
            .filter_map(Item::cursor)
            .chain(hint)
            .reduce(|a, b| if a.is_older_than(&b) { b } else { a });
        if let Some(newest) = newest
            && self.head.as_ref().is_none_or(|h| h.is_older_than(&newest))
        {
            self.state.head_cursor = Some(newest.encode());
            self.head = Some(newest);
        }
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> Result<(), String> {
        let items = &self.state.items;
        let mut all = HashSet::new();
        for item in items.iter().chain(self.state.pending_buffer.values()) {
            if !all.insert(item.effective_id()) {
                return Err(format!("duplicate id {}", item.effective_id()));
            }
        }
        if items.windows(2).any(|w| display_order(&w[0], &w[1]).is_gt()) {
            return Err("items out of order".into());
        }
        let pending: Vec<_> = self.state.pending_buffer.values().collect();
        if pending.windows(2).any(|w| display_order(w[0], w[1]).is_gt()) {
            return Err("pending buffer out of order".into());
        }
        if self.state.pending_count != self.state.pending_buffer.len() {
            return Err("pending count out of sync".into());
        }
        let indexed: HashSet<&str> = items.iter().map(Item::effective_id).collect();
        if indexed != self.item_ids.iter().map(String::as_str).collect() {
            return Err("id index out of sync".into());
        }
        for (temp_id, server_id) in &self.reconciled {
            if indexed.contains(temp_id.as_str()) && indexed.contains(server_id.as_str()) {
                return Err(format!("{temp_id} present alongside {server_id}"));
            }
        }
        Ok(())
    }
}
