use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chrono::Utc;

use super::{ItemWriter, PageRequest, SourceFetcher, SourcePage};
use crate::{
    cursor,
    models::item::{DraftPayload, Item, ItemId, display_order},
};

/// A source backed by a vector, honoring the cursor exclusion clause.
#[derive(Debug)]
pub struct InMemorySource {
    name: String,
    items: Mutex<Vec<Item>>,
    failure: Mutex<Option<String>>,
    fetches: AtomicUsize,
}

impl InMemorySource {
    pub fn new(name: impl Into<String>, mut items: Vec<Item>) -> Self {
        items.sort_by(display_order);
        Self {
            name: name.into(),
            items: Mutex::new(items),
            failure: Mutex::new(None),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, item: Item) {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.push(item);
        items.sort_by(display_order);
    }

    /// Makes every fetch fail with `reason` until cleared with `None`.
    pub fn set_failure(&self, reason: Option<String>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = reason;
    }

    /// How many fetches reached this source.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for InMemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_page(&self, request: &PageRequest) -> anyhow::Result<SourcePage> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            anyhow::bail!(reason);
        }

        let after = request.cursor.as_ref().map(cursor::decode).transpose()?;
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let page: Vec<Item> = items
            .iter()
            .filter(|item| after.as_ref().is_none_or(|c| c.admits(item)))
            .take(request.limit)
            .cloned()
            .collect();
        Ok(SourcePage::new(page, request.limit))
    }
}

/// A writer that confirms every draft with a fresh `srv_<n>` id, or rejects them all.
#[derive(Debug)]
pub struct InMemoryWriter {
    author_ref: String,
    next_id: AtomicU64,
    rejection: Mutex<Option<String>>,
}

impl InMemoryWriter {
    pub fn new(author_ref: impl Into<String>, first_id: u64) -> Self {
        Self {
            author_ref: author_ref.into(),
            next_id: AtomicU64::new(first_id),
            rejection: Mutex::new(None),
        }
    }

    pub fn set_rejection(&self, reason: Option<String>) {
        *self.rejection.lock().unwrap_or_else(PoisonError::into_inner) = reason;
    }
}

#[async_trait]
impl ItemWriter for InMemoryWriter {
    async fn create_item(&self, draft: &DraftPayload) -> Result<Item, String> {
        if let Some(reason) = self
            .rejection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(reason);
        }
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Item {
            id: ItemId::Confirmed(format!("srv_{seq}")),
            author_ref: self.author_ref.clone(),
            payload: draft.payload.clone(),
            created_at: Utc::now(),
            community_ref: draft.community_ref.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone};
    use serde_json::{Value, json};

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn source() -> InMemorySource {
        InMemorySource::new(
            "text",
            (1..=5)
                .map(|n| Item::confirmed(format!("t{n}"), "a", Value::Null, at(n)))
                .collect(),
        )
    }

    fn request(cursor: Option<cursor::CursorToken>, limit: usize) -> PageRequest {
        PageRequest {
            cursor,
            limit,
            viewer_ref: "viewer".into(),
        }
    }

    #[tokio::test]
    async fn pages_walk_backwards_from_cursor() {
        let source = source();

        let first = source.fetch_page(&request(None, 2)).await.unwrap();
        let ids: Vec<_> = first.items.iter().map(Item::effective_id).collect();
        assert_eq!(ids, ["t5", "t4"]);
        assert!(first.has_more);

        let next = first.items.last().unwrap().cursor().unwrap().encode();
        let second = source.fetch_page(&request(Some(next), 2)).await.unwrap();
        let ids: Vec<_> = second.items.iter().map(Item::effective_id).collect();
        assert_eq!(ids, ["t3", "t2"]);
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn short_page_has_no_more() {
        let page = source().fetch_page(&request(None, 10)).await.unwrap();
        assert_eq!(page.items.len(), 5);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn failure_is_reported() {
        let source = source();
        source.set_failure(Some("db down".into()));
        let err = source.fetch_page(&request(None, 2)).await.unwrap_err();
        assert_eq!(err.to_string(), "db down");
    }

    #[tokio::test]
    async fn writer_issues_sequential_ids() {
        let writer = InMemoryWriter::new("alice", 42);
        let item = writer
            .create_item(&DraftPayload::new(json!({ "content": "hi" })))
            .await
            .unwrap();
        assert_eq!(item.id, ItemId::Confirmed("srv_42".into()));
        assert_eq!(item.payload["content"], "hi");

        writer.set_rejection(Some("too long".into()));
        let err = writer
            .create_item(&DraftPayload::new(Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err, "too long");
    }
}
