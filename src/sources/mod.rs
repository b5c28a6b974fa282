//! Contracts of the backing store collaborators, plus a couple of implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    cursor::CursorToken,
    models::item::{DraftPayload, Item},
};

pub mod http;
pub mod memory;

/// One page request, as sent to every source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    /// `None` asks for the newest page.
    pub cursor: Option<CursorToken>,
    pub limit: usize,
    pub viewer_ref: String,
}

/// What a source answers to a [`PageRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcePage {
    pub items: Vec<Item>,
    /// True iff the page is full. A heuristic, not a count.
    pub has_more: bool,
}

impl SourcePage {
    pub fn new(items: Vec<Item>, limit: usize) -> Self {
        let has_more = items.len() == limit;
        Self { items, has_more }
    }
}

/// An independently paginated backing query, e.g. "text items" or "media items".
///
/// Access control and type filtering happen inside the source.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// A short name used in logs and errors.
    fn name(&self) -> &str;

    async fn fetch_page(&self, request: &PageRequest) -> anyhow::Result<SourcePage>;
}

/// Persists local writes. The `Err` reason is shown to the viewer as-is.
#[async_trait]
pub trait ItemWriter: Send + Sync {
    async fn create_item(&self, draft: &DraftPayload) -> Result<Item, String>;
}
