use std::{collections::HashSet, sync::Arc};

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::{
    cache::PrefetchCache,
    cursor::{self, Cursor, CursorToken},
    models::{
        errors::TimelineError,
        item::{Item, display_order},
        settings::TimelineSettings,
    },
    sources::{PageRequest, SourceFetcher, SourcePage},
};

/// One page of the merged timeline, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedPage {
    pub items: Vec<Item>,
    pub has_more: bool,
    /// The cursor of the oldest item of this page, `None` if the page is empty.
    pub next_cursor: Option<CursorToken>,
}

pub type PageCache = PrefetchCache<CursorToken, MergedPage>;

/// Fetches a page from every source under one shared outer cursor and merges them.
///
/// Known drift: with `align_source_boundaries` off, the next cursor is the tail
/// of the merged page, so a source whose page ends at a newer point than another
/// source's page gets its items between the two tails skipped.
pub struct MergePaginator {
    sources: Vec<Arc<dyn SourceFetcher>>,
    page_limit: usize,
    combined_limit: Option<usize>,
    align_source_boundaries: bool,
    viewer_ref: String,
    cache: Option<Arc<PageCache>>,
}

impl MergePaginator {
    pub fn new(
        sources: Vec<Arc<dyn SourceFetcher>>,
        settings: &TimelineSettings,
        viewer_ref: impl Into<String>,
    ) -> Self {
        Self {
            sources,
            page_limit: settings.page_limit,
            combined_limit: settings.combined_limit,
            align_source_boundaries: settings.align_source_boundaries,
            viewer_ref: viewer_ref.into(),
            cache: None,
        }
    }

    /// Serves `load_next_page` from `cache` when it holds a fresh page for the cursor.
    pub fn with_cache(mut self, cache: Arc<PageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Loads the page right after `cursor`, or the newest page for `None`.
    pub async fn load_next_page(
        &self,
        cursor: Option<&CursorToken>,
    ) -> Result<MergedPage, TimelineError> {
        let after = cursor.map(cursor::decode).transpose()?;

        if let (Some(cache), Some(token)) = (&self.cache, cursor) {
            cache.expire();
            if let Some(page) = cache.take(token) {
                debug!("Serving page after cursor {token} from prefetch cache");
                return Ok(page);
            }
        }

        self.fetch(cursor, after.as_ref()).await
    }

    /// Loads the page right after `cursor` into the cache. No-op without a cache.
    pub async fn prefetch(&self, cursor: &CursorToken) -> Result<(), TimelineError> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        if cache.get(cursor).is_some() {
            return Ok(());
        }
        let after = cursor::decode(cursor)?;
        let page = self.fetch(Some(cursor), Some(&after)).await?;
        trace!("Prefetched {} items after cursor {cursor}", page.items.len());
        cache.set(cursor.clone(), page);
        Ok(())
    }

    async fn fetch(
        &self,
        cursor: Option<&CursorToken>,
        after: Option<&Cursor>,
    ) -> Result<MergedPage, TimelineError> {
        let request = PageRequest {
            cursor: cursor.cloned(),
            limit: self.page_limit,
            viewer_ref: self.viewer_ref.clone(),
        };
        let request = &request;

        let results = join_all(self.sources.iter().map(|source| async move {
            (source.name().to_owned(), source.fetch_page(request).await)
        }))
        .await;

        let mut pages = Vec::with_capacity(results.len());
        for (source_name, result) in results {
            match result {
                Ok(page) => pages.push(page),
                Err(e) => {
                    warn!("Error fetching a page from source {source_name}: {e:#}");
                    return Err(TimelineError::FetchFailed {
                        source_name,
                        reason: format!("{e:#}"),
                    });
                }
            }
        }

        let page = merge_pages(
            pages,
            after,
            self.combined_limit,
            self.align_source_boundaries,
        );
        debug!(
            "Merged page of {} items from {} sources, has more? {}",
            page.items.len(),
            self.sources.len(),
            page.has_more,
        );
        Ok(page)
    }
}

/// Merges source pages by `createdAt` descending (ties by id descending).
///
/// Items not strictly older than `after` are dropped, so the boundary item is never returned twice.
pub(crate) fn merge_pages(
    pages: Vec<SourcePage>,
    after: Option<&Cursor>,
    combined_limit: Option<usize>,
    align_source_boundaries: bool,
) -> MergedPage {
    let mut has_more = pages.iter().any(|p| p.has_more);

    // The newest tail among the sources that can go further.
    let boundary: Option<Cursor> = if align_source_boundaries {
        pages
            .iter()
            .filter(|p| p.has_more)
            .filter_map(|p| p.items.iter().max_by(|a, b| display_order(a, b)))
            .filter_map(Item::cursor)
            .reduce(|a, b| if a.is_older_than(&b) { b } else { a })
    } else {
        None
    };

    let mut seen = HashSet::new();
    let mut items: Vec<Item> = pages
        .into_iter()
        .flat_map(|p| p.items)
        .filter(|item| {
            if item.is_optimistic() {
                warn!("Source returned a provisional item {}, ignoring it", item.effective_id());
                return false;
            }
            if after.is_some_and(|c| !c.admits(item)) {
                warn!("Source returned item {} at or above the cursor, ignoring it", item.effective_id());
                return false;
            }
            seen.insert(item.effective_id().to_owned())
        })
        .collect();
    items.sort_by(display_order);

    if let Some(boundary) = boundary {
        let before = items.len();
        items.retain(|item| !boundary.admits(item));
        if items.len() < before {
            trace!("Cut {} items past the aligned source boundary", before - items.len());
            has_more = true;
        }
    }

    if let Some(limit) = combined_limit
        && items.len() > limit
    {
        items.truncate(limit);
        has_more = true;
    }

    let next_cursor = items.last().and_then(Item::cursor).map(|c| c.encode());

    MergedPage {
        items,
        has_more,
        next_cursor,
    }
}
