//! Paged loading of pending messages

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use volley_common::{CampaignId, Message, MessageId, MessageStatus, tracing};

use crate::store::{MessageStore, PageRequest, StoreError};

/// Streams a campaign's pending messages one page at a time
///
/// Pages are keyed by message id, so messages that stay pending after being
/// dispatched (deferred or awaiting retry) are never loaded twice.
#[derive(Debug)]
pub struct BatchLoader {
    store: Arc<dyn MessageStore>,
    campaign_id: CampaignId,
    page_size: usize,
    page_pause: Duration,
    cursor: Option<MessageId>,
    pages_loaded: usize,
    exhausted: bool,
}

impl BatchLoader {
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        campaign_id: CampaignId,
        page_size: usize,
        page_pause: Duration,
    ) -> Self {
        Self {
            store,
            campaign_id,
            page_size,
            page_pause,
            cursor: None,
            pages_loaded: 0,
            exhausted: false,
        }
    }

    /// Load the next page
    ///
    /// Returns `None` once the campaign has no more pending messages or
    /// `cancel` has fired. Every page after the first is preceded by the
    /// configured pause.
    ///
    /// # Errors
    ///
    /// Returns the store error if a page cannot be read
    pub async fn next_page(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<Message>>, StoreError> {
        if self.exhausted || cancel.is_cancelled() {
            return Ok(None);
        }

        if self.pages_loaded > 0 && !self.page_pause.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return Ok(None),
                () = tokio::time::sleep(self.page_pause) => {}
            }
        }

        let request = PageRequest {
            campaign_id: self.campaign_id,
            after: self.cursor,
            limit: self.page_size,
        };
        let mut page = self.store.load_pending_page(&request).await?;

        let Some(last) = page.last() else {
            self.exhausted = true;
            return Ok(None);
        };

        self.cursor = Some(last.id);
        self.pages_loaded += 1;
        if page.len() < self.page_size {
            self.exhausted = true;
        }

        page.retain(|message| message.status == MessageStatus::Pending);

        tracing::debug!(
            campaign_id = %self.campaign_id,
            page = self.pages_loaded,
            messages = page.len(),
            "Loaded page of pending messages"
        );

        Ok(Some(page))
    }

    pub const fn pages_loaded(&self) -> usize {
        self.pages_loaded
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{memory::MemoryMessageStore, store::StatusUpdate};

    fn seeded(count: usize) -> (Arc<MemoryMessageStore>, CampaignId) {
        let store = Arc::new(MemoryMessageStore::new());
        let campaign_id = CampaignId::generate();
        store
            .insert_all((0..count).map(|i| Message::new(campaign_id, format!("+1555000{i:04}"))))
            .unwrap();
        (store, campaign_id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pages_cover_every_message_once() {
        let (store, campaign_id) = seeded(7);
        let mut loader = BatchLoader::new(store.clone(), campaign_id, 3, Duration::from_millis(100));
        let cancel = CancellationToken::new();

        let mut sizes = Vec::new();
        let mut seen = Vec::new();
        while let Some(page) = loader.next_page(&cancel).await.unwrap() {
            sizes.push(page.len());
            seen.extend(page.into_iter().map(|m| m.id));
        }

        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(loader.pages_loaded(), 3);
        let expected: Vec<_> = store.messages_for(campaign_id).into_iter().map(|m| m.id).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_left_pending_are_not_reloaded() {
        let (store, campaign_id) = seeded(4);
        let mut loader = BatchLoader::new(store.clone(), campaign_id, 2, Duration::ZERO);
        let cancel = CancellationToken::new();

        let first = loader.next_page(&cancel).await.unwrap().unwrap();
        // A deferred message keeps its pending status
        store
            .update_message_status(&StatusUpdate::pending(first[0].id, "circuit open", 0))
            .await
            .unwrap();

        let second = loader.next_page(&cancel).await.unwrap().unwrap();
        assert!(second.iter().all(|m| !first.iter().any(|f| f.id == m.id)));
        assert_eq!(second.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_multiple_ends_with_empty_page() {
        let (store, campaign_id) = seeded(4);
        let mut loader = BatchLoader::new(store, campaign_id, 2, Duration::ZERO);
        let cancel = CancellationToken::new();

        assert_eq!(loader.next_page(&cancel).await.unwrap().map(|p| p.len()), Some(2));
        assert_eq!(loader.next_page(&cancel).await.unwrap().map(|p| p.len()), Some(2));
        assert!(loader.next_page(&cancel).await.unwrap().is_none());
        assert!(loader.next_page(&cancel).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_between_pages() {
        let (store, campaign_id) = seeded(4);
        let mut loader = BatchLoader::new(store, campaign_id, 2, Duration::from_millis(100));
        let cancel = CancellationToken::new();

        let started = tokio::time::Instant::now();
        loader.next_page(&cancel).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);

        loader.next_page(&cancel).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ends_loading() {
        let (store, campaign_id) = seeded(4);
        let mut loader = BatchLoader::new(store, campaign_id, 2, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        loader.next_page(&cancel).await.unwrap();

        let pending = loader.next_page(&cancel);
        cancel.cancel();
        assert!(pending.await.unwrap().is_none());
        assert_eq!(loader.pages_loaded(), 1);
    }
}
