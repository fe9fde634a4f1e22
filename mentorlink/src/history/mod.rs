//! History cache — the read side of a conversation.
//!
//! Serves the UI a consistent, deduplicated, paginated view without every
//! read hitting the durable store or the network. Pages come from the
//! store first; when a page comes back short, the remainder is filled from
//! the remote store and persisted locally (as already-synced), so the next
//! offline read has it too. Fully offline, the last known local state is
//! always served.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use mentorlink_proto::envelope::{ConversationId, MessageId};

use crate::remote::RemoteStore;
use crate::store::record::MessageRecord;
use crate::store::{MessageStore, StoreError};

/// Configuration for the history cache.
#[derive(Debug, Clone)]
pub struct HistorySettings {
    /// Records per page.
    pub page_size: u32,
    /// In-memory cap per conversation; overflow trims oldest entries from
    /// memory only — the durable store is never trimmed here.
    pub max_cached: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_cached: 500,
        }
    }
}

/// Cached view of one conversation.
struct ConversationCache {
    /// Loaded records, oldest→newest.
    messages: Vec<MessageRecord>,
    /// Paging offset consumed so far (next page starts here).
    loaded: u32,
    /// Whether the most recent page fetch came back full.
    has_more: bool,
}

/// Read-side cache over the durable store plus on-demand remote fills.
pub struct HistoryCache<R: RemoteStore> {
    store: Arc<MessageStore>,
    remote: R,
    settings: HistorySettings,
    conversations: Mutex<HashMap<ConversationId, ConversationCache>>,
}

impl<R: RemoteStore> HistoryCache<R> {
    /// Creates a cache over the given store and remote.
    pub fn new(store: Arc<MessageStore>, remote: R, settings: HistorySettings) -> Self {
        Self {
            store,
            remote,
            settings,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// Loads the most recent page of a conversation.
    ///
    /// Returns the cached view when one exists, unless `force_refresh`
    /// discards it first. The returned records are oldest→newest.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on local read/write failure. Remote failures
    /// are absorbed — offline reads serve local state.
    pub async fn load(
        &self,
        conversation: &ConversationId,
        force_refresh: bool,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        if !force_refresh
            && let Some(cache) = self.conversations.lock().get(conversation)
        {
            return Ok(cache.messages.clone());
        }

        let page = self.fetch_page(conversation, 0).await?;
        let loaded = u32::try_from(page.len()).unwrap_or(u32::MAX);
        let has_more = loaded == self.settings.page_size;
        let mut cache = ConversationCache {
            messages: page,
            loaded,
            has_more,
        };
        self.trim(&mut cache);
        let view = cache.messages.clone();
        self.conversations.lock().insert(conversation.clone(), cache);
        Ok(view)
    }

    /// Loads the next (older) page and returns the merged view.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on local read/write failure.
    pub async fn load_more(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let offset = {
            let cache = self.conversations.lock();
            match cache.get(conversation) {
                Some(state) => state.loaded,
                None => 0,
            }
        };
        if offset == 0 {
            return self.load(conversation, false).await;
        }

        let page = self.fetch_page(conversation, offset).await?;
        let fetched = u32::try_from(page.len()).unwrap_or(u32::MAX);
        let has_more = fetched == self.settings.page_size;

        let mut conversations = self.conversations.lock();
        let cache = conversations
            .entry(conversation.clone())
            .or_insert_with(|| ConversationCache {
                messages: Vec::new(),
                loaded: 0,
                has_more: true,
            });

        // Older records go in front; anything already cached wins.
        let known: HashSet<MessageId> = cache.messages.iter().map(|m| m.id.clone()).collect();
        let mut merged: Vec<MessageRecord> = page
            .into_iter()
            .filter(|record| !known.contains(&record.id))
            .collect();
        merged.extend(cache.messages.drain(..));
        cache.messages = merged;
        cache.loaded += fetched;
        cache.has_more = has_more;
        self.trim(cache);
        Ok(cache.messages.clone())
    }

    /// Returns the cached view without touching storage.
    pub fn cached(&self, conversation: &ConversationId) -> Vec<MessageRecord> {
        self.conversations
            .lock()
            .get(conversation)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// Whether older records may still exist beyond what was fetched.
    ///
    /// `true` until a page fetch comes back short; a conversation never
    /// loaded reports `true`.
    pub fn has_more(&self, conversation: &ConversationId) -> bool {
        self.conversations
            .lock()
            .get(conversation)
            .is_none_or(|c| c.has_more)
    }

    /// Case-insensitive substring search over the cached view only.
    ///
    /// Matches message content and sender names. This is a convenience
    /// over already-loaded data, not a remote search.
    pub fn search(&self, conversation: &ConversationId, query: &str) -> Vec<MessageRecord> {
        let needle = query.to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.conversations
            .lock()
            .get(conversation)
            .map(|cache| {
                cache
                    .messages
                    .iter()
                    .filter(|record| {
                        record.content.to_lowercase().contains(&needle)
                            || record.sender_name.to_lowercase().contains(&needle)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops a conversation's cached view (the durable copy is untouched).
    pub fn evict(&self, conversation: &ConversationId) {
        self.conversations.lock().remove(conversation);
    }

    /// One page from the store, filled from the remote when short.
    async fn fetch_page(
        &self,
        conversation: &ConversationId,
        offset: u32,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let mut page = self
            .store
            .messages_page(conversation, self.settings.page_size, offset)?;
        if u32::try_from(page.len()).unwrap_or(u32::MAX) >= self.settings.page_size {
            return Ok(page);
        }

        match self
            .remote
            .conversation_page(conversation, self.settings.page_size, offset)
            .await
        {
            Ok(remote_records) => {
                let mut fetched = 0usize;
                for remote_record in remote_records {
                    // Remote overwrites local on conflict (local flags are
                    // preserved by the store's merge); remote-only records
                    // enter as already-synced.
                    self.store
                        .save_local(&remote_record.into_local_record(), false)?;
                    fetched += 1;
                }
                if fetched > 0 {
                    page = self
                        .store
                        .messages_page(conversation, self.settings.page_size, offset)?;
                }
            }
            Err(e) => {
                tracing::debug!(err = %e, "remote history unavailable, serving local state");
            }
        }
        Ok(page)
    }

    /// Enforces the in-memory cap by trimming oldest entries.
    fn trim(&self, cache: &mut ConversationCache) {
        if cache.messages.len() > self.settings.max_cached {
            let excess = cache.messages.len() - self.settings.max_cached;
            cache.messages.drain(..excess);
        }
    }
}
