use std::{collections::HashMap, num::NonZeroUsize, sync::Arc};

use anyhow::Context;
use lru::LruCache;
use parking_lot::Mutex;

use crate::{
    api::{Db, Error, LikeTarget, QuoteId, UserId},
    Config, Thread,
};

/// Loads whole threads as consistent snapshots
pub struct ThreadRepository {
    db: Arc<dyn Db>,
    config: Config,
    /// Last snapshots loaded, least recently loaded evicted first
    previous: Mutex<LruCache<(QuoteId, Option<UserId>), Arc<Thread>>>,
}

impl ThreadRepository {
    pub fn new(db: Arc<dyn Db>, config: Config) -> ThreadRepository {
        let capacity = NonZeroUsize::new(config.cached_threads).unwrap_or(NonZeroUsize::MIN);
        ThreadRepository {
            db,
            config,
            previous: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Loads the thread of `quote` as seen by `viewer`
    ///
    /// A quote that does not exist simply has an empty thread.
    pub async fn load_thread(
        &self,
        quote: QuoteId,
        viewer: Option<UserId>,
    ) -> Result<Thread, Error> {
        let thread = tokio::time::timeout(
            self.config.load_timeout,
            self.load_consistent(quote, viewer),
        )
        .await
        .unwrap_or(Err(Error::Timeout))?;
        self.previous
            .lock()
            .put((quote, viewer), Arc::new(thread.clone()));
        Ok(thread)
    }

    /// Same as `load_thread`, but falls back to the last successfully loaded
    /// snapshot, or to an empty thread
    pub async fn load_thread_or_previous(
        &self,
        quote: QuoteId,
        viewer: Option<UserId>,
    ) -> Arc<Thread> {
        match self.load_thread(quote, viewer).await {
            Ok(t) => Arc::new(t),
            Err(err) => {
                tracing::warn!(?quote, %err, "failed loading thread, showing previous state");
                self.previous
                    .lock()
                    .get(&(quote, viewer))
                    .cloned()
                    .unwrap_or_else(|| Arc::new(Thread::empty(quote)))
            }
        }
    }

    // The revision is read around the fetches: if it moved, the fetches may
    // have seen different points in time and are thrown away
    async fn load_consistent(
        &self,
        quote: QuoteId,
        viewer: Option<UserId>,
    ) -> Result<Thread, Error> {
        for attempt in 0..self.config.snapshot_attempts.max(1) {
            let before = self
                .db
                .revision(quote)
                .await
                .with_context(|| format!("reading revision of quote {quote:?}"))
                .map_err(Error::persistence)?;
            let thread = self
                .fetch(quote, viewer)
                .await
                .map_err(Error::persistence)?;
            let after = self
                .db
                .revision(quote)
                .await
                .with_context(|| format!("reading revision of quote {quote:?}"))
                .map_err(Error::persistence)?;
            if before == after {
                return Ok(thread);
            }
            tracing::debug!(?quote, attempt, before, after, "thread changed while loading");
        }
        Err(Error::InconsistentSnapshot(quote))
    }

    async fn fetch(&self, quote: QuoteId, viewer: Option<UserId>) -> anyhow::Result<Thread> {
        let comments = self
            .db
            .fetch_comments(quote)
            .await
            .with_context(|| format!("fetching comments of quote {quote:?}"))?;
        if comments.is_empty() {
            return Ok(Thread::empty(quote));
        }

        let comment_ids = comments.iter().map(|c| c.id).collect::<Vec<_>>();
        let replies = self
            .db
            .fetch_replies(&comment_ids)
            .await
            .with_context(|| format!("fetching replies of quote {quote:?}"))?;

        let targets = comment_ids
            .iter()
            .map(|c| LikeTarget::Comment(*c))
            .chain(replies.iter().map(|r| LikeTarget::Reply(r.id)))
            .collect::<Vec<_>>();
        let likes = self
            .db
            .fetch_likes(&targets)
            .await
            .with_context(|| format!("fetching likes of quote {quote:?}"))?;

        let mut authors = comments
            .iter()
            .map(|c| c.owner_id)
            .chain(replies.iter().map(|r| r.owner_id))
            .collect::<Vec<_>>();
        authors.sort_unstable();
        authors.dedup();
        let users = self
            .db
            .fetch_users(&authors)
            .await
            .with_context(|| format!("fetching authors of quote {quote:?}"))?
            .into_iter()
            .map(|u| (u.id, u))
            .collect::<HashMap<_, _>>();

        Ok(Thread::build(quote, comments, replies, &likes, &users, viewer))
    }
}
