use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::{
    api::{
        mention, validate_text, Comment, CommentId, Db, Error, LikeEdge, LikeTarget,
        NotificationKind, Quote, QuoteEdge, QuoteEdgeKind, QuoteId, Reply, ReplyId, UserId,
    },
    Config, NotificationDispatcher, ThreadComment, ThreadReply,
};

/// Result of a like or favorite toggle
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Toggled {
    /// Whether the edge exists after the toggle
    pub active: bool,

    /// Edge count after the toggle, if it could be read back
    pub count: Option<u64>,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
enum EdgeKey {
    Like(UserId, LikeTarget),
    Quote(QuoteEdgeKind, UserId, QuoteId),
}

#[derive(Clone, Copy, Debug)]
enum EdgeOp {
    Toggle,
    Set(bool),
}

/// Serializes the writes of this client on each single edge
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<EdgeKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: EdgeKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            // entries nobody holds nor waits on
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// The content a like lands on, for notifying its owner
struct Liked {
    owner: UserId,
    text: String,
    quote: QuoteId,
}

pub struct ThreadMutator {
    db: Arc<dyn Db>,
    notifier: NotificationDispatcher,
    locks: KeyedLocks,
}

impl ThreadMutator {
    pub fn new(db: Arc<dyn Db>, config: Config) -> ThreadMutator {
        ThreadMutator {
            notifier: NotificationDispatcher::new(db.clone(), config),
            db,
            locks: KeyedLocks::default(),
        }
    }

    pub fn notifier(&self) -> &NotificationDispatcher {
        &self.notifier
    }

    /// Waits until the notifications triggered so far are delivered or dropped
    pub async fn settle_notifications(&self) {
        self.notifier.settle().await
    }

    async fn author_name(&self, user: UserId) -> Result<Option<String>, Error> {
        Ok(self
            .db
            .fetch_users(&[user])
            .await
            .with_context(|| format!("fetching profile of {user:?}"))
            .map_err(Error::persistence)?
            .into_iter()
            .next()
            .map(|u| u.name))
    }

    async fn quote(&self, quote: QuoteId) -> Result<Quote, Error> {
        self.db
            .fetch_quote(quote)
            .await
            .with_context(|| format!("fetching quote {quote:?}"))
            .map_err(Error::persistence)?
            .ok_or(Error::UnknownQuote(quote))
    }

    async fn comment(&self, comment: CommentId) -> Result<Comment, Error> {
        self.db
            .fetch_comment(comment)
            .await
            .with_context(|| format!("fetching comment {comment:?}"))
            .map_err(Error::persistence)?
            .ok_or(Error::UnknownComment(comment))
    }

    async fn reply(&self, reply: ReplyId) -> Result<Option<Reply>, Error> {
        self.db
            .fetch_reply(reply)
            .await
            .with_context(|| format!("fetching reply {reply:?}"))
            .map_err(Error::persistence)
    }

    pub async fn add_comment(
        &self,
        quote: QuoteId,
        author: UserId,
        text: &str,
    ) -> Result<ThreadComment, Error> {
        let text = validate_text(text)?;
        let quote = self.quote(quote).await?;
        let author_name = self.author_name(author).await?;

        let comment = Comment::now(quote.id, author, String::from(text));
        self.db
            .insert_comment(comment.clone())
            .await
            .with_context(|| format!("inserting comment on quote {:?}", quote.id))
            .map_err(|err| {
                tracing::error!(?err, "failed adding comment");
                Error::persistence(err)
            })?;
        tracing::debug!(comment=?comment.id, quote=?quote.id, "added comment");

        self.notifier.spawn(
            quote.owner_id,
            author,
            NotificationKind::Comment,
            comment.text.clone(),
            Some(quote.id),
        );
        Ok(ThreadComment::new(comment, author_name))
    }

    /// Replies to `comment`, or to `parent` if set
    ///
    /// Replying to someone else's reply mentions them at the start of the text.
    pub async fn add_reply(
        &self,
        comment: CommentId,
        author: UserId,
        text: &str,
        parent: Option<ReplyId>,
    ) -> Result<ThreadReply, Error> {
        let text = validate_text(text)?;
        let comment = self.comment(comment).await?;
        let parent = match parent {
            None => None,
            Some(p) => match self.reply(p).await? {
                Some(r) if r.comment_id == comment.id => Some(r),
                _ => {
                    return Err(Error::InvalidParent {
                        comment: comment.id,
                        parent: p,
                    })
                }
            },
        };
        let author_name = self.author_name(author).await?;

        let text = match &parent {
            Some(p) if p.owner_id != author => {
                let name = match self.author_name(p.owner_id).await? {
                    Some(name) => name,
                    None => {
                        tracing::debug!(parent=?p.id, owner=?p.owner_id, "replied-to user has no profile");
                        mention::anonymous_name(p.owner_id)
                    }
                };
                mention::with_mention(text, &name).into_owned()
            }
            _ => String::from(text),
        };

        let reply = Reply::now(comment.id, parent.as_ref().map(|p| p.id), author, text);
        self.db
            .insert_reply(reply.clone())
            .await
            .with_context(|| format!("inserting reply on comment {:?}", comment.id))
            .map_err(|err| {
                tracing::error!(?err, "failed adding reply");
                Error::persistence(err)
            })?;
        tracing::debug!(reply=?reply.id, comment=?comment.id, "added reply");

        let recipient = parent.map(|p| p.owner_id).unwrap_or(comment.owner_id);
        self.notifier.spawn(
            recipient,
            author,
            NotificationKind::Comment,
            reply.text.clone(),
            Some(comment.quote_id),
        );
        Ok(ThreadReply::new(reply, author_name))
    }

    async fn liked(&self, target: LikeTarget) -> Result<Liked, Error> {
        match target {
            LikeTarget::Comment(c) => {
                let comment = self.comment(c).await?;
                Ok(Liked {
                    owner: comment.owner_id,
                    text: comment.text,
                    quote: comment.quote_id,
                })
            }
            LikeTarget::Reply(r) => {
                let reply = self.reply(r).await?.ok_or(Error::UnknownReply(r))?;
                let comment = self.comment(reply.comment_id).await?;
                Ok(Liked {
                    owner: reply.owner_id,
                    text: reply.text,
                    quote: comment.quote_id,
                })
            }
        }
    }

    /// Likes `target` if `actor` does not like it yet, unlikes it otherwise
    pub async fn toggle_like(&self, target: LikeTarget, actor: UserId) -> Result<Toggled, Error> {
        self.like_op(target, actor, EdgeOp::Toggle).await
    }

    /// Makes `actor` like `target` or not, whatever the current state
    pub async fn set_like(
        &self,
        target: LikeTarget,
        actor: UserId,
        active: bool,
    ) -> Result<Toggled, Error> {
        self.like_op(target, actor, EdgeOp::Set(active)).await
    }

    async fn like_op(
        &self,
        target: LikeTarget,
        actor: UserId,
        op: EdgeOp,
    ) -> Result<Toggled, Error> {
        // queue on the edge before any other await, so that calls apply in
        // the order they were made
        let guard = self.locks.lock(EdgeKey::Like(actor, target)).await;
        let liked = self.liked(target).await?;
        let (active, inserted) = self
            .apply_like(target, actor, op)
            .await
            .map_err(|err| {
                tracing::error!(?target, ?actor, ?err, "failed writing like");
                Error::persistence(err)
            })?;
        drop(guard);
        tracing::debug!(?target, ?actor, active, "like written");

        let count = match self.db.count_likes(target).await {
            Ok(c) => Some(c),
            Err(err) => {
                tracing::warn!(?target, ?err, "failed reading back like count");
                None
            }
        };
        if inserted {
            self.notifier.spawn(
                liked.owner,
                actor,
                NotificationKind::Like,
                liked.text,
                Some(liked.quote),
            );
        }
        Ok(Toggled { active, count })
    }

    /// Returns whether the edge is now present, and whether this call
    /// created it
    async fn apply_like(
        &self,
        target: LikeTarget,
        actor: UserId,
        op: EdgeOp,
    ) -> anyhow::Result<(bool, bool)> {
        let insert = match op {
            EdgeOp::Set(active) => active,
            EdgeOp::Toggle => !self
                .db
                .delete_like(actor, target)
                .await
                .with_context(|| format!("unliking {target:?}"))?,
        };
        if !insert {
            if let EdgeOp::Set(_) = op {
                self.db
                    .delete_like(actor, target)
                    .await
                    .with_context(|| format!("unliking {target:?}"))?;
            }
            return Ok((false, false));
        }
        // losing a race against another insert still leaves the edge liked
        let inserted = self
            .db
            .insert_like(LikeEdge::now(actor, target))
            .await
            .with_context(|| format!("liking {target:?}"))?;
        Ok((true, inserted))
    }

    pub async fn toggle_favorite(&self, quote: QuoteId, actor: UserId) -> Result<Toggled, Error> {
        self.quote_edge_op(QuoteEdgeKind::Favorite, quote, actor, EdgeOp::Toggle)
            .await
    }

    pub async fn toggle_quote_like(
        &self,
        quote: QuoteId,
        actor: UserId,
    ) -> Result<Toggled, Error> {
        self.quote_edge_op(QuoteEdgeKind::Like, quote, actor, EdgeOp::Toggle)
            .await
    }

    pub async fn set_quote_edge(
        &self,
        kind: QuoteEdgeKind,
        quote: QuoteId,
        actor: UserId,
        active: bool,
    ) -> Result<Toggled, Error> {
        self.quote_edge_op(kind, quote, actor, EdgeOp::Set(active))
            .await
    }

    async fn quote_edge_op(
        &self,
        kind: QuoteEdgeKind,
        quote: QuoteId,
        actor: UserId,
        op: EdgeOp,
    ) -> Result<Toggled, Error> {
        let guard = self.locks.lock(EdgeKey::Quote(kind, actor, quote)).await;
        let quote = self.quote(quote).await?;
        let (active, inserted) = self
            .apply_quote_edge(kind, &quote, actor, op)
            .await
            .map_err(|err| {
                tracing::error!(?kind, quote=?quote.id, ?actor, ?err, "failed writing quote edge");
                Error::persistence(err)
            })?;
        drop(guard);
        tracing::debug!(?kind, quote=?quote.id, ?actor, active, "quote edge written");

        let count = match self.db.count_quote_edges(kind, quote.id).await {
            Ok(c) => Some(c),
            Err(err) => {
                tracing::warn!(?kind, quote=?quote.id, ?err, "failed reading back edge count");
                None
            }
        };
        if inserted {
            let notif = match kind {
                QuoteEdgeKind::Like => NotificationKind::Like,
                QuoteEdgeKind::Favorite => NotificationKind::Favorite,
            };
            self.notifier
                .spawn(quote.owner_id, actor, notif, quote.text, Some(quote.id));
        }
        Ok(Toggled { active, count })
    }

    async fn apply_quote_edge(
        &self,
        kind: QuoteEdgeKind,
        quote: &Quote,
        actor: UserId,
        op: EdgeOp,
    ) -> anyhow::Result<(bool, bool)> {
        let insert = match op {
            EdgeOp::Set(active) => active,
            EdgeOp::Toggle => !self
                .db
                .delete_quote_edge(kind, actor, quote.id)
                .await
                .with_context(|| format!("removing {kind:?} of quote {:?}", quote.id))?,
        };
        if !insert {
            if let EdgeOp::Set(_) = op {
                self.db
                    .delete_quote_edge(kind, actor, quote.id)
                    .await
                    .with_context(|| format!("removing {kind:?} of quote {:?}", quote.id))?;
            }
            return Ok((false, false));
        }
        let inserted = self
            .db
            .insert_quote_edge(QuoteEdge::now(kind, actor, quote))
            .await
            .with_context(|| format!("adding {kind:?} of quote {:?}", quote.id))?;
        Ok((true, inserted))
    }
}
