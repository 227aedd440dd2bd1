use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    ChangeFilter, ChangeStream, Comment, CommentId, LikeEdge, LikeTarget, Notification,
    NotificationId, Quote, QuoteEdge, QuoteEdgeKind, QuoteId, Reply, ReplyId, User, UserId,
};

/// The persistence collaborator
///
/// Every call may fail, take arbitrarily long, or complete in any order
/// relative to other calls. Implementations must enforce uniqueness of the
/// edges themselves: callers only deduplicate for responsiveness.
#[async_trait]
pub trait Db: Send + Sync {
    /// Monotonic counter bumped by every write that could change the thread
    /// or the counters of this quote
    async fn revision(&self, quote: QuoteId) -> anyhow::Result<u64>;

    async fn fetch_quote(&self, quote: QuoteId) -> anyhow::Result<Option<Quote>>;
    async fn insert_quote(&self, quote: Quote) -> anyhow::Result<()>;

    async fn fetch_users(&self, users: &[UserId]) -> anyhow::Result<Vec<User>>;
    async fn insert_user(&self, user: User) -> anyhow::Result<()>;

    /// Ordered by creation date, oldest first
    async fn fetch_comments(&self, quote: QuoteId) -> anyhow::Result<Vec<Comment>>;
    async fn fetch_comment(&self, comment: CommentId) -> anyhow::Result<Option<Comment>>;
    async fn insert_comment(&self, comment: Comment) -> anyhow::Result<()>;

    /// All the replies, at any nesting depth, of these comments, ordered by
    /// creation date, oldest first
    async fn fetch_replies(&self, comments: &[CommentId]) -> anyhow::Result<Vec<Reply>>;
    async fn fetch_reply(&self, reply: ReplyId) -> anyhow::Result<Option<Reply>>;
    async fn insert_reply(&self, reply: Reply) -> anyhow::Result<()>;

    async fn fetch_likes(&self, targets: &[LikeTarget]) -> anyhow::Result<Vec<LikeEdge>>;
    async fn count_likes(&self, target: LikeTarget) -> anyhow::Result<u64>;
    /// Returns false if the edge was already there
    async fn insert_like(&self, like: LikeEdge) -> anyhow::Result<bool>;
    /// Returns false if there was no edge to remove
    async fn delete_like(&self, owner: UserId, target: LikeTarget) -> anyhow::Result<bool>;

    async fn fetch_quote_edges_of(&self, owner: UserId) -> anyhow::Result<Vec<QuoteEdge>>;
    async fn has_quote_edge(
        &self,
        kind: QuoteEdgeKind,
        owner: UserId,
        quote: QuoteId,
    ) -> anyhow::Result<bool>;
    async fn count_quote_edges(&self, kind: QuoteEdgeKind, quote: QuoteId) -> anyhow::Result<u64>;
    /// Returns false if the edge was already there
    async fn insert_quote_edge(&self, edge: QuoteEdge) -> anyhow::Result<bool>;
    /// Returns false if there was no edge to remove
    async fn delete_quote_edge(
        &self,
        kind: QuoteEdgeKind,
        owner: UserId,
        quote: QuoteId,
    ) -> anyhow::Result<bool>;

    async fn insert_notification(&self, notif: Notification) -> anyhow::Result<()>;
    /// Newest first
    async fn fetch_notifications(&self, user: UserId) -> anyhow::Result<Vec<Notification>>;
    /// Returns false if no notification with this id belongs to this user
    async fn mark_notification_read(
        &self,
        user: UserId,
        notif: NotificationId,
    ) -> anyhow::Result<bool>;

    async fn subscribe(&self, filter: ChangeFilter) -> anyhow::Result<ChangeStream>;
}

/// Number of edges per target, with zero for targets nobody liked
pub fn count_by_target(
    targets: &[LikeTarget],
    likes: &[LikeEdge],
) -> HashMap<LikeTarget, u64> {
    let mut res = targets.iter().map(|t| (*t, 0)).collect::<HashMap<_, _>>();
    for l in likes {
        *res.entry(l.target).or_insert(0) += 1;
    }
    res
}
