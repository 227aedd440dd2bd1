use std::{collections::HashMap, time::Duration};

use anyhow::{anyhow, ensure};
use async_trait::async_trait;
use futures::channel::mpsc;
use parking_lot::Mutex;
use quill_api::{
    Change, ChangeFilter, ChangeStream, Comment, CommentId, Db, LikeEdge, LikeTarget,
    Notification, NotificationId, Quote, QuoteEdge, QuoteEdgeKind, QuoteId, Reply, ReplyId, Table,
    User, UserId,
};

/// In-memory backend, behaving like the hosted database would
pub struct MockServer {
    state: Mutex<State>,
    faults: Mutex<Faults>,
}

#[derive(Default)]
struct State {
    users: HashMap<UserId, User>,
    quotes: HashMap<QuoteId, Quote>,
    comments: HashMap<CommentId, Comment>,
    replies: HashMap<ReplyId, Reply>,
    likes: HashMap<(UserId, LikeTarget), LikeEdge>,
    quote_edges: HashMap<(QuoteEdgeKind, UserId, QuoteId), QuoteEdge>,
    notifications: Vec<Notification>,
    revisions: HashMap<QuoteId, u64>,
    feeds: Vec<(ChangeFilter, mpsc::UnboundedSender<Change>)>,
    num_writes: usize,
}

#[derive(Debug, Default)]
struct Faults {
    fail_reads: bool,
    fail_writes: bool,
    fail_next_writes: usize,
    stall_writes: bool,
    delay_next_read: Option<Duration>,
    fail_notifications: bool,
    stall_notifications: bool,
    churn_revisions: bool,
}

impl State {
    fn quote_of(&self, target: LikeTarget) -> Option<QuoteId> {
        let comment = match target {
            LikeTarget::Comment(c) => c,
            LikeTarget::Reply(r) => self.replies.get(&r)?.comment_id,
        };
        self.comments.get(&comment).map(|c| c.quote_id)
    }

    fn relay(&mut self, table: Table, quote_id: Option<QuoteId>, user_id: Option<UserId>) {
        self.num_writes += 1;
        if let Some(q) = quote_id {
            *self.revisions.entry(q).or_insert(0) += 1;
        }
        let change = Change {
            table,
            quote_id,
            user_id,
        };
        self.feeds.retain(|(filter, f)| {
            !filter.matches(&change) || matches!(f.unbounded_send(change.clone()), Ok(()))
        });
    }
}

impl MockServer {
    pub fn new() -> MockServer {
        MockServer {
            state: Mutex::new(State::default()),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Make every read fail until reset
    pub fn set_fail_reads(&self, fail: bool) {
        self.faults.lock().fail_reads = fail;
    }

    /// Make every write fail until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.faults.lock().fail_writes = fail;
    }

    /// Make only the next `n` writes fail
    pub fn fail_next_writes(&self, n: usize) {
        self.faults.lock().fail_next_writes = n;
    }

    /// Make writes hang forever until reset
    pub fn set_stall_writes(&self, stall: bool) {
        self.faults.lock().stall_writes = stall;
    }

    /// Make the next read answer only after `delay`
    pub fn delay_next_read(&self, delay: Duration) {
        self.faults.lock().delay_next_read = Some(delay);
    }

    pub fn set_fail_notifications(&self, fail: bool) {
        self.faults.lock().fail_notifications = fail;
    }

    /// Make notification writes hang forever until reset
    pub fn set_stall_notifications(&self, stall: bool) {
        self.faults.lock().stall_notifications = stall;
    }

    /// Bump the revision of a quote on each read of it, as if another client
    /// were continuously writing to it
    pub fn set_churn_revisions(&self, churn: bool) {
        self.faults.lock().churn_revisions = churn;
    }

    /// Return the number of writes that reached the store
    pub fn test_num_writes(&self) -> usize {
        self.state.lock().num_writes
    }

    pub fn test_notifications(&self) -> Vec<Notification> {
        self.state.lock().notifications.clone()
    }

    pub fn test_likes_on(&self, target: LikeTarget) -> Vec<LikeEdge> {
        self.state
            .lock()
            .likes
            .values()
            .filter(|l| l.target == target)
            .cloned()
            .collect()
    }

    pub fn test_num_feeds(&self) -> usize {
        self.state.lock().feeds.len()
    }

    async fn read_gate(&self, what: &str) -> anyhow::Result<()> {
        let delay = {
            let mut faults = self.faults.lock();
            ensure!(!faults.fail_reads, "mock read failure: {what}");
            faults.delay_next_read.take()
        };
        if let Some(delay) = delay {
            tracing::debug!(?delay, "delaying read {what}");
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn write_gate(&self, what: &str) -> anyhow::Result<()> {
        let stall = {
            let mut faults = self.faults.lock();
            if faults.fail_next_writes > 0 {
                faults.fail_next_writes -= 1;
                return Err(anyhow!("mock write failure: {what}"));
            }
            ensure!(!faults.fail_writes, "mock write failure: {what}");
            faults.stall_writes
        };
        if stall {
            tracing::debug!("stalling write {what}");
            futures::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait]
impl Db for MockServer {
    async fn revision(&self, quote: QuoteId) -> anyhow::Result<u64> {
        self.read_gate("revision").await?;
        let churn = self.faults.lock().churn_revisions;
        let mut state = self.state.lock();
        let rev = state.revisions.entry(quote).or_insert(0);
        if churn {
            *rev += 1;
        }
        Ok(*rev)
    }

    async fn fetch_quote(&self, quote: QuoteId) -> anyhow::Result<Option<Quote>> {
        self.read_gate("fetch_quote").await?;
        Ok(self.state.lock().quotes.get(&quote).cloned())
    }

    async fn insert_quote(&self, quote: Quote) -> anyhow::Result<()> {
        self.write_gate("insert_quote").await?;
        let mut state = self.state.lock();
        ensure!(
            !state.quotes.contains_key(&quote.id),
            "quote {:?} already exists",
            quote.id
        );
        let id = quote.id;
        state.quotes.insert(id, quote);
        state.relay(Table::Quotes, Some(id), None);
        Ok(())
    }

    async fn fetch_users(&self, users: &[UserId]) -> anyhow::Result<Vec<User>> {
        self.read_gate("fetch_users").await?;
        let state = self.state.lock();
        Ok(users
            .iter()
            .filter_map(|u| state.users.get(u))
            .cloned()
            .collect())
    }

    async fn insert_user(&self, user: User) -> anyhow::Result<()> {
        self.write_gate("insert_user").await?;
        let mut state = self.state.lock();
        ensure!(
            !state.users.contains_key(&user.id),
            "user {:?} already exists",
            user.id
        );
        state.users.insert(user.id, user);
        state.num_writes += 1;
        Ok(())
    }

    async fn fetch_comments(&self, quote: QuoteId) -> anyhow::Result<Vec<Comment>> {
        self.read_gate("fetch_comments").await?;
        let mut res = self
            .state
            .lock()
            .comments
            .values()
            .filter(|c| c.quote_id == quote)
            .cloned()
            .collect::<Vec<_>>();
        res.sort_unstable_by_key(|c| (c.date, c.id));
        Ok(res)
    }

    async fn fetch_comment(&self, comment: CommentId) -> anyhow::Result<Option<Comment>> {
        self.read_gate("fetch_comment").await?;
        Ok(self.state.lock().comments.get(&comment).cloned())
    }

    async fn insert_comment(&self, comment: Comment) -> anyhow::Result<()> {
        self.write_gate("insert_comment").await?;
        let mut state = self.state.lock();
        ensure!(
            state.quotes.contains_key(&comment.quote_id),
            "comment {:?} references missing quote {:?}",
            comment.id,
            comment.quote_id
        );
        ensure!(
            !state.comments.contains_key(&comment.id),
            "comment {:?} already exists",
            comment.id
        );
        let quote = comment.quote_id;
        state.comments.insert(comment.id, comment);
        state.relay(Table::Comments, Some(quote), None);
        Ok(())
    }

    async fn fetch_replies(&self, comments: &[CommentId]) -> anyhow::Result<Vec<Reply>> {
        self.read_gate("fetch_replies").await?;
        let mut res = self
            .state
            .lock()
            .replies
            .values()
            .filter(|r| comments.contains(&r.comment_id))
            .cloned()
            .collect::<Vec<_>>();
        res.sort_unstable_by_key(|r| (r.date, r.id));
        Ok(res)
    }

    async fn fetch_reply(&self, reply: ReplyId) -> anyhow::Result<Option<Reply>> {
        self.read_gate("fetch_reply").await?;
        Ok(self.state.lock().replies.get(&reply).cloned())
    }

    async fn insert_reply(&self, reply: Reply) -> anyhow::Result<()> {
        self.write_gate("insert_reply").await?;
        let mut state = self.state.lock();
        let quote = state
            .comments
            .get(&reply.comment_id)
            .map(|c| c.quote_id)
            .ok_or_else(|| {
                anyhow!(
                    "reply {:?} references missing comment {:?}",
                    reply.id,
                    reply.comment_id
                )
            })?;
        if let Some(parent) = reply.parent_id {
            ensure!(
                state.replies.contains_key(&parent),
                "reply {:?} references missing parent {:?}",
                reply.id,
                parent
            );
        }
        ensure!(
            !state.replies.contains_key(&reply.id),
            "reply {:?} already exists",
            reply.id
        );
        state.replies.insert(reply.id, reply);
        state.relay(Table::Replies, Some(quote), None);
        Ok(())
    }

    async fn fetch_likes(&self, targets: &[LikeTarget]) -> anyhow::Result<Vec<LikeEdge>> {
        self.read_gate("fetch_likes").await?;
        Ok(self
            .state
            .lock()
            .likes
            .values()
            .filter(|l| targets.contains(&l.target))
            .cloned()
            .collect())
    }

    async fn count_likes(&self, target: LikeTarget) -> anyhow::Result<u64> {
        self.read_gate("count_likes").await?;
        Ok(self
            .state
            .lock()
            .likes
            .values()
            .filter(|l| l.target == target)
            .count() as u64)
    }

    async fn insert_like(&self, like: LikeEdge) -> anyhow::Result<bool> {
        self.write_gate("insert_like").await?;
        let mut state = self.state.lock();
        let quote = state
            .quote_of(like.target)
            .ok_or_else(|| anyhow!("like references missing target {:?}", like.target))?;
        let key = (like.owner_id, like.target);
        if state.likes.contains_key(&key) {
            return Ok(false);
        }
        let table = match like.target {
            LikeTarget::Comment(_) => Table::CommentLikes,
            LikeTarget::Reply(_) => Table::ReplyLikes,
        };
        let owner = like.owner_id;
        state.likes.insert(key, like);
        state.relay(table, Some(quote), Some(owner));
        Ok(true)
    }

    async fn delete_like(&self, owner: UserId, target: LikeTarget) -> anyhow::Result<bool> {
        self.write_gate("delete_like").await?;
        let mut state = self.state.lock();
        if state.likes.remove(&(owner, target)).is_none() {
            return Ok(false);
        }
        let quote = state.quote_of(target);
        let table = match target {
            LikeTarget::Comment(_) => Table::CommentLikes,
            LikeTarget::Reply(_) => Table::ReplyLikes,
        };
        state.relay(table, quote, Some(owner));
        Ok(true)
    }

    async fn fetch_quote_edges_of(&self, owner: UserId) -> anyhow::Result<Vec<QuoteEdge>> {
        self.read_gate("fetch_quote_edges_of").await?;
        let mut res = self
            .state
            .lock()
            .quote_edges
            .values()
            .filter(|e| e.owner_id == owner)
            .cloned()
            .collect::<Vec<_>>();
        res.sort_unstable_by_key(|e| (e.date, e.quote_id, e.kind));
        Ok(res)
    }

    async fn has_quote_edge(
        &self,
        kind: QuoteEdgeKind,
        owner: UserId,
        quote: QuoteId,
    ) -> anyhow::Result<bool> {
        self.read_gate("has_quote_edge").await?;
        Ok(self
            .state
            .lock()
            .quote_edges
            .contains_key(&(kind, owner, quote)))
    }

    async fn count_quote_edges(&self, kind: QuoteEdgeKind, quote: QuoteId) -> anyhow::Result<u64> {
        self.read_gate("count_quote_edges").await?;
        Ok(self
            .state
            .lock()
            .quote_edges
            .keys()
            .filter(|(k, _, q)| *k == kind && *q == quote)
            .count() as u64)
    }

    async fn insert_quote_edge(&self, edge: QuoteEdge) -> anyhow::Result<bool> {
        self.write_gate("insert_quote_edge").await?;
        let mut state = self.state.lock();
        ensure!(
            state.quotes.contains_key(&edge.quote_id),
            "quote edge references missing quote {:?}",
            edge.quote_id
        );
        let key = (edge.kind, edge.owner_id, edge.quote_id);
        if state.quote_edges.contains_key(&key) {
            return Ok(false);
        }
        state.quote_edges.insert(key, edge);
        state.relay(Table::QuoteEdges, Some(key.2), Some(key.1));
        Ok(true)
    }

    async fn delete_quote_edge(
        &self,
        kind: QuoteEdgeKind,
        owner: UserId,
        quote: QuoteId,
    ) -> anyhow::Result<bool> {
        self.write_gate("delete_quote_edge").await?;
        let mut state = self.state.lock();
        if state.quote_edges.remove(&(kind, owner, quote)).is_none() {
            return Ok(false);
        }
        state.relay(Table::QuoteEdges, Some(quote), Some(owner));
        Ok(true)
    }

    async fn insert_notification(&self, notif: Notification) -> anyhow::Result<()> {
        let stall = {
            let faults = self.faults.lock();
            ensure!(!faults.fail_notifications, "mock notification failure");
            faults.stall_notifications
        };
        if stall {
            tracing::debug!("stalling notification write");
            futures::future::pending::<()>().await;
        }
        self.write_gate("insert_notification").await?;
        let mut state = self.state.lock();
        let user = notif.user_id;
        state.notifications.push(notif);
        state.relay(Table::Notifications, None, Some(user));
        Ok(())
    }

    async fn fetch_notifications(&self, user: UserId) -> anyhow::Result<Vec<Notification>> {
        self.read_gate("fetch_notifications").await?;
        let mut res = self
            .state
            .lock()
            .notifications
            .iter()
            .filter(|n| n.user_id == user)
            .cloned()
            .collect::<Vec<_>>();
        res.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(res)
    }

    async fn mark_notification_read(
        &self,
        user: UserId,
        notif: NotificationId,
    ) -> anyhow::Result<bool> {
        self.write_gate("mark_notification_read").await?;
        let mut state = self.state.lock();
        match state
            .notifications
            .iter_mut()
            .find(|n| n.id == notif && n.user_id == user)
        {
            None => Ok(false),
            Some(n) => {
                n.read = true;
                state.relay(Table::Notifications, None, Some(user));
                Ok(true)
            }
        }
    }

    async fn subscribe(&self, filter: ChangeFilter) -> anyhow::Result<ChangeStream> {
        self.read_gate("subscribe").await?;
        let (sender, receiver) = mpsc::unbounded();
        self.state.lock().feeds.push((filter, sender));
        Ok(receiver)
    }
}
