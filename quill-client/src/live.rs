use std::{collections::HashMap, sync::Arc};

use futures::{channel::mpsc, StreamExt};
use parking_lot::Mutex;

use crate::{
    api::{ChangeFilter, CommentId, Db, Error, LikeTarget, QuoteId, ReplyId, UserId},
    optimistic::Overlay,
    Config, Thread, ThreadComment, ThreadMutator, ThreadReply, ThreadRepository, Toggled,
};

struct LiveState {
    /// Last snapshot loaded from the server
    base: Arc<Thread>,
    overlays: HashMap<LikeTarget, Overlay>,
    /// `base` with the local likes applied on top of it
    visible: Arc<Thread>,
    next_op: u64,
    observers: Vec<mpsc::UnboundedSender<Arc<Thread>>>,
}

impl LiveState {
    fn refresh(&mut self) {
        let mut visible = (*self.base).clone();
        for (target, overlay) in self.overlays.iter() {
            if !visible.set_like_state(target, overlay.active(), overlay.count()) {
                tracing::debug!(?target, "pending like on a node that is not in the thread");
            }
        }
        self.visible = Arc::new(visible);
        let visible = self.visible.clone();
        self.observers
            .retain(|o| matches!(o.unbounded_send(visible.clone()), Ok(())));
    }

    fn set_base(&mut self, base: Arc<Thread>) {
        for (target, overlay) in self.overlays.iter_mut() {
            if let Some((liked, count)) = base.like_state(target) {
                overlay.reload(liked, count);
            }
        }
        // settled likes are part of the new base already
        self.overlays.retain(|_, o| o.is_pending());
        self.base = base;
        self.refresh();
    }
}

/// The thread of one quote as one viewer sees it, kept up to date with the
/// changes of all clients
pub struct LiveThread {
    quote: QuoteId,
    viewer: Option<UserId>,
    db: Arc<dyn Db>,
    repo: Arc<ThreadRepository>,
    mutator: Arc<ThreadMutator>,
    config: Config,
    state: Mutex<LiveState>,
}

impl LiveThread {
    pub async fn open(
        db: Arc<dyn Db>,
        repo: Arc<ThreadRepository>,
        mutator: Arc<ThreadMutator>,
        config: Config,
        quote: QuoteId,
        viewer: Option<UserId>,
    ) -> LiveThread {
        let base = repo.load_thread_or_previous(quote, viewer).await;
        LiveThread {
            quote,
            viewer,
            db,
            repo,
            mutator,
            config,
            state: Mutex::new(LiveState {
                visible: base.clone(),
                base,
                overlays: HashMap::new(),
                next_op: 0,
                observers: Vec::new(),
            }),
        }
    }

    pub fn thread(&self) -> Arc<Thread> {
        self.state.lock().visible.clone()
    }

    /// Receives each new snapshot from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Arc<Thread>> {
        let (sender, receiver) = mpsc::unbounded();
        self.state.lock().observers.push(sender);
        receiver
    }

    /// Replaces the thread with the server's, keeping the likes still in
    /// flight
    ///
    /// On error the current thread is kept as-is.
    pub async fn reload(&self) -> Result<(), Error> {
        let thread = self.repo.load_thread(self.quote, self.viewer).await?;
        self.state.lock().set_base(Arc::new(thread));
        tracing::trace!(quote=?self.quote, "reloaded live thread");
        Ok(())
    }

    /// Follows the changes to this quote until the change feed closes
    pub async fn run(&self) -> Result<(), Error> {
        let mut feed = self
            .db
            .subscribe(ChangeFilter::Quote(self.quote))
            .await
            .map_err(Error::persistence)?;
        // changes from before the subscription
        self.reload_or_warn().await;
        while let Some(change) = feed.next().await {
            let mut coalesced = 0;
            while let Ok(Some(_)) = feed.try_next() {
                coalesced += 1;
            }
            tracing::debug!(?change, coalesced, "thread changed, reloading");
            self.reload_or_warn().await;
        }
        tracing::debug!(quote=?self.quote, "change feed closed");
        Ok(())
    }

    async fn reload_or_warn(&self) {
        if let Err(err) = self.reload().await {
            tracing::warn!(quote=?self.quote, %err, "failed reloading live thread");
        }
    }

    pub async fn add_comment(&self, text: &str) -> Result<ThreadComment, Error> {
        let viewer = self.viewer.ok_or(Error::NotSignedIn)?;
        let res = self.mutator.add_comment(self.quote, viewer, text).await?;
        self.reload_or_warn().await;
        Ok(res)
    }

    pub async fn add_reply(
        &self,
        comment: CommentId,
        text: &str,
        parent: Option<ReplyId>,
    ) -> Result<ThreadReply, Error> {
        let viewer = self.viewer.ok_or(Error::NotSignedIn)?;
        let res = self
            .mutator
            .add_reply(comment, viewer, text, parent)
            .await?;
        self.reload_or_warn().await;
        Ok(res)
    }

    /// Shows the like toggle at once, then confirms or reverts it
    pub async fn toggle_like(&self, target: LikeTarget) -> Result<Toggled, Error> {
        let viewer = self.viewer.ok_or(Error::NotSignedIn)?;
        let known = self.state.lock().base.like_state(&target).is_some();
        if !known {
            self.reload().await?;
        }

        let (op, active) = {
            let mut state = self.state.lock();
            let (liked, count) = match state.base.like_state(&target) {
                Some(s) => s,
                None => {
                    return Err(match target {
                        LikeTarget::Comment(c) => Error::UnknownComment(c),
                        LikeTarget::Reply(r) => Error::UnknownReply(r),
                    })
                }
            };
            state.next_op += 1;
            let op = state.next_op;
            let active = state
                .overlays
                .entry(target)
                .or_insert_with(|| Overlay::new(liked, count))
                .push(op);
            state.refresh();
            (op, active)
        };

        // set_like queues on the edge before its first await, in push order
        let res = tokio::time::timeout(
            self.config.mutation_timeout,
            self.mutator.set_like(target, viewer, active),
        )
        .await
        .unwrap_or(Err(Error::Timeout));

        let mut state = self.state.lock();
        if let Some(overlay) = state.overlays.get_mut(&target) {
            match &res {
                Ok(toggled) => overlay.confirm(op, toggled.active, toggled.count),
                Err(err) => {
                    tracing::warn!(?target, ?viewer, %err, "like failed, rolling back");
                    overlay.roll_back(op);
                }
            }
        }
        state.refresh();
        res
    }
}
