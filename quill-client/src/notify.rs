use std::sync::Arc;

use anyhow::Context;
use futures::future;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::{
    api::{Db, Error, Notification, NotificationId, NotificationKind, QuoteId, UserId},
    Config,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchOutcome {
    /// The actor is the recipient
    Skipped,
    Sent(NotificationId),
    /// Already logged, there is nothing more to do about it
    Failed,
}

/// Best-effort delivery of "someone interacted with your content" events
#[derive(Clone)]
pub struct NotificationDispatcher {
    db: Arc<dyn Db>,
    config: Config,
    in_flight: Arc<Mutex<Vec<JoinHandle<DispatchOutcome>>>>,
}

/// Truncates `s` to `len` characters, marking the cut with an ellipsis
pub fn snippet(s: &str, len: usize) -> String {
    let mut chars = s.chars();
    let mut res = chars.by_ref().take(len).collect::<String>();
    if chars.next().is_some() {
        res.push('…');
    }
    res
}

impl NotificationDispatcher {
    pub fn new(db: Arc<dyn Db>, config: Config) -> NotificationDispatcher {
        NotificationDispatcher {
            db,
            config,
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Runs `notify` in the background, so that the caller never waits on
    /// the notification
    pub fn spawn(
        &self,
        target_user: UserId,
        actor_user: UserId,
        kind: NotificationKind,
        content_snippet: String,
        quote_ref: Option<QuoteId>,
    ) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.notify(target_user, actor_user, kind, &content_snippet, quote_ref)
                .await
        });
        let mut in_flight = self.in_flight.lock();
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);
    }

    /// Waits until the notifications spawned so far are delivered or dropped
    pub async fn settle(&self) {
        let handles = std::mem::take(&mut *self.in_flight.lock());
        for res in future::join_all(handles).await {
            if let Err(err) = res {
                tracing::warn!(%err, "notification task did not complete");
            }
        }
    }

    /// Never fails: the mutation that triggered the notification is already
    /// done and must not be undone because of it
    pub async fn notify(
        &self,
        target_user: UserId,
        actor_user: UserId,
        kind: NotificationKind,
        content_snippet: &str,
        quote_ref: Option<QuoteId>,
    ) -> DispatchOutcome {
        if target_user == actor_user {
            tracing::debug!(user=?actor_user, ?kind, "not notifying user of their own action");
            return DispatchOutcome::Skipped;
        }
        let res = tokio::time::timeout(
            self.config.mutation_timeout,
            self.send(target_user, actor_user, kind, content_snippet, quote_ref),
        )
        .await;
        let err = match res {
            Ok(Ok(id)) => return DispatchOutcome::Sent(id),
            Ok(Err(err)) => Error::NotificationDispatch(format!("{err:#}")),
            Err(_) => Error::NotificationDispatch(String::from("timed out")),
        };
        tracing::warn!(?target_user, ?actor_user, ?kind, %err, "dropping notification");
        DispatchOutcome::Failed
    }

    async fn send(
        &self,
        target_user: UserId,
        actor_user: UserId,
        kind: NotificationKind,
        content_snippet: &str,
        quote_ref: Option<QuoteId>,
    ) -> anyhow::Result<NotificationId> {
        // A missing profile only makes for a less personal message
        let actor_name = match self.db.fetch_users(&[actor_user]).await {
            Ok(users) => users.into_iter().next().map(|u| u.name),
            Err(err) => {
                tracing::debug!(?actor_user, ?err, "failed fetching notification actor");
                None
            }
        }
        .unwrap_or_else(|| String::from("Someone"));
        let message = format!(
            "{actor_name} {} \"{}\"",
            kind.verb(),
            snippet(content_snippet, self.config.snippet_len)
        );
        let notif = Notification::now(target_user, actor_user, kind, message, quote_ref);
        let id = notif.id;
        self.db
            .insert_notification(notif)
            .await
            .with_context(|| format!("inserting notification for {target_user:?}"))?;
        tracing::debug!(?target_user, ?actor_user, ?kind, "sent notification");
        Ok(id)
    }

    /// Unread notifications of `recipient`, newest first
    pub async fn unread(&self, recipient: UserId) -> Result<Vec<Notification>, Error> {
        let mut res = self
            .db
            .fetch_notifications(recipient)
            .await
            .with_context(|| format!("fetching notifications of {recipient:?}"))
            .map_err(Error::persistence)?;
        res.retain(|n| !n.read);
        Ok(res)
    }

    /// Returns false if `recipient` has no such notification
    pub async fn mark_read(
        &self,
        recipient: UserId,
        notif: NotificationId,
    ) -> Result<bool, Error> {
        self.db
            .mark_notification_read(recipient, notif)
            .await
            .with_context(|| format!("marking notification {notif:?} as read"))
            .map_err(Error::persistence)
    }
}
