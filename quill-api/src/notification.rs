use chrono::Utc;
use uuid::Uuid;

use crate::{QuoteId, Time, UserId};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct NotificationId(pub Uuid);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum NotificationKind {
    Like,
    Favorite,
    Comment,
    Message,
}

impl NotificationKind {
    pub fn title(&self) -> &'static str {
        match self {
            NotificationKind::Like => "New like",
            NotificationKind::Favorite => "New favorite",
            NotificationKind::Comment => "New comment",
            NotificationKind::Message => "New message",
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            NotificationKind::Like => "liked",
            NotificationKind::Favorite => "favorited",
            NotificationKind::Comment => "commented",
            NotificationKind::Message => "wrote",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Notification {
    pub id: NotificationId,

    /// The recipient, who is the only one allowed to mark it as read
    pub user_id: UserId,
    pub actor_id: UserId,

    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub read: bool,
    pub date: Time,
    pub quote_id: Option<QuoteId>,
}

impl Notification {
    pub fn now(
        user_id: UserId,
        actor_id: UserId,
        kind: NotificationKind,
        message: String,
        quote_id: Option<QuoteId>,
    ) -> Notification {
        Notification {
            id: NotificationId(Uuid::new_v4()),
            user_id,
            actor_id,
            kind,
            title: String::from(kind.title()),
            message,
            read: false,
            date: Utc::now(),
            quote_id,
        }
    }
}
