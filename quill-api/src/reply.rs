use chrono::Utc;
use uuid::Uuid;

use crate::{CommentId, Time, UserId};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct ReplyId(pub Uuid);

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Reply {
    pub id: ReplyId,
    pub comment_id: CommentId,

    /// None for replies made directly to the comment
    pub parent_id: Option<ReplyId>,

    pub owner_id: UserId,
    pub date: Time,
    pub text: String,
}

impl Reply {
    pub fn now(
        comment_id: CommentId,
        parent_id: Option<ReplyId>,
        owner_id: UserId,
        text: String,
    ) -> Reply {
        Reply {
            id: ReplyId(Uuid::new_v4()),
            comment_id,
            parent_id,
            owner_id,
            date: Utc::now(),
            text,
        }
    }
}
