use chrono::Utc;
use uuid::Uuid;

use crate::{QuoteId, Time, UserId};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct CommentId(pub Uuid);

/// A top-level comment on a quote, as stored
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub quote_id: QuoteId,
    pub owner_id: UserId,
    pub date: Time,
    pub text: String,
}

impl Comment {
    pub fn now(quote_id: QuoteId, owner_id: UserId, text: String) -> Comment {
        Comment {
            id: CommentId(Uuid::new_v4()),
            quote_id,
            owner_id,
            date: Utc::now(),
            text,
        }
    }
}
