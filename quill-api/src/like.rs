use chrono::Utc;

use crate::{CommentId, Quote, QuoteId, ReplyId, Time, UserId};

/// Something inside a thread that can be liked
///
/// Comments and replies live in separate edge sets, but share the toggling
/// logic.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub enum LikeTarget {
    Comment(CommentId),
    Reply(ReplyId),
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LikeEdge {
    pub owner_id: UserId,
    pub target: LikeTarget,
    pub date: Time,
}

impl LikeEdge {
    pub fn now(owner_id: UserId, target: LikeTarget) -> LikeEdge {
        LikeEdge {
            owner_id,
            target,
            date: Utc::now(),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub enum QuoteEdgeKind {
    Like,
    Favorite,
}

/// Copy of the quote contents taken when the edge was created
///
/// Edges are listed without joining back on the quotes, so the snapshot is
/// what the user sees in their likes and favorites lists.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct QuoteSnapshot {
    pub text: String,
    pub author: Option<String>,
    pub category: Option<String>,
}

impl From<&Quote> for QuoteSnapshot {
    fn from(q: &Quote) -> QuoteSnapshot {
        QuoteSnapshot {
            text: q.text.clone(),
            author: q.author.clone(),
            category: q.category.clone(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct QuoteEdge {
    pub kind: QuoteEdgeKind,
    pub owner_id: UserId,
    pub quote_id: QuoteId,
    pub date: Time,
    pub snapshot: QuoteSnapshot,
}

impl QuoteEdge {
    pub fn now(kind: QuoteEdgeKind, owner_id: UserId, quote: &Quote) -> QuoteEdge {
        QuoteEdge {
            kind,
            owner_id,
            quote_id: quote.id,
            date: Utc::now(),
            snapshot: QuoteSnapshot::from(quote),
        }
    }
}
