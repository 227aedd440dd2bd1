use futures::channel::mpsc;

use crate::{QuoteId, UserId};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum Table {
    Quotes,
    Comments,
    Replies,
    CommentLikes,
    ReplyLikes,
    QuoteEdges,
    Notifications,
}

/// Signal that something changed in a table
///
/// There is no guarantee on the payload beyond the table and the quote or
/// user it is relevant to: the only valid reaction is to reload.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Change {
    pub table: Table,
    pub quote_id: Option<QuoteId>,
    pub user_id: Option<UserId>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum ChangeFilter {
    /// Anything that could change the thread or the counters of this quote
    Quote(QuoteId),

    /// Edges and notifications belonging to this user
    User(UserId),
}

impl ChangeFilter {
    pub fn matches(&self, c: &Change) -> bool {
        match self {
            ChangeFilter::Quote(q) => c.quote_id == Some(*q),
            ChangeFilter::User(u) => {
                matches!(c.table, Table::QuoteEdges | Table::Notifications)
                    && c.user_id == Some(*u)
            }
        }
    }
}

pub type ChangeStream = mpsc::UnboundedReceiver<Change>;
