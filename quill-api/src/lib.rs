use chrono::Utc;

pub use uuid::Uuid;
pub type Time = chrono::DateTime<Utc>;

mod comment;
pub use comment::{Comment, CommentId};

mod db;
pub use db::{count_by_target, Db};

mod error;
pub use error::Error;

mod feed;
pub use feed::{Change, ChangeFilter, ChangeStream, Table};

mod like;
pub use like::{LikeEdge, LikeTarget, QuoteEdge, QuoteEdgeKind, QuoteSnapshot};

pub mod mention;

mod notification;
pub use notification::{Notification, NotificationId, NotificationKind};

mod quote;
pub use quote::{Quote, QuoteId};

mod reply;
pub use reply::{Reply, ReplyId};

mod user;
pub use user::{User, UserId};

// Null bytes are rejected by postgres text columns, so they are rejected
// everywhere for consistency between backends
pub fn validate_string(s: &str) -> Result<(), Error> {
    match s.contains('\0') {
        true => Err(Error::NullByteInString(s.to_string())),
        false => Ok(()),
    }
}

/// Validates user-submitted comment or reply text, returning the text that
/// should actually be stored
pub fn validate_text(s: &str) -> Result<&str, Error> {
    validate_string(s)?;
    let trimmed = s.trim();
    match trimmed.is_empty() {
        true => Err(Error::EmptyText),
        false => Ok(trimmed),
    }
}
