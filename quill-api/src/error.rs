use crate::{CommentId, QuoteId, ReplyId};

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Text is empty")]
    EmptyText,

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),

    #[error("Reply {parent:?} is not part of comment {comment:?}")]
    InvalidParent { comment: CommentId, parent: ReplyId },

    #[error("This action requires being signed in")]
    NotSignedIn,

    #[error("Quote {0:?} does not exist")]
    UnknownQuote(QuoteId),

    #[error("Comment {0:?} does not exist")]
    UnknownComment(CommentId),

    #[error("Reply {0:?} does not exist")]
    UnknownReply(ReplyId),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Persistence call timed out")]
    Timeout,

    #[error("Thread for quote {0:?} kept changing while being loaded")]
    InconsistentSnapshot(QuoteId),

    #[error("Failed dispatching notification: {0}")]
    NotificationDispatch(String),
}

impl Error {
    /// Wraps a failure of the persistence layer, keeping the whole context chain
    pub fn persistence(err: anyhow::Error) -> Error {
        Error::Persistence(format!("{err:#}"))
    }

    /// Errors that are the user's to fix, and are raised before any write
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::EmptyText
                | Error::NullByteInString(_)
                | Error::InvalidParent { .. }
                | Error::NotSignedIn
                | Error::UnknownQuote(_)
                | Error::UnknownComment(_)
                | Error::UnknownReply(_)
        )
    }

    /// Errors after which retrying the very same action may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Persistence(_)
                | Error::Timeout
                | Error::InconsistentSnapshot(_)
                | Error::NotificationDispatch(_)
        )
    }
}
