use chrono::Utc;
use uuid::Uuid;

use crate::{Time, UserId};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct QuoteId(pub Uuid);

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Quote {
    pub id: QuoteId,
    pub owner_id: UserId,
    pub date: Time,

    pub text: String,
    pub author: Option<String>,
    pub category: Option<String>,

    /// Hidden quotes are kept for their owner and moderators only
    pub hidden: bool,
}

impl Quote {
    pub fn now(owner_id: UserId, text: String) -> Quote {
        Quote {
            id: QuoteId(Uuid::new_v4()),
            owner_id,
            date: Utc::now(),
            text,
            author: None,
            category: None,
            hidden: false,
        }
    }
}
