//! `@username` mentions prefixed to replies answering someone

use std::borrow::Cow;

use crate::UserId;

pub fn token(username: &str) -> String {
    format!("@{username} ")
}

/// Prefixes `text` with the mention of `username`, unless it already starts
/// with it
///
/// Applying this twice gives the same result as applying it once.
pub fn with_mention<'a>(text: &'a str, username: &str) -> Cow<'a, str> {
    if starts_with_mention(text, username) {
        return Cow::Borrowed(text);
    }
    Cow::Owned(format!("{}{}", token(username), text))
}

/// Name to mention a user without a profile by, the same on every call
pub fn anonymous_name(user: UserId) -> String {
    let id = user.0.simple().to_string();
    format!("user-{}", id.chars().take(8).collect::<String>())
}

pub fn starts_with_mention(text: &str, username: &str) -> bool {
    match text.strip_prefix('@').and_then(|t| t.strip_prefix(username)) {
        Some(rest) => rest.is_empty() || rest.starts_with(char::is_whitespace),
        None => false,
    }
}
