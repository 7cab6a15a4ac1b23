//! MQTT topic filter matching.
//!
//! Supports MQTT wildcards:
//! - `+` matches exactly one topic level (which may be empty)
//! - `#` matches any number of remaining topic levels (must be last)
//!
//! `#` also matches the parent level, so `a/#` matches `a`. Topics starting
//! with `$` get no special treatment here; callers that want the MQTT rule
//! hiding `$` topics from root wildcards apply it themselves.

use crate::error::{Error, Result};

/// Check whether `topic` matches the topic filter `filter`.
pub fn matches(topic: &str, filter: &str) -> bool {
    let mut levels = topic.split('/');

    for pattern in filter.split('/') {
        if pattern == "#" {
            return true;
        }
        match levels.next() {
            Some(level) if pattern == "+" || pattern == level => {}
            _ => return false,
        }
    }

    levels.next().is_none()
}

/// Validate a topic filter.
///
/// `#` may only appear as the whole of the final level, and `+` must occupy
/// a whole level.
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::InvalidFilter("empty filter".to_string()));
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return Err(Error::InvalidFilter(format!(
                "{filter}: # must be the last level on its own"
            )));
        }
        if level.contains('+') && level != "+" {
            return Err(Error::InvalidFilter(format!(
                "{filter}: + must occupy a whole level"
            )));
        }
    }

    Ok(())
}

/// Number of literal levels before the first wildcard.
///
/// Used to pick the most specific of several matching filters.
pub fn specificity(filter: &str) -> usize {
    filter
        .split('/')
        .take_while(|level| *level != "+" && *level != "#")
        .count()
}
