//! Cursor pagination over name-sorted listings.
//!
//! A cursor is the base64 encoding of the last key returned. Listings resume
//! strictly after that key, so entries added or removed between pages never
//! cause an item to be skipped or repeated.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use crate::errors::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("cursor is not valid base64")]
    Malformed,
    #[error("cursor points past the end of the listing")]
    OutOfRange,
}

impl From<CursorError> for ProtocolError {
    fn from(err: CursorError) -> Self {
        ProtocolError::InvalidCursor(err.to_string())
    }
}

pub fn encode_cursor(key: &str) -> String {
    STANDARD.encode(key.as_bytes())
}

pub fn decode_cursor(cursor: &str) -> Result<String, CursorError> {
    let bytes = STANDARD
        .decode(cursor.as_bytes())
        .map_err(|_| CursorError::Malformed)?;
    String::from_utf8(bytes).map_err(|_| CursorError::Malformed)
}

/// Sorts `entries` by key and returns the page following `cursor`.
/// `page_size` of `None` or zero returns everything after the cursor.
pub fn paginate<T>(
    mut entries: Vec<(String, T)>,
    cursor: Option<&str>,
    page_size: Option<usize>,
) -> Result<Page<T>, CursorError> {
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    let start = match cursor {
        None => 0,
        Some(cursor) => {
            let last = decode_cursor(cursor)?;
            let start = entries.partition_point(|(key, _)| key.as_str() <= last.as_str());
            if start >= entries.len() {
                return Err(CursorError::OutOfRange);
            }
            start
        }
    };

    let end = match page_size {
        Some(size) if size > 0 => start.saturating_add(size).min(entries.len()),
        _ => entries.len(),
    };

    let next_cursor = (end < entries.len())
        .then(|| entries.get(end - 1).map(|(key, _)| encode_cursor(key)))
        .flatten();
    let items = entries
        .into_iter()
        .skip(start)
        .take(end - start)
        .map(|(_, item)| item)
        .collect();

    Ok(Page { items, next_cursor })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letters() -> Vec<(String, char)> {
        // Deliberately unsorted.
        ['d', 'a', 'e', 'c', 'b']
            .into_iter()
            .map(|c| (c.to_string(), c))
            .collect()
    }

    #[test]
    fn walks_pages_of_two() {
        let first = paginate(letters(), None, Some(2)).expect("page 1");
        assert_eq!(first.items, vec!['a', 'b']);
        let cursor = first.next_cursor.expect("cursor 1");

        let second = paginate(letters(), Some(&cursor), Some(2)).expect("page 2");
        assert_eq!(second.items, vec!['c', 'd']);
        let cursor = second.next_cursor.expect("cursor 2");

        let third = paginate(letters(), Some(&cursor), Some(2)).expect("page 3");
        assert_eq!(third.items, vec!['e']);
        assert_eq!(third.next_cursor, None);
    }

    #[test]
    fn unbounded_page_returns_everything() {
        let page = paginate(letters(), None, None).expect("page");
        assert_eq!(page.items, vec!['a', 'b', 'c', 'd', 'e']);
        assert_eq!(page.next_cursor, None);

        let page = paginate(letters(), None, Some(0)).expect("zero means unbounded");
        assert_eq!(page.items.len(), 5);
    }

    #[test]
    fn bad_cursors_are_errors() {
        assert_eq!(
            paginate(letters(), Some("not base64!"), Some(2)),
            Err(CursorError::Malformed)
        );

        let past_end = encode_cursor("e");
        assert_eq!(
            paginate(letters(), Some(&past_end), Some(2)),
            Err(CursorError::OutOfRange)
        );

        let err = ProtocolError::from(CursorError::Malformed);
        assert!(matches!(err, ProtocolError::InvalidCursor(_)));
    }

    #[test]
    fn resumes_after_removed_key() {
        let cursor = encode_cursor("b");
        let entries = letters().into_iter().filter(|(k, _)| k != "b").collect();
        let page = paginate(entries, Some(&cursor), Some(2)).expect("page");
        assert_eq!(page.items, vec!['c', 'd']);
    }
}
