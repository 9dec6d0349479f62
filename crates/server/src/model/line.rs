use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One addressable line of a file. `previous`/`next` link it into the file's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub id: String,
    pub text: String,
    pub previous: Option<String>,
    pub next: Option<String>,
    pub version: u64,
    pub updated: DateTime<Utc>,
}

impl Line {
    pub fn seed(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self { id: id.into(), text: String::new(), previous: None, next: None, version: 0, updated: now }
    }
}

/// Where `split` cuts a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitAt {
    /// After the last character, producing an empty new line.
    End,
    Column(usize),
}

impl SplitAt {
    /// Wire form: `-1` means end of line, any other negative value is invalid.
    pub fn from_wire(column: i64) -> Option<Self> {
        match column {
            -1 => Some(Self::End),
            column if column >= 0 => usize::try_from(column).ok().map(Self::Column),
            _ => None,
        }
    }
}

/// Byte offset of the `column`-th character, clamped to the end of `text`.
pub(crate) fn byte_offset(text: &str, column: usize) -> usize {
    text.char_indices().nth(column).map(|(offset, _)| offset).unwrap_or(text.len())
}

#[cfg(test)]
mod tests {
    use super::{byte_offset, SplitAt};

    #[test]
    fn split_sentinel_maps_to_end() {
        assert_eq!(SplitAt::from_wire(-1), Some(SplitAt::End));
        assert_eq!(SplitAt::from_wire(0), Some(SplitAt::Column(0)));
        assert_eq!(SplitAt::from_wire(7), Some(SplitAt::Column(7)));
        assert_eq!(SplitAt::from_wire(-2), None);
    }

    #[test]
    fn offsets_count_chars_and_clamp() {
        assert_eq!(byte_offset("héllo", 2), 3);
        assert_eq!(byte_offset("abc", 3), 3);
        assert_eq!(byte_offset("abc", 99), 3);
        assert_eq!(byte_offset("", 0), 0);
    }
}
