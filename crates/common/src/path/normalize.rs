// File path canonicalization: NFKC normalization, traversal rejection, 512 char max.

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Maximum allowed path length in characters.
const MAX_PATH_CHARS: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("path exceeds maximum length of {MAX_PATH_CHARS} characters")]
    TooLong,

    #[error("path contains directory traversal component: {0}")]
    Traversal(String),

    #[error("path contains null byte")]
    NullByte,

    #[error("path contains invalid component: {0}")]
    InvalidComponent(String),
}

/// Normalize a repository file path for storage and display.
///
/// Rules:
/// - Apply Unicode NFKC normalization
/// - Convert `\` separators to `/`
/// - Collapse consecutive `/` into one and strip leading/trailing `/`
/// - Reject `.` and `..` components, null bytes and empty paths
/// - Enforce max 512 character limit (after normalization)
///
/// Case is preserved; use [`path_key`] for uniqueness checks.
pub fn normalize_path(input: &str) -> Result<String, PathError> {
    if input.is_empty() {
        return Err(PathError::Empty);
    }

    if input.contains('\0') {
        return Err(PathError::NullByte);
    }

    let normalized: String = input.nfkc().collect();
    let unified = normalized.replace('\\', "/");
    let components: Vec<&str> = unified.split('/').filter(|s| !s.is_empty()).collect();

    if components.is_empty() {
        return Err(PathError::Empty);
    }

    for component in &components {
        if *component == "." || *component == ".." {
            return Err(PathError::Traversal((*component).to_string()));
        }
        if component.trim().is_empty() {
            return Err(PathError::InvalidComponent(
                "(whitespace-only component)".to_string(),
            ));
        }
    }

    let result = components.join("/");

    if result.chars().count() > MAX_PATH_CHARS {
        return Err(PathError::TooLong);
    }

    Ok(result)
}

/// Case-insensitive cache/uniqueness key for an already normalized path.
pub fn path_key(normalized: &str) -> String {
    normalized.to_lowercase()
}
