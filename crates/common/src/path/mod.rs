// Repository file path handling.

mod normalize;

pub use normalize::{normalize_path, path_key, PathError};
