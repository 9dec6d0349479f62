// In-memory document model: files as id-addressed line chains.

mod file;
mod line;

pub use file::{File, FileSnapshot, LineChanges, LineSnapshot, ModelError};
pub use line::{Line, SplitAt};
