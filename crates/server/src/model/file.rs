use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::line::{byte_offset, Line, SplitAt};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Line does not exist.")]
    LineNotFound,

    #[error("Line already exists.")]
    LineAlreadyExists,

    #[error("Line does not follow another.")]
    NoPrecedingLine,

    #[error("line chain is broken: {0}")]
    BrokenChain(String),
}

/// A file held as an id-indexed set of lines forming one linked chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub path: String,
    pub version: u64,
    pub updated: DateTime<Utc>,
    lines: HashMap<String, Line>,
}

/// Line states produced by one planned mutation. Nothing is applied until
/// [`File::apply`] is called, so callers can persist first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineChanges {
    pub set: Vec<Line>,
    pub remove: Vec<String>,
    pub updated: DateTime<Utc>,
}

/// Read view of a file for the wire.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileSnapshot {
    pub path: String,
    pub version: u64,
    pub updated: i64,
    pub lines: Vec<LineSnapshot>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LineSnapshot {
    pub line_id: String,
    pub line: String,
    pub previous: Option<String>,
    pub next: Option<String>,
    pub version: u64,
}

impl From<&Line> for LineSnapshot {
    fn from(line: &Line) -> Self {
        Self {
            line_id: line.id.clone(),
            line: line.text.clone(),
            previous: line.previous.clone(),
            next: line.next.clone(),
            version: line.version,
        }
    }
}

impl File {
    /// A new file holding a single empty line.
    pub fn new(path: impl Into<String>, seed_line_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let seed = Line::seed(seed_line_id, now);
        let mut lines = HashMap::new();
        lines.insert(seed.id.clone(), seed);
        Self { path: path.into(), version: 0, updated: now, lines }
    }

    /// Rebuild a file from stored parts, rejecting anything that is not one chain.
    pub fn from_parts(
        path: impl Into<String>,
        version: u64,
        updated: DateTime<Utc>,
        lines: Vec<Line>,
    ) -> Result<Self, ModelError> {
        let mut index = HashMap::with_capacity(lines.len());
        for line in lines {
            let id = line.id.clone();
            if index.insert(id.clone(), line).is_some() {
                return Err(ModelError::BrokenChain(format!("duplicate line id '{id}'")));
            }
        }

        let file = Self { path: path.into(), version, updated, lines: index };
        file.check_chain()?;
        Ok(file)
    }

    pub fn line(&self, line_id: &str) -> Option<&Line> {
        self.lines.get(line_id)
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn head(&self) -> Option<&Line> {
        self.lines.values().find(|line| line.previous.is_none())
    }

    /// Lines from head to tail.
    pub fn ordered_lines(&self) -> Vec<&Line> {
        let mut ordered = Vec::with_capacity(self.lines.len());
        let mut cursor = self.head();
        while let Some(line) = cursor {
            if ordered.len() == self.lines.len() {
                break;
            }
            ordered.push(line);
            cursor = line.next.as_deref().and_then(|next| self.lines.get(next));
        }
        ordered
    }

    pub fn snapshot(&self) -> FileSnapshot {
        FileSnapshot {
            path: self.path.clone(),
            version: self.version,
            updated: self.updated.timestamp_millis(),
            lines: self.ordered_lines().into_iter().map(LineSnapshot::from).collect(),
        }
    }

    /// Verify the lines form exactly one chain with symmetric links.
    pub fn check_chain(&self) -> Result<(), ModelError> {
        let heads: Vec<&Line> = self.lines.values().filter(|line| line.previous.is_none()).collect();
        let head = match heads.as_slice() {
            [head] => *head,
            [] => return Err(ModelError::BrokenChain("no head line".to_owned())),
            _ => return Err(ModelError::BrokenChain(format!("{} head lines", heads.len()))),
        };

        let mut seen = HashSet::with_capacity(self.lines.len());
        let mut current = head;
        loop {
            if !seen.insert(current.id.as_str()) {
                return Err(ModelError::BrokenChain(format!("cycle at '{}'", current.id)));
            }

            let Some(next_id) = current.next.as_deref() else {
                break;
            };
            let next = self.lines.get(next_id).ok_or_else(|| {
                ModelError::BrokenChain(format!("'{}' points to missing '{next_id}'", current.id))
            })?;
            if next.previous.as_deref() != Some(current.id.as_str()) {
                return Err(ModelError::BrokenChain(format!(
                    "'{next_id}' does not point back to '{}'",
                    current.id
                )));
            }
            current = next;
        }

        if seen.len() != self.lines.len() {
            return Err(ModelError::BrokenChain(format!(
                "{} of {} lines unreachable from head",
                self.lines.len() - seen.len(),
                self.lines.len()
            )));
        }

        Ok(())
    }

    pub fn plan_insert(
        &self,
        line_id: &str,
        column: usize,
        data: &str,
        now: DateTime<Utc>,
    ) -> Result<LineChanges, ModelError> {
        let line = self.lines.get(line_id).ok_or(ModelError::LineNotFound)?;
        let offset = byte_offset(&line.text, column);

        let mut updated = bump(line, now);
        updated.text.insert_str(offset, data);

        Ok(LineChanges { set: vec![updated], remove: Vec::new(), updated: now })
    }

    pub fn plan_erase(
        &self,
        line_id: &str,
        column: usize,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<LineChanges, ModelError> {
        let line = self.lines.get(line_id).ok_or(ModelError::LineNotFound)?;
        let start = byte_offset(&line.text, column);
        let end = byte_offset(&line.text, column.saturating_add(count));

        let mut updated = bump(line, now);
        updated.text.replace_range(start..end, "");

        Ok(LineChanges { set: vec![updated], remove: Vec::new(), updated: now })
    }

    /// Cut `line_id` at `at`; the tail becomes `new_line_id`, linked right after it.
    pub fn plan_split(
        &self,
        line_id: &str,
        at: SplitAt,
        new_line_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LineChanges, ModelError> {
        let line = self.lines.get(line_id).ok_or(ModelError::LineNotFound)?;
        if self.lines.contains_key(new_line_id) {
            return Err(ModelError::LineAlreadyExists);
        }

        let offset = match at {
            SplitAt::End => line.text.len(),
            SplitAt::Column(column) => byte_offset(&line.text, column),
        };

        let mut head = bump(line, now);
        let tail_text = head.text.split_off(offset);
        let tail = Line {
            id: new_line_id.to_owned(),
            text: tail_text,
            previous: Some(line.id.clone()),
            next: line.next.clone(),
            version: 1,
            updated: now,
        };
        head.next = Some(tail.id.clone());

        let mut set = vec![head];
        if let Some(next_id) = line.next.as_deref() {
            let next = self.neighbor(next_id)?;
            let mut relinked = bump(next, now);
            relinked.previous = Some(tail.id.clone());
            set.push(relinked);
        }
        set.insert(1, tail);

        Ok(LineChanges { set, remove: Vec::new(), updated: now })
    }

    /// Append `line_id` onto its predecessor and drop it from the chain.
    pub fn plan_merge(&self, line_id: &str, now: DateTime<Utc>) -> Result<LineChanges, ModelError> {
        let line = self.lines.get(line_id).ok_or(ModelError::LineNotFound)?;
        let previous_id = line.previous.as_deref().ok_or(ModelError::NoPrecedingLine)?;
        let previous = self.neighbor(previous_id)?;

        let mut absorbed = bump(previous, now);
        absorbed.text.push_str(&line.text);
        absorbed.next = line.next.clone();

        let mut set = vec![absorbed];
        if let Some(next_id) = line.next.as_deref() {
            let next = self.neighbor(next_id)?;
            let mut relinked = bump(next, now);
            relinked.previous = Some(previous.id.clone());
            set.push(relinked);
        }

        Ok(LineChanges { set, remove: vec![line.id.clone()], updated: now })
    }

    /// Commit planned changes. One call is one file version.
    pub fn apply(&mut self, changes: LineChanges) {
        for id in &changes.remove {
            self.lines.remove(id);
        }
        for line in changes.set {
            self.lines.insert(line.id.clone(), line);
        }
        self.version += 1;
        self.updated = changes.updated;
    }

    /// Re-key under a new display path; counts as one edit.
    pub fn rename(&mut self, path: impl Into<String>, now: DateTime<Utc>) {
        self.path = path.into();
        self.version += 1;
        self.updated = now;
    }

    fn neighbor(&self, line_id: &str) -> Result<&Line, ModelError> {
        self.lines
            .get(line_id)
            .ok_or_else(|| ModelError::BrokenChain(format!("linked line '{line_id}' is missing")))
    }
}

fn bump(line: &Line, now: DateTime<Utc>) -> Line {
    let mut copy = line.clone();
    copy.version += 1;
    copy.updated = now;
    copy
}
