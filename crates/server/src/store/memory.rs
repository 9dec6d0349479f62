use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{FileRecord, ListenerRule, RepoRecord, StoreError, UserRecord};
use crate::access::Role;
use crate::model::Line;

type Shared = Arc<RwLock<MemoryState>>;

/// Process-local storage used for development and tests.
#[derive(Debug, Default)]
pub struct MemoryState {
    users: HashMap<String, UserRecord>,
    repos: HashMap<String, RepoRecord>,
    roles: HashMap<(String, String), Role>,
    listeners: HashMap<(String, String), ListenerRule>,
    files: HashMap<(String, String), MemoryFile>,
    #[cfg(test)]
    pub(super) fail_writes: bool,
}

#[derive(Debug, Clone)]
struct MemoryFile {
    record: FileRecord,
    lines: HashMap<String, Line>,
}

impl MemoryState {
    #[cfg(test)]
    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Injected);
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_writable(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn file_mut(&mut self, repo: &str, key: &str) -> Result<&mut MemoryFile, StoreError> {
        self.files.get_mut(&(repo.to_owned(), key.to_owned())).ok_or(StoreError::NotFound)
    }
}

pub(super) async fn user_get(store: &Shared, key: &str) -> Result<Option<UserRecord>, StoreError> {
    Ok(store.read().await.users.get(key).cloned())
}

pub(super) async fn user_create(
    store: &Shared,
    key: &str,
    user: &UserRecord,
) -> Result<(), StoreError> {
    let mut state = store.write().await;
    state.check_writable()?;
    if state.users.contains_key(key) {
        return Err(StoreError::Conflict);
    }
    state.users.insert(key.to_owned(), user.clone());
    Ok(())
}

pub(super) async fn user_set_pass(
    store: &Shared,
    key: &str,
    pass_hash: &str,
) -> Result<(), StoreError> {
    let mut state = store.write().await;
    state.check_writable()?;
    let user = state.users.get_mut(key).ok_or(StoreError::NotFound)?;
    user.pass_hash = pass_hash.to_owned();
    Ok(())
}

pub(super) async fn user_set_email(store: &Shared, key: &str, email: &str) -> Result<(), StoreError> {
    let mut state = store.write().await;
    state.check_writable()?;
    let user = state.users.get_mut(key).ok_or(StoreError::NotFound)?;
    user.email = Some(email.to_owned());
    Ok(())
}

pub(super) async fn repo_create(
    store: &Shared,
    key: &str,
    owner: &str,
    repo: &RepoRecord,
    owner_rule: &ListenerRule,
) -> Result<(), StoreError> {
    let mut state = store.write().await;
    state.check_writable()?;
    if state.repos.contains_key(key) {
        return Err(StoreError::Conflict);
    }
    state.repos.insert(key.to_owned(), repo.clone());
    state.roles.insert((key.to_owned(), owner.to_owned()), Role::Owner);
    state.listeners.insert((key.to_owned(), owner.to_owned()), owner_rule.clone());
    Ok(())
}

pub(super) async fn repo_get(store: &Shared, key: &str) -> Result<Option<RepoRecord>, StoreError> {
    Ok(store.read().await.repos.get(key).cloned())
}

pub(super) async fn role_set(
    store: &Shared,
    repo: &str,
    user: &str,
    role: Role,
) -> Result<(), StoreError> {
    let mut state = store.write().await;
    state.check_writable()?;
    state.roles.insert((repo.to_owned(), user.to_owned()), role);
    Ok(())
}

pub(super) async fn role_get(store: &Shared, repo: &str, user: &str) -> Result<Option<Role>, StoreError> {
    Ok(store.read().await.roles.get(&(repo.to_owned(), user.to_owned())).copied())
}

pub(super) async fn role_delete(store: &Shared, repo: &str, user: &str) -> Result<(), StoreError> {
    let mut state = store.write().await;
    state.check_writable()?;
    state.roles.remove(&(repo.to_owned(), user.to_owned()));
    Ok(())
}

pub(super) async fn listener_set(
    store: &Shared,
    repo: &str,
    user: &str,
    rule: &ListenerRule,
) -> Result<(), StoreError> {
    let mut state = store.write().await;
    state.check_writable()?;
    state.listeners.insert((repo.to_owned(), user.to_owned()), rule.clone());
    Ok(())
}

pub(super) async fn listener_get(
    store: &Shared,
    repo: &str,
    user: &str,
) -> Result<Option<ListenerRule>, StoreError> {
    Ok(store.read().await.listeners.get(&(repo.to_owned(), user.to_owned())).cloned())
}

pub(super) async fn file_create(
    store: &Shared,
    repo: &str,
    key: &str,
    file: &FileRecord,
    seed: &Line,
) -> Result<(), StoreError> {
    let mut state = store.write().await;
    state.check_writable()?;
    let id = (repo.to_owned(), key.to_owned());
    if state.files.contains_key(&id) {
        return Err(StoreError::Conflict);
    }
    let lines = HashMap::from([(seed.id.clone(), seed.clone())]);
    state.files.insert(id, MemoryFile { record: file.clone(), lines });
    Ok(())
}

pub(super) async fn file_move(
    store: &Shared,
    repo: &str,
    key: &str,
    new_key: &str,
    file: &FileRecord,
) -> Result<(), StoreError> {
    let mut state = store.write().await;
    state.check_writable()?;
    let new_id = (repo.to_owned(), new_key.to_owned());
    if key != new_key && state.files.contains_key(&new_id) {
        return Err(StoreError::Conflict);
    }
    let mut moved =
        state.files.remove(&(repo.to_owned(), key.to_owned())).ok_or(StoreError::NotFound)?;
    moved.record = file.clone();
    state.files.insert(new_id, moved);
    Ok(())
}

pub(super) async fn file_delete(store: &Shared, repo: &str, key: &str) -> Result<(), StoreError> {
    let mut state = store.write().await;
    state.check_writable()?;
    state.files.remove(&(repo.to_owned(), key.to_owned())).map(|_| ()).ok_or(StoreError::NotFound)
}

pub(super) async fn file_get(
    store: &Shared,
    repo: &str,
    key: &str,
) -> Result<Option<(FileRecord, Vec<Line>)>, StoreError> {
    let state = store.read().await;
    Ok(state
        .files
        .get(&(repo.to_owned(), key.to_owned()))
        .map(|file| (file.record.clone(), file.lines.values().cloned().collect())))
}

pub(super) async fn file_list(store: &Shared, repo: &str) -> Result<Vec<String>, StoreError> {
    let state = store.read().await;
    let mut paths: Vec<String> = state
        .files
        .iter()
        .filter(|((file_repo, _), _)| file_repo == repo)
        .map(|(_, file)| file.record.path.clone())
        .collect();
    paths.sort();
    Ok(paths)
}

pub(super) async fn apply_line_changes(
    store: &Shared,
    repo: &str,
    key: &str,
    file: &FileRecord,
    set: &[Line],
    remove: &[String],
) -> Result<(), StoreError> {
    let mut state = store.write().await;
    state.check_writable()?;
    let stored = state.file_mut(repo, key)?;
    for id in remove {
        stored.lines.remove(id);
    }
    for line in set {
        stored.lines.insert(line.id.clone(), line.clone());
    }
    stored.record = file.clone();
    Ok(())
}
