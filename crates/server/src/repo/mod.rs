// Repository aggregate: role assignments, the file cache and live listeners
// of one named repository.
//
// Every operation runs under the repository's FIFO lock: hydrate, read,
// validate, persist, then commit to the cache and notify listeners. Storage
// failures therefore never leave a half-applied edit in memory.

mod registry;

use std::collections::HashMap;

use bittle_common::path::{normalize_path, path_key, PathError};
use bittle_common::protocol::{Notification, Outbound};
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::access::{check_role_change, AccessError, Role};
use crate::model::{File, FileSnapshot, LineChanges, LineSnapshot, ModelError, SplitAt};
use crate::session::{ClientRegistry, Outbox};
use crate::store::{name_key, FileRecord, ListenerRule, RepoRecord, Store, StoreError};

pub use registry::RepoRegistry;

const DEFAULT_LISTEN_PATTERN: &str = ".*";
const LIVE_MODE: &str = "live";
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("Name is already taken.")]
    NameTaken,

    #[error("Repo does not exist.")]
    RepoNotFound,

    #[error("File does not exist.")]
    FileNotFound,

    #[error("File already exists.")]
    FileExists,

    #[error("User does not exist.")]
    UserNotFound,

    #[error("Invalid path.")]
    InvalidPath(#[from] PathError),

    #[error("Invalid pattern.")]
    InvalidPattern(#[from] regex::Error),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

/// The connection on whose behalf an operation runs.
#[derive(Debug, Clone)]
pub struct Actor {
    pub conn_id: Uuid,
    pub name: String,
    pub outbox: Outbox,
}

#[derive(Debug)]
struct LiveListener {
    user: String,
    pattern: Regex,
    outbox: Outbox,
}

#[derive(Debug, Default)]
struct RepoState {
    retrieved: bool,
    record: Option<RepoRecord>,
    roles: HashMap<String, Role>,
    /// `None` caches a known-missing path.
    files: HashMap<String, Option<File>>,
    listeners: HashMap<Uuid, LiveListener>,
}

pub struct Repository {
    name: String,
    store: Store,
    clients: ClientRegistry,
    seed_line_id: String,
    state: Mutex<RepoState>,
}

impl Repository {
    pub(crate) fn new(
        name: impl Into<String>,
        store: Store,
        clients: ClientRegistry,
        seed_line_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            clients,
            seed_line_id: seed_line_id.into(),
            state: Mutex::new(RepoState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn exists(&self) -> Result<bool, RepoError> {
        Ok(self.lock().await?.record.is_some())
    }

    /// Persist the repository with `actor` as owner and register the actor as
    /// a live listener of every path.
    pub async fn create(&self, actor: &Actor) -> Result<(), RepoError> {
        let mut state = self.lock().await?;
        if state.record.is_some() {
            return Err(RepoError::NameTaken);
        }

        let record =
            RepoRecord { name: self.name.clone(), owner: actor.name.clone(), created_at: Utc::now() };
        let rule = ListenerRule { pattern: DEFAULT_LISTEN_PATTERN.to_owned(), mode: LIVE_MODE.to_owned() };
        let pattern = compile_pattern(DEFAULT_LISTEN_PATTERN)?;

        // Unknown until the write reports back; an abandoned request leaves
        // the next lock to hydrate from storage.
        state.retrieved = false;
        self.store.repo_create(&record, &rule).await.map_err(|error| match error {
            StoreError::Conflict => RepoError::NameTaken,
            other => RepoError::Storage(other),
        })?;
        state.retrieved = true;

        state.record = Some(record);
        state.roles.insert(name_key(&actor.name), Role::Owner);
        state.listeners.insert(
            actor.conn_id,
            LiveListener { user: actor.name.clone(), pattern, outbox: actor.outbox.clone() },
        );

        info!(repo = %self.name, owner = %actor.name, "repository created");
        Ok(())
    }

    pub async fn get_role(&self, user: &str) -> Result<Role, RepoError> {
        let mut state = self.lock_existing().await?;
        self.role_locked(&mut state, user).await
    }

    /// Change `target`'s role on behalf of `actor`. `Role::None` revokes.
    ///
    /// The assigner's own role is read under the same lock as the write, so a
    /// demotion queued ahead of this call is honored.
    pub async fn set_role(&self, actor: &Actor, target: &str, new_role: Role) -> Result<(), RepoError> {
        let mut state = self.lock_existing().await?;
        let assigner_role = self.authorize(&mut state, actor, new_role).await?;
        if self.store.user_get(target).await?.is_none() {
            return Err(RepoError::UserNotFound);
        }

        let current = self.role_locked(&mut state, target).await?;
        check_role_change(assigner_role, current, new_role)?;

        // Uncached while the write is in flight; a failed or abandoned write
        // makes the next lookup read storage again.
        let key = name_key(target);
        state.roles.remove(&key);
        if new_role == Role::None {
            self.store.role_delete(&self.name, target).await?;
        } else {
            self.store.role_set(&self.name, target, new_role).await?;
        }
        state.roles.insert(key, new_role);

        info!(
            repo = %self.name,
            user = %target,
            role = %new_role,
            assigner = %actor.name,
            "role changed"
        );

        let frame = Outbound::Notification(Notification::Role {
            repo: self.name.clone(),
            role: new_role.as_str().to_owned(),
            origin: actor.name.clone(),
            time: Utc::now().timestamp_millis(),
        });
        if !self.clients.send_to(target, frame).await {
            debug!(repo = %self.name, user = %target, "role change target not connected");
        }

        Ok(())
    }

    pub async fn create_file(
        &self,
        actor: &Actor,
        path: &str,
        line_id: Option<&str>,
    ) -> Result<(), RepoError> {
        let normalized = normalize_path(path)?;
        let key = path_key(&normalized);

        let mut state = self.lock_existing().await?;
        self.authorize(&mut state, actor, Role::Contributor).await?;
        self.ensure_file(&mut state, &key).await?;
        if matches!(state.files.get(&key), Some(Some(_))) {
            return Err(RepoError::FileExists);
        }

        let now = Utc::now();
        let file = File::new(normalized.clone(), line_id.unwrap_or(&self.seed_line_id), now);
        let seed = file.head().cloned().ok_or_else(|| {
            RepoError::Model(ModelError::BrokenChain("new file has no seed line".to_owned()))
        })?;
        state.files.remove(&key);
        self.store.file_create(&self.name, &key, &file_record(&file), &seed).await.map_err(
            |error| match error {
                StoreError::Conflict => RepoError::FileExists,
                other => RepoError::Storage(other),
            },
        )?;

        let version = file.version;
        state.files.insert(key, Some(file));
        info!(repo = %self.name, path = %normalized, line_id = %seed.id, "file created");

        self.broadcast(
            &mut state,
            actor,
            &[normalized.as_str()],
            "createFile",
            json!({ "path": &normalized, "lineId": &seed.id }),
            version,
        )
        .await;
        Ok(())
    }

    /// Re-key a file without touching its lines.
    pub async fn move_file(&self, actor: &Actor, path: &str, new_path: &str) -> Result<(), RepoError> {
        let normalized = normalize_path(path)?;
        let new_normalized = normalize_path(new_path)?;
        let key = path_key(&normalized);
        let new_key = path_key(&new_normalized);

        let mut state = self.lock_existing().await?;
        self.authorize(&mut state, actor, Role::Contributor).await?;
        self.ensure_file(&mut state, &key).await?;
        self.ensure_file(&mut state, &new_key).await?;

        let Some(Some(file)) = state.files.get(&key) else {
            return Err(RepoError::FileNotFound);
        };
        if key != new_key && matches!(state.files.get(&new_key), Some(Some(_))) {
            return Err(RepoError::FileExists);
        }

        let mut moved = file.clone();
        let old_path = moved.path.clone();
        moved.rename(new_normalized.clone(), Utc::now());
        let original = state.files.remove(&key);
        let target = state.files.remove(&new_key);
        let persisted = self.store.file_move(&self.name, &key, &new_key, &file_record(&moved)).await.map_err(
            |error| match error {
                StoreError::Conflict => RepoError::FileExists,
                other => RepoError::Storage(other),
            },
        );
        if let Err(error) = persisted {
            if let Some(original) = original {
                state.files.insert(key, original);
            }
            if let Some(target) = target {
                state.files.insert(new_key, target);
            }
            return Err(error);
        }

        let version = moved.version;
        state.files.insert(key, None);
        state.files.insert(new_key, Some(moved));
        info!(repo = %self.name, path = %old_path, new_path = %new_normalized, "file moved");

        self.broadcast(
            &mut state,
            actor,
            &[old_path.as_str(), new_normalized.as_str()],
            "moveFile",
            json!({ "path": &old_path, "newPath": &new_normalized }),
            version,
        )
        .await;
        Ok(())
    }

    pub async fn delete_file(&self, actor: &Actor, path: &str) -> Result<(), RepoError> {
        let normalized = normalize_path(path)?;
        let key = path_key(&normalized);

        let mut state = self.lock_existing().await?;
        self.authorize(&mut state, actor, Role::Contributor).await?;
        self.ensure_file(&mut state, &key).await?;
        let Some(Some(file)) = state.files.get(&key) else {
            return Err(RepoError::FileNotFound);
        };
        let display_path = file.path.clone();
        let version = file.version + 1;

        let cached = state.files.remove(&key);
        if let Err(error) = self.store.file_delete(&self.name, &key).await {
            if let Some(cached) = cached {
                state.files.insert(key, cached);
            }
            return Err(error.into());
        }
        state.files.insert(key, None);
        info!(repo = %self.name, path = %display_path, "file deleted");

        let args = json!({ "path": &display_path });
        self.broadcast(&mut state, actor, &[display_path.as_str()], "deleteFile", args, version).await;
        Ok(())
    }

    pub async fn get_file(&self, path: &str) -> Result<FileSnapshot, RepoError> {
        let key = path_key(&normalize_path(path)?);
        let mut state = self.lock_existing().await?;
        self.ensure_file(&mut state, &key).await?;
        match state.files.get(&key) {
            Some(Some(file)) => Ok(file.snapshot()),
            _ => Err(RepoError::FileNotFound),
        }
    }

    pub async fn get_line(&self, path: &str, line_id: &str) -> Result<LineSnapshot, RepoError> {
        let key = path_key(&normalize_path(path)?);
        let mut state = self.lock_existing().await?;
        self.ensure_file(&mut state, &key).await?;
        let Some(Some(file)) = state.files.get(&key) else {
            return Err(RepoError::FileNotFound);
        };
        file.line(line_id).map(LineSnapshot::from).ok_or(RepoError::Model(ModelError::LineNotFound))
    }

    pub async fn insert(
        &self,
        actor: &Actor,
        path: &str,
        line_id: &str,
        column: usize,
        data: &str,
    ) -> Result<(), RepoError> {
        let args = json!({ "lineId": line_id, "column": column, "data": data });
        self.edit(actor, path, "insert", args, |file, now| {
            file.plan_insert(line_id, column, data, now)
        })
        .await
    }

    pub async fn erase(
        &self,
        actor: &Actor,
        path: &str,
        line_id: &str,
        column: usize,
        count: usize,
    ) -> Result<(), RepoError> {
        let args = json!({ "lineId": line_id, "column": column, "count": count });
        self.edit(actor, path, "erase", args, |file, now| {
            file.plan_erase(line_id, column, count, now)
        })
        .await
    }

    pub async fn split(
        &self,
        actor: &Actor,
        path: &str,
        line_id: &str,
        at: SplitAt,
        new_line_id: &str,
    ) -> Result<(), RepoError> {
        let column = match at {
            SplitAt::End => -1,
            SplitAt::Column(column) => i64::try_from(column).unwrap_or(i64::MAX),
        };
        let args = json!({ "lineId": line_id, "column": column, "newLineId": new_line_id });
        self.edit(actor, path, "split", args, |file, now| {
            file.plan_split(line_id, at, new_line_id, now)
        })
        .await
    }

    pub async fn merge(&self, actor: &Actor, path: &str, line_id: &str) -> Result<(), RepoError> {
        let args = json!({ "lineId": line_id });
        self.edit(actor, path, "merge", args, |file, now| file.plan_merge(line_id, now)).await
    }

    /// Sorted paths, optionally filtered by a regular expression.
    pub async fn list_files(&self, pattern: Option<&str>) -> Result<Vec<String>, RepoError> {
        let pattern = pattern.map(compile_pattern).transpose()?;
        let _state = self.lock_existing().await?;
        let paths = self.store.file_list(&self.name).await?;
        Ok(match pattern {
            Some(pattern) => paths.into_iter().filter(|path| pattern.is_match(path)).collect(),
            None => paths,
        })
    }

    /// Register `actor` for live `sync` frames. Without an explicit pattern
    /// the persisted rule is reused, falling back to every path.
    pub async fn listen(&self, actor: &Actor, pattern: Option<&str>) -> Result<String, RepoError> {
        let mut state = self.lock_existing().await?;
        self.authorize(&mut state, actor, Role::Observer).await?;
        let pattern = match pattern {
            Some(pattern) => pattern.to_owned(),
            None => self
                .store
                .listener_get(&self.name, &actor.name)
                .await?
                .map(|rule| rule.pattern)
                .unwrap_or_else(|| DEFAULT_LISTEN_PATTERN.to_owned()),
        };
        let compiled = compile_pattern(&pattern)?;

        let rule = ListenerRule { pattern: pattern.clone(), mode: LIVE_MODE.to_owned() };
        self.store.listener_set(&self.name, &actor.name, &rule).await?;
        state.listeners.insert(
            actor.conn_id,
            LiveListener { user: actor.name.clone(), pattern: compiled, outbox: actor.outbox.clone() },
        );

        debug!(repo = %self.name, user = %actor.name, pattern = %pattern, "listener registered");
        Ok(pattern)
    }

    pub async fn unlisten(&self, conn_id: Uuid) -> Result<(), RepoError> {
        let mut state = self.lock_existing().await?;
        state.listeners.remove(&conn_id);
        Ok(())
    }

    /// Drop a closed or logged-out connection from the live set.
    pub(crate) async fn forget_connection(&self, conn_id: Uuid) {
        self.state.lock().await.listeners.remove(&conn_id);
    }

    async fn lock(&self) -> Result<MutexGuard<'_, RepoState>, RepoError> {
        let mut state = self.state.lock().await;
        if !state.retrieved {
            state.record = self.store.repo_get(&self.name).await?;
            state.retrieved = true;
            debug!(repo = %self.name, exists = state.record.is_some(), "repository hydrated");
        }
        Ok(state)
    }

    async fn lock_existing(&self) -> Result<MutexGuard<'_, RepoState>, RepoError> {
        let state = self.lock().await?;
        if state.record.is_none() {
            return Err(RepoError::RepoNotFound);
        }
        Ok(state)
    }

    async fn role_locked(&self, state: &mut RepoState, user: &str) -> Result<Role, RepoError> {
        let key = name_key(user);
        if let Some(role) = state.roles.get(&key) {
            return Ok(*role);
        }

        let role = self.store.role_get(&self.name, user).await?.unwrap_or(Role::None);
        state.roles.insert(key, role);
        Ok(role)
    }

    /// The actor's current role if it satisfies `required`.
    async fn authorize(
        &self,
        state: &mut RepoState,
        actor: &Actor,
        required: Role,
    ) -> Result<Role, RepoError> {
        let role = self.role_locked(state, &actor.name).await?;
        if !role.allows(required) {
            return Err(AccessError::InsufficientPermission.into());
        }
        Ok(role)
    }

    async fn ensure_file(&self, state: &mut RepoState, key: &str) -> Result<(), RepoError> {
        if state.files.contains_key(key) {
            return Ok(());
        }

        let file = match self.store.file_get(&self.name, key).await? {
            Some((record, lines)) => {
                Some(File::from_parts(record.path, record.version, record.updated, lines)?)
            }
            None => None,
        };
        state.files.insert(key.to_owned(), file);
        Ok(())
    }

    async fn edit<F>(
        &self,
        actor: &Actor,
        path: &str,
        op: &str,
        args: Value,
        plan: F,
    ) -> Result<(), RepoError>
    where
        F: FnOnce(&File, DateTime<Utc>) -> Result<LineChanges, ModelError>,
    {
        let key = path_key(&normalize_path(path)?);

        let mut state = self.lock_existing().await?;
        self.authorize(&mut state, actor, Role::Contributor).await?;
        self.ensure_file(&mut state, &key).await?;
        let Some(Some(file)) = state.files.get(&key) else {
            return Err(RepoError::FileNotFound);
        };

        let now = Utc::now();
        let changes = plan(file, now)?;
        let record = FileRecord { path: file.path.clone(), version: file.version + 1, updated: now };

        // Out of the cache while the write is in flight: a cancelled request
        // leaves nothing behind and the next access reloads from storage.
        let Some(Some(mut file)) = state.files.remove(&key) else {
            return Err(RepoError::FileNotFound);
        };
        if let Err(error) = self
            .store
            .apply_line_changes(&self.name, &key, &record, &changes.set, &changes.remove)
            .await
        {
            state.files.insert(key, Some(file));
            return Err(error.into());
        }
        file.apply(changes);

        let (display_path, version) = (file.path.clone(), file.version);
        state.files.insert(key, Some(file));
        debug!(repo = %self.name, path = %display_path, op, version, "line edit applied");

        self.broadcast(&mut state, actor, &[display_path.as_str()], op, args, version).await;
        Ok(())
    }

    /// Push a `sync` frame to every other live listener whose pattern matches
    /// one of `paths` and who still holds at least observer.
    async fn broadcast(
        &self,
        state: &mut RepoState,
        actor: &Actor,
        paths: &[&str],
        op: &str,
        args: Value,
        version: u64,
    ) {
        let targets: Vec<(Uuid, String)> = state
            .listeners
            .iter()
            .filter(|(conn_id, listener)| {
                **conn_id != actor.conn_id && paths.iter().any(|path| listener.pattern.is_match(path))
            })
            .map(|(conn_id, listener)| (*conn_id, listener.user.clone()))
            .collect();
        if targets.is_empty() {
            return;
        }

        let frame = Outbound::Notification(Notification::Sync {
            repo: self.name.clone(),
            path: paths.first().map(|path| (*path).to_owned()).unwrap_or_default(),
            op: op.to_owned(),
            args,
            origin: actor.name.clone(),
            version,
            time: Utc::now().timestamp_millis(),
        });

        for (conn_id, user) in targets {
            match self.role_locked(state, &user).await {
                Ok(role) if role.allows(Role::Observer) => {}
                Ok(_) => continue,
                Err(error) => {
                    warn!(repo = %self.name, user = %user, error = ?error, "skipping listener");
                    continue;
                }
            }

            let delivered = state
                .listeners
                .get(&conn_id)
                .is_some_and(|listener| listener.outbox.send(frame.clone()).is_ok());
            if !delivered {
                state.listeners.remove(&conn_id);
            }
        }
    }
}

fn file_record(file: &File) -> FileRecord {
    FileRecord { path: file.path.clone(), version: file.version, updated: file.updated }
}

fn compile_pattern(pattern: &str) -> Result<Regex, RepoError> {
    Ok(RegexBuilder::new(pattern).size_limit(PATTERN_SIZE_LIMIT).build()?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bittle_common::protocol::{Notification, Outbound};
    use chrono::Utc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::{Actor, RepoError, Repository};
    use crate::access::{AccessError, Role};
    use crate::model::{ModelError, SplitAt};
    use crate::session::ClientRegistry;
    use crate::store::{ListenerRule, RepoRecord, Store, UserRecord};

    fn actor(name: &str) -> (Actor, mpsc::UnboundedReceiver<Outbound>) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        (Actor { conn_id: Uuid::new_v4(), name: name.to_owned(), outbox }, inbox)
    }

    async fn register(store: &Store, name: &str) {
        let user = UserRecord {
            name: name.to_owned(),
            pass_hash: "x".to_owned(),
            email: None,
            created_at: Utc::now(),
        };
        store.user_create(&user).await.expect("user should be created");
    }

    async fn repo_with_owner() -> (Repository, Store, Actor, mpsc::UnboundedReceiver<Outbound>) {
        let store = Store::memory();
        register(&store, "alice").await;
        let repo = Repository::new("r1", store.clone(), ClientRegistry::default(), "0");
        let (alice, inbox) = actor("alice");
        repo.create(&alice).await.expect("repo should be created");
        (repo, store, alice, inbox)
    }

    #[tokio::test]
    async fn creator_becomes_owner_and_name_is_unique() {
        let (repo, store, alice, _inbox) = repo_with_owner().await;
        assert_eq!(repo.get_role("Alice").await.expect("role"), Role::Owner);
        assert!(matches!(repo.create(&alice).await, Err(RepoError::NameTaken)));

        let fresh = Repository::new("R1", store, ClientRegistry::default(), "0");
        assert!(fresh.exists().await.expect("hydrates from storage"));
    }

    #[tokio::test]
    async fn missing_repository_fails_every_operation() {
        let repo = Repository::new("ghost", Store::memory(), ClientRegistry::default(), "0");
        assert!(!repo.exists().await.expect("lookup"));
        assert!(matches!(repo.get_role("alice").await, Err(RepoError::RepoNotFound)));
        assert!(matches!(repo.get_file("a.txt").await, Err(RepoError::RepoNotFound)));
    }

    #[tokio::test]
    async fn unknown_users_resolve_to_none_repeatedly() {
        let (repo, _store, _alice, _inbox) = repo_with_owner().await;
        assert_eq!(repo.get_role("nobody").await.expect("role"), Role::None);
        assert_eq!(repo.get_role("nobody").await.expect("cached role"), Role::None);
    }

    #[tokio::test]
    async fn file_paths_are_unique_case_insensitively() {
        let (repo, _store, alice, _inbox) = repo_with_owner().await;
        repo.create_file(&alice, "a.txt", None).await.expect("create file");
        assert!(matches!(repo.create_file(&alice, "a.txt", None).await, Err(RepoError::FileExists)));
        assert!(matches!(repo.create_file(&alice, "A.TXT", None).await, Err(RepoError::FileExists)));
        assert!(matches!(
            repo.create_file(&alice, "../x", None).await,
            Err(RepoError::InvalidPath(_))
        ));

        let file = repo.get_file("a.txt").await.expect("file exists");
        assert_eq!(file.lines.len(), 1);
        assert_eq!(file.lines[0].line_id, "0");
        assert_eq!(file.lines[0].line, "");
    }

    #[tokio::test]
    async fn line_edits_follow_documented_scenarios() {
        let (repo, _store, alice, _inbox) = repo_with_owner().await;
        repo.create_file(&alice, "a.txt", None).await.expect("create file");

        repo.insert(&alice, "a.txt", "0", 0, "Hello World").await.expect("insert");
        assert_eq!(repo.get_line("a.txt", "0").await.expect("line").line, "Hello World");

        repo.erase(&alice, "a.txt", "0", 5, 1).await.expect("erase");
        assert_eq!(repo.get_line("a.txt", "0").await.expect("line").line, "HelloWorld");

        repo.split(&alice, "a.txt", "0", SplitAt::Column(5), "1").await.expect("split");
        let head = repo.get_line("a.txt", "0").await.expect("head");
        let tail = repo.get_line("a.txt", "1").await.expect("tail");
        assert_eq!((head.line.as_str(), head.next.as_deref()), ("Hello", Some("1")));
        assert_eq!((tail.line.as_str(), tail.previous.as_deref()), ("World", Some("0")));

        repo.merge(&alice, "a.txt", "1").await.expect("merge");
        assert_eq!(repo.get_line("a.txt", "0").await.expect("line").line, "HelloWorld");
        assert!(matches!(
            repo.get_line("a.txt", "1").await,
            Err(RepoError::Model(ModelError::LineNotFound))
        ));
        assert_eq!(repo.get_file("a.txt").await.expect("file").version, 4);
    }

    #[tokio::test]
    async fn edits_survive_reload_from_storage() {
        let (repo, store, alice, _inbox) = repo_with_owner().await;
        repo.create_file(&alice, "dir\\b.txt", Some("x")).await.expect("create file");
        repo.insert(&alice, "dir/b.txt", "x", 0, "ab").await.expect("insert");
        repo.split(&alice, "dir/b.txt", "x", SplitAt::End, "y").await.expect("split");

        let reloaded = Repository::new("r1", store, ClientRegistry::default(), "0");
        let file = reloaded.get_file("DIR/B.TXT").await.expect("file reloads");
        assert_eq!(file.path, "dir/b.txt");
        let ids: Vec<&str> = file.lines.iter().map(|line| line.line_id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y"]);
        assert_eq!(file.version, 2);
    }

    #[tokio::test]
    async fn storage_failure_leaves_cache_untouched() {
        let (repo, store, alice, _inbox) = repo_with_owner().await;
        repo.create_file(&alice, "a.txt", None).await.expect("create file");
        repo.insert(&alice, "a.txt", "0", 0, "keep").await.expect("insert");

        store.fail_writes(true).await;
        assert!(matches!(
            repo.insert(&alice, "a.txt", "0", 0, "lost").await,
            Err(RepoError::Storage(_))
        ));
        assert!(matches!(
            repo.split(&alice, "a.txt", "0", SplitAt::Column(2), "1").await,
            Err(RepoError::Storage(_))
        ));
        store.fail_writes(false).await;

        let file = repo.get_file("a.txt").await.expect("file");
        assert_eq!(file.lines.len(), 1);
        assert_eq!(file.lines[0].line, "keep");
        assert_eq!(file.version, 1);
    }

    #[tokio::test]
    async fn move_and_delete_update_the_index() {
        let (repo, _store, alice, _inbox) = repo_with_owner().await;
        repo.create_file(&alice, "a.txt", None).await.expect("create a");
        repo.create_file(&alice, "b.txt", None).await.expect("create b");

        assert!(matches!(repo.move_file(&alice, "a.txt", "B.txt").await, Err(RepoError::FileExists)));
        assert!(matches!(repo.move_file(&alice, "z.txt", "y.txt").await, Err(RepoError::FileNotFound)));
        repo.move_file(&alice, "a.txt", "c.txt").await.expect("move");
        assert!(matches!(repo.get_file("a.txt").await, Err(RepoError::FileNotFound)));
        assert_eq!(repo.list_files(None).await.expect("list"), vec!["b.txt", "c.txt"]);
        assert_eq!(repo.list_files(Some("^c")).await.expect("list"), vec!["c.txt"]);
        assert!(matches!(repo.list_files(Some("(")).await, Err(RepoError::InvalidPattern(_))));

        repo.delete_file(&alice, "c.txt").await.expect("delete");
        assert!(matches!(repo.delete_file(&alice, "c.txt").await, Err(RepoError::FileNotFound)));
    }

    #[tokio::test]
    async fn role_changes_respect_order_and_notify_target() {
        let store = Store::memory();
        for name in ["alice", "bob", "carol"] {
            register(&store, name).await;
        }
        let clients = ClientRegistry::default();
        let repo = Repository::new("r1", store, clients.clone(), "0");
        let (alice, _alice_inbox) = actor("alice");
        let (bob, mut bob_inbox) = actor("bob");
        repo.create(&alice).await.expect("create repo");
        clients.register("bob", bob.conn_id, bob.outbox.clone()).await;

        repo.set_role(&alice, "bob", Role::Manager).await.expect("grant manager");
        match bob_inbox.try_recv().expect("bob is notified") {
            Outbound::Notification(Notification::Role { role, origin, .. }) => {
                assert_eq!(role, "manager");
                assert_eq!(origin, "alice");
            }
            other => panic!("unexpected frame {other:?}"),
        }

        assert!(matches!(
            repo.set_role(&bob, "carol", Role::Owner).await,
            Err(RepoError::Access(AccessError::InsufficientPermission))
        ));
        assert!(matches!(
            repo.set_role(&bob, "alice", Role::Observer).await,
            Err(RepoError::Access(AccessError::InsufficientPermission))
        ));
        assert!(matches!(
            repo.set_role(&bob, "carol", Role::None).await,
            Err(RepoError::Access(AccessError::NoExistingRole))
        ));
        assert!(matches!(
            repo.set_role(&bob, "dave", Role::Observer).await,
            Err(RepoError::UserNotFound)
        ));

        repo.set_role(&bob, "carol", Role::Contributor).await.expect("grant");
        assert_eq!(repo.get_role("carol").await.expect("role"), Role::Contributor);
        repo.set_role(&bob, "carol", Role::None).await.expect("revoke");
        assert_eq!(repo.get_role("carol").await.expect("role"), Role::None);
    }

    #[tokio::test]
    async fn demoted_manager_loses_grant_and_edit_rights() {
        let store = Store::memory();
        for name in ["alice", "bob", "carol"] {
            register(&store, name).await;
        }
        let repo = Repository::new("r1", store, ClientRegistry::default(), "0");
        let (alice, _alice_inbox) = actor("alice");
        let (bob, _bob_inbox) = actor("bob");
        repo.create(&alice).await.expect("create repo");
        repo.create_file(&alice, "a.txt", None).await.expect("create file");

        repo.set_role(&alice, "bob", Role::Manager).await.expect("grant manager");
        assert_eq!(repo.get_role("bob").await.expect("role"), Role::Manager);
        repo.set_role(&alice, "bob", Role::Observer).await.expect("demote");

        assert!(matches!(
            repo.set_role(&bob, "carol", Role::Contributor).await,
            Err(RepoError::Access(AccessError::InsufficientPermission))
        ));
        assert_eq!(repo.get_role("carol").await.expect("role"), Role::None);
        assert!(matches!(
            repo.insert(&bob, "a.txt", "0", 0, "x").await,
            Err(RepoError::Access(AccessError::InsufficientPermission))
        ));
        assert!(matches!(
            repo.delete_file(&bob, "a.txt").await,
            Err(RepoError::Access(AccessError::InsufficientPermission))
        ));
        assert_eq!(repo.get_line("a.txt", "0").await.expect("line").line, "");
        repo.listen(&bob, None).await.expect("observers may still listen");
    }

    #[tokio::test]
    async fn abandoned_role_write_rereads_storage() {
        let (repo, store, alice, _inbox) = repo_with_owner().await;
        register(&store, "bob").await;
        assert_eq!(repo.get_role("bob").await.expect("role"), Role::None);

        let hold = store.hold_writes().await.expect("memory store");
        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), repo.set_role(&alice, "bob", Role::Contributor))
                .await;
        assert!(abandoned.is_err(), "write should queue behind the hold");
        drop(hold);

        // The write reached storage even though its caller gave up.
        store.role_set("r1", "bob", Role::Contributor).await.expect("store role");
        assert_eq!(repo.get_role("bob").await.expect("role"), Role::Contributor);
    }

    #[tokio::test]
    async fn abandoned_create_rehydrates() {
        let store = Store::memory();
        register(&store, "alice").await;
        let repo = Repository::new("r1", store.clone(), ClientRegistry::default(), "0");
        let (alice, _inbox) = actor("alice");

        let hold = store.hold_writes().await.expect("memory store");
        let abandoned = tokio::time::timeout(Duration::from_millis(50), repo.create(&alice)).await;
        assert!(abandoned.is_err(), "write should queue behind the hold");
        drop(hold);

        let record = RepoRecord { name: "r1".to_owned(), owner: "alice".to_owned(), created_at: Utc::now() };
        let rule = ListenerRule { pattern: ".*".to_owned(), mode: "live".to_owned() };
        store.repo_create(&record, &rule).await.expect("store repo");
        assert!(repo.exists().await.expect("lookup"));
        assert_eq!(repo.get_role("alice").await.expect("role"), Role::Owner);
        assert!(matches!(repo.create(&alice).await, Err(RepoError::NameTaken)));
    }

    #[tokio::test]
    async fn failed_role_write_keeps_stored_role() {
        let (repo, store, alice, _inbox) = repo_with_owner().await;
        register(&store, "bob").await;
        repo.set_role(&alice, "bob", Role::Observer).await.expect("grant");

        store.fail_writes(true).await;
        assert!(matches!(
            repo.set_role(&alice, "bob", Role::Manager).await,
            Err(RepoError::Storage(_))
        ));
        store.fail_writes(false).await;
        assert_eq!(repo.get_role("bob").await.expect("role"), Role::Observer);
    }

    #[tokio::test]
    async fn sync_frames_reach_other_matching_listeners() {
        let store = Store::memory();
        register(&store, "alice").await;
        register(&store, "bob").await;
        let repo = Repository::new("r1", store, ClientRegistry::default(), "0");
        let (alice, mut alice_inbox) = actor("alice");
        let (bob, mut bob_inbox) = actor("bob");
        let (bob_docs, mut bob_docs_inbox) = actor("bob");
        repo.create(&alice).await.expect("create repo");
        repo.set_role(&alice, "bob", Role::Observer).await.expect("grant");
        assert_eq!(repo.listen(&bob, None).await.expect("listen"), ".*");
        repo.listen(&bob_docs, Some("^docs/")).await.expect("listen docs");

        repo.create_file(&alice, "a.txt", None).await.expect("create file");
        repo.insert(&alice, "a.txt", "0", 0, "hi").await.expect("insert");

        assert!(alice_inbox.try_recv().is_err(), "origin is excluded");
        assert!(bob_docs_inbox.try_recv().is_err(), "pattern does not match");

        let ops: Vec<(String, u64)> = std::iter::from_fn(|| bob_inbox.try_recv().ok())
            .map(|frame| match frame {
                Outbound::Notification(Notification::Sync { op, version, origin, .. }) => {
                    assert_eq!(origin, "alice");
                    (op, version)
                }
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(ops, vec![("createFile".to_owned(), 0), ("insert".to_owned(), 1)]);

        repo.unlisten(bob.conn_id).await.expect("unlisten");
        repo.set_role(&alice, "bob", Role::None).await.expect("revoke");
        repo.insert(&alice, "a.txt", "0", 0, "!").await.expect("insert");
        assert!(bob_inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_splits_keep_one_chain() {
        let (repo, _store, alice, _inbox) = repo_with_owner().await;
        let repo = Arc::new(repo);
        repo.create_file(&alice, "a.txt", None).await.expect("create file");
        repo.insert(&alice, "a.txt", "0", 0, "0123456789").await.expect("insert");

        let mut tasks = Vec::new();
        for index in 0..16 {
            let repo = Arc::clone(&repo);
            let alice = alice.clone();
            tasks.push(tokio::spawn(async move {
                repo.split(&alice, "a.txt", "0", SplitAt::Column(1), &format!("n{index}")).await
            }));
        }
        for task in tasks {
            task.await.expect("task joins").expect("split succeeds");
        }

        let file = repo.get_file("a.txt").await.expect("file");
        assert_eq!(file.lines.len(), 17);
        assert_eq!(file.version, 17);
        for pair in file.lines.windows(2) {
            assert_eq!(pair[0].next.as_deref(), Some(pair[1].line_id.as_str()));
            assert_eq!(pair[1].previous.as_deref(), Some(pair[0].line_id.as_str()));
        }
    }
}
