// Persistence collaborator: the narrow CRUD surface the repository aggregate
// and the session need, backed by Postgres or an in-process map.

mod memory;
mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::access::Role;
use crate::model::Line;

pub use memory::MemoryState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record already exists")]
    Conflict,

    #[error("record not found")]
    NotFound,

    #[error("stored record is invalid: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(test)]
    #[error("injected storage failure")]
    Injected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Display form as registered.
    pub name: String,
    pub pass_hash: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRecord {
    pub name: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub version: u64,
    pub updated: DateTime<Utc>,
}

/// Persisted subscription of one user to path changes in one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerRule {
    pub pattern: String,
    pub mode: String,
}

/// Lower-cased lookup key for user and repository names.
pub fn name_key(name: &str) -> String {
    name.to_lowercase()
}

#[derive(Clone)]
pub enum Store {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryState>>),
}

impl Store {
    pub fn memory() -> Self {
        Self::Memory(Arc::default())
    }

    pub async fn user_get(&self, name: &str) -> Result<Option<UserRecord>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::user_get(pool, &name_key(name)).await,
            Self::Memory(state) => memory::user_get(state, &name_key(name)).await,
        }
    }

    pub async fn user_create(&self, user: &UserRecord) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::user_create(pool, &name_key(&user.name), user).await,
            Self::Memory(state) => memory::user_create(state, &name_key(&user.name), user).await,
        }
    }

    pub async fn user_set_pass(&self, name: &str, pass_hash: &str) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::user_set_pass(pool, &name_key(name), pass_hash).await,
            Self::Memory(state) => memory::user_set_pass(state, &name_key(name), pass_hash).await,
        }
    }

    pub async fn user_set_email(&self, name: &str, email: &str) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::user_set_email(pool, &name_key(name), email).await,
            Self::Memory(state) => memory::user_set_email(state, &name_key(name), email).await,
        }
    }

    /// Create a repository together with its owner role and listener rule.
    pub async fn repo_create(
        &self,
        repo: &RepoRecord,
        owner_rule: &ListenerRule,
    ) -> Result<(), StoreError> {
        let key = name_key(&repo.name);
        let owner = name_key(&repo.owner);
        match self {
            Self::Postgres(pool) => postgres::repo_create(pool, &key, &owner, repo, owner_rule).await,
            Self::Memory(state) => memory::repo_create(state, &key, &owner, repo, owner_rule).await,
        }
    }

    pub async fn repo_get(&self, repo: &str) -> Result<Option<RepoRecord>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::repo_get(pool, &name_key(repo)).await,
            Self::Memory(state) => memory::repo_get(state, &name_key(repo)).await,
        }
    }

    pub async fn role_set(&self, repo: &str, user: &str, role: Role) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                postgres::role_set(pool, &name_key(repo), &name_key(user), role).await
            }
            Self::Memory(state) => memory::role_set(state, &name_key(repo), &name_key(user), role).await,
        }
    }

    pub async fn role_get(&self, repo: &str, user: &str) -> Result<Option<Role>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::role_get(pool, &name_key(repo), &name_key(user)).await,
            Self::Memory(state) => memory::role_get(state, &name_key(repo), &name_key(user)).await,
        }
    }

    pub async fn role_delete(&self, repo: &str, user: &str) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                postgres::role_delete(pool, &name_key(repo), &name_key(user)).await
            }
            Self::Memory(state) => memory::role_delete(state, &name_key(repo), &name_key(user)).await,
        }
    }

    pub async fn listener_set(
        &self,
        repo: &str,
        user: &str,
        rule: &ListenerRule,
    ) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                postgres::listener_set(pool, &name_key(repo), &name_key(user), rule).await
            }
            Self::Memory(state) => {
                memory::listener_set(state, &name_key(repo), &name_key(user), rule).await
            }
        }
    }

    pub async fn listener_get(
        &self,
        repo: &str,
        user: &str,
    ) -> Result<Option<ListenerRule>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                postgres::listener_get(pool, &name_key(repo), &name_key(user)).await
            }
            Self::Memory(state) => memory::listener_get(state, &name_key(repo), &name_key(user)).await,
        }
    }

    /// Create a file holding one seed line. `key` is the case-folded path.
    pub async fn file_create(
        &self,
        repo: &str,
        key: &str,
        file: &FileRecord,
        seed: &Line,
    ) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::file_create(pool, &name_key(repo), key, file, seed).await,
            Self::Memory(state) => memory::file_create(state, &name_key(repo), key, file, seed).await,
        }
    }

    /// Re-key a file; its lines follow it untouched.
    pub async fn file_move(
        &self,
        repo: &str,
        key: &str,
        new_key: &str,
        file: &FileRecord,
    ) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                postgres::file_move(pool, &name_key(repo), key, new_key, file).await
            }
            Self::Memory(state) => memory::file_move(state, &name_key(repo), key, new_key, file).await,
        }
    }

    pub async fn file_delete(&self, repo: &str, key: &str) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::file_delete(pool, &name_key(repo), key).await,
            Self::Memory(state) => memory::file_delete(state, &name_key(repo), key).await,
        }
    }

    pub async fn file_get(
        &self,
        repo: &str,
        key: &str,
    ) -> Result<Option<(FileRecord, Vec<Line>)>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::file_get(pool, &name_key(repo), key).await,
            Self::Memory(state) => memory::file_get(state, &name_key(repo), key).await,
        }
    }

    /// Display paths of every file in the repository, sorted.
    pub async fn file_list(&self, repo: &str) -> Result<Vec<String>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::file_list(pool, &name_key(repo)).await,
            Self::Memory(state) => memory::file_list(state, &name_key(repo)).await,
        }
    }

    /// Write every line state of one edit plus the new file version atomically.
    pub async fn apply_line_changes(
        &self,
        repo: &str,
        key: &str,
        file: &FileRecord,
        set: &[Line],
        remove: &[String],
    ) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                postgres::apply_line_changes(pool, &name_key(repo), key, file, set, remove).await
            }
            Self::Memory(state) => {
                memory::apply_line_changes(state, &name_key(repo), key, file, set, remove).await
            }
        }
    }

    /// Make every later write fail until cleared.
    #[cfg(test)]
    pub(crate) async fn fail_writes(&self, fail: bool) {
        if let Self::Memory(state) = self {
            state.write().await.fail_writes = fail;
        }
    }

    /// Shared hold on the memory store: reads proceed, writes queue until the
    /// guard drops.
    #[cfg(test)]
    pub(crate) async fn hold_writes(&self) -> Option<tokio::sync::OwnedRwLockReadGuard<MemoryState>> {
        match self {
            Self::Memory(state) => Some(Arc::clone(state).read_owned().await),
            Self::Postgres(_) => None,
        }
    }

    /// Exclusive hold on the memory store: every access queues until the
    /// guard drops.
    #[cfg(test)]
    pub(crate) async fn hold_all(&self) -> Option<tokio::sync::OwnedRwLockWriteGuard<MemoryState>> {
        match self {
            Self::Memory(state) => Some(Arc::clone(state).write_owned().await),
            Self::Postgres(_) => None,
        }
    }
}
