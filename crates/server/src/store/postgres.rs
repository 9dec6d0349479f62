use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use super::{FileRecord, ListenerRule, RepoRecord, StoreError, UserRecord};
use crate::access::Role;
use crate::model::Line;

#[derive(sqlx::FromRow)]
struct UserRow {
    name: String,
    pass_hash: String,
    email: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for UserRecord {
    fn from(row: UserRow) -> Self {
        Self { name: row.name, pass_hash: row.pass_hash, email: row.email, created_at: row.created_at }
    }
}

#[derive(sqlx::FromRow)]
struct RepoRow {
    name: String,
    owner: String,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct FileRow {
    path: String,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = StoreError;

    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        Ok(Self { path: row.path, version: from_db_version(row.version)?, updated: row.updated_at })
    }
}

#[derive(sqlx::FromRow)]
struct LineRow {
    line_id: String,
    text: String,
    previous_id: Option<String>,
    next_id: Option<String>,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LineRow> for Line {
    type Error = StoreError;

    fn try_from(row: LineRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.line_id,
            text: row.text,
            previous: row.previous_id,
            next: row.next_id,
            version: from_db_version(row.version)?,
            updated: row.updated_at,
        })
    }
}

fn from_db_version(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative version {value}")))
}

fn to_db_version(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("version {value} out of range")))
}

fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(database_error) = &error {
        if database_error.code().as_deref() == Some("23505") {
            return StoreError::Conflict;
        }
    }

    StoreError::Database(error)
}

pub(super) async fn user_get(pool: &PgPool, key: &str) -> Result<Option<UserRecord>, StoreError> {
    let row = sqlx::query_as::<_, UserRow>(
        "SELECT name, pass_hash, email, created_at FROM users WHERE name_key = $1",
    )
    .bind(key)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(UserRecord::from))
}

pub(super) async fn user_create(
    pool: &PgPool,
    key: &str,
    user: &UserRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO users (name_key, name, pass_hash, email, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(key)
    .bind(&user.name)
    .bind(&user.pass_hash)
    .bind(&user.email)
    .bind(user.created_at)
    .execute(pool)
    .await
    .map_err(map_sqlx_error)?;

    Ok(())
}

pub(super) async fn user_set_pass(pool: &PgPool, key: &str, pass_hash: &str) -> Result<(), StoreError> {
    let result = sqlx::query("UPDATE users SET pass_hash = $2 WHERE name_key = $1")
        .bind(key)
        .bind(pass_hash)
        .execute(pool)
        .await?;
    expect_one_row(result.rows_affected())
}

pub(super) async fn user_set_email(pool: &PgPool, key: &str, email: &str) -> Result<(), StoreError> {
    let result = sqlx::query("UPDATE users SET email = $2 WHERE name_key = $1")
        .bind(key)
        .bind(email)
        .execute(pool)
        .await?;
    expect_one_row(result.rows_affected())
}

pub(super) async fn repo_create(
    pool: &PgPool,
    key: &str,
    owner: &str,
    repo: &RepoRecord,
    owner_rule: &ListenerRule,
) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO repos (name_key, name, owner, created_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(key)
    .bind(&repo.name)
    .bind(&repo.owner)
    .bind(repo.created_at)
    .execute(&mut *tx)
    .await
    .map_err(map_sqlx_error)?;

    sqlx::query("INSERT INTO repo_roles (repo_key, user_key, role) VALUES ($1, $2, 'owner')")
        .bind(key)
        .bind(owner)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO repo_listeners (repo_key, user_key, pattern, mode)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(key)
    .bind(owner)
    .bind(&owner_rule.pattern)
    .bind(&owner_rule.mode)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

pub(super) async fn repo_get(pool: &PgPool, key: &str) -> Result<Option<RepoRecord>, StoreError> {
    let row = sqlx::query_as::<_, RepoRow>(
        "SELECT name, owner, created_at FROM repos WHERE name_key = $1",
    )
    .bind(key)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| RepoRecord { name: row.name, owner: row.owner, created_at: row.created_at }))
}

pub(super) async fn role_set(pool: &PgPool, repo: &str, user: &str, role: Role) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO repo_roles (repo_key, user_key, role)
        VALUES ($1, $2, $3)
        ON CONFLICT (repo_key, user_key) DO UPDATE SET role = EXCLUDED.role
        "#,
    )
    .bind(repo)
    .bind(user)
    .bind(role.as_str())
    .execute(pool)
    .await?;

    Ok(())
}

pub(super) async fn role_get(pool: &PgPool, repo: &str, user: &str) -> Result<Option<Role>, StoreError> {
    let value = sqlx::query_scalar::<_, String>(
        "SELECT role FROM repo_roles WHERE repo_key = $1 AND user_key = $2",
    )
    .bind(repo)
    .bind(user)
    .fetch_optional(pool)
    .await?;

    value
        .map(|value| {
            Role::from_db_value(&value)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown role '{value}'")))
        })
        .transpose()
}

pub(super) async fn role_delete(pool: &PgPool, repo: &str, user: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM repo_roles WHERE repo_key = $1 AND user_key = $2")
        .bind(repo)
        .bind(user)
        .execute(pool)
        .await?;

    Ok(())
}

pub(super) async fn listener_set(
    pool: &PgPool,
    repo: &str,
    user: &str,
    rule: &ListenerRule,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO repo_listeners (repo_key, user_key, pattern, mode)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (repo_key, user_key)
        DO UPDATE SET pattern = EXCLUDED.pattern, mode = EXCLUDED.mode
        "#,
    )
    .bind(repo)
    .bind(user)
    .bind(&rule.pattern)
    .bind(&rule.mode)
    .execute(pool)
    .await?;

    Ok(())
}

pub(super) async fn listener_get(
    pool: &PgPool,
    repo: &str,
    user: &str,
) -> Result<Option<ListenerRule>, StoreError> {
    let row = sqlx::query_as::<_, (String, String)>(
        "SELECT pattern, mode FROM repo_listeners WHERE repo_key = $1 AND user_key = $2",
    )
    .bind(repo)
    .bind(user)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(pattern, mode)| ListenerRule { pattern, mode }))
}

pub(super) async fn file_create(
    pool: &PgPool,
    repo: &str,
    key: &str,
    file: &FileRecord,
    seed: &Line,
) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO files (repo_key, path_key, path, version, updated_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(repo)
    .bind(key)
    .bind(&file.path)
    .bind(to_db_version(file.version)?)
    .bind(file.updated)
    .execute(&mut *tx)
    .await
    .map_err(map_sqlx_error)?;

    upsert_line(&mut tx, repo, key, seed).await?;

    tx.commit().await?;
    Ok(())
}

pub(super) async fn file_move(
    pool: &PgPool,
    repo: &str,
    key: &str,
    new_key: &str,
    file: &FileRecord,
) -> Result<(), StoreError> {
    // Lines follow through ON UPDATE CASCADE.
    let result = sqlx::query(
        r#"
        UPDATE files
        SET path_key = $3, path = $4, version = $5, updated_at = $6
        WHERE repo_key = $1 AND path_key = $2
        "#,
    )
    .bind(repo)
    .bind(key)
    .bind(new_key)
    .bind(&file.path)
    .bind(to_db_version(file.version)?)
    .bind(file.updated)
    .execute(pool)
    .await
    .map_err(map_sqlx_error)?;

    expect_one_row(result.rows_affected())
}

pub(super) async fn file_delete(pool: &PgPool, repo: &str, key: &str) -> Result<(), StoreError> {
    let result = sqlx::query("DELETE FROM files WHERE repo_key = $1 AND path_key = $2")
        .bind(repo)
        .bind(key)
        .execute(pool)
        .await?;
    expect_one_row(result.rows_affected())
}

pub(super) async fn file_get(
    pool: &PgPool,
    repo: &str,
    key: &str,
) -> Result<Option<(FileRecord, Vec<Line>)>, StoreError> {
    let Some(row) = sqlx::query_as::<_, FileRow>(
        "SELECT path, version, updated_at FROM files WHERE repo_key = $1 AND path_key = $2",
    )
    .bind(repo)
    .bind(key)
    .fetch_optional(pool)
    .await?
    else {
        return Ok(None);
    };

    let lines = sqlx::query_as::<_, LineRow>(
        r#"
        SELECT line_id, text, previous_id, next_id, version, updated_at
        FROM lines
        WHERE repo_key = $1 AND path_key = $2
        "#,
    )
    .bind(repo)
    .bind(key)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(Line::try_from)
    .collect::<Result<Vec<_>, _>>()?;

    Ok(Some((FileRecord::try_from(row)?, lines)))
}

pub(super) async fn file_list(pool: &PgPool, repo: &str) -> Result<Vec<String>, StoreError> {
    let paths = sqlx::query_scalar::<_, String>(
        "SELECT path FROM files WHERE repo_key = $1 ORDER BY path",
    )
    .bind(repo)
    .fetch_all(pool)
    .await?;

    Ok(paths)
}

pub(super) async fn apply_line_changes(
    pool: &PgPool,
    repo: &str,
    key: &str,
    file: &FileRecord,
    set: &[Line],
    remove: &[String],
) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;

    for line_id in remove {
        sqlx::query("DELETE FROM lines WHERE repo_key = $1 AND path_key = $2 AND line_id = $3")
            .bind(repo)
            .bind(key)
            .bind(line_id)
            .execute(&mut *tx)
            .await?;
    }

    for line in set {
        upsert_line(&mut tx, repo, key, line).await?;
    }

    let result = sqlx::query(
        r#"
        UPDATE files SET version = $3, updated_at = $4
        WHERE repo_key = $1 AND path_key = $2
        "#,
    )
    .bind(repo)
    .bind(key)
    .bind(to_db_version(file.version)?)
    .bind(file.updated)
    .execute(&mut *tx)
    .await?;
    expect_one_row(result.rows_affected())?;

    tx.commit().await?;
    Ok(())
}

async fn upsert_line(
    tx: &mut Transaction<'_, Postgres>,
    repo: &str,
    key: &str,
    line: &Line,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO lines (repo_key, path_key, line_id, text, previous_id, next_id, version, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (repo_key, path_key, line_id) DO UPDATE SET
            text = EXCLUDED.text,
            previous_id = EXCLUDED.previous_id,
            next_id = EXCLUDED.next_id,
            version = EXCLUDED.version,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(repo)
    .bind(key)
    .bind(&line.id)
    .bind(&line.text)
    .bind(&line.previous)
    .bind(&line.next)
    .bind(to_db_version(line.version)?)
    .bind(line.updated)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn expect_one_row(rows_affected: u64) -> Result<(), StoreError> {
    if rows_affected == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}
