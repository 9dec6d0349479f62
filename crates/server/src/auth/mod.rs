// Account identity: registration, credential checks and password recovery.

mod mailer;
mod password;

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::info;

use crate::store::{Store, StoreError, UserRecord};

pub use mailer::{DisabledMailer, MailError, Mailer};
pub use password::{generate_temporary_password, hash_password, verify_password};

#[cfg(test)]
pub(crate) use mailer::testing::RecordingMailer;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Name is already taken.")]
    NameTaken,

    #[error("Account does not exist.")]
    AccountNotFound,

    #[error("Incorrect pass.")]
    IncorrectPass,

    #[error("Account has no email.")]
    NoEmail,

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error(transparent)]
    Mail(#[from] MailError),

    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

/// Account operations over the user table. Hashing runs on the blocking pool.
#[derive(Clone)]
pub struct Accounts {
    store: Store,
    mailer: Arc<dyn Mailer>,
}

impl Accounts {
    pub fn new(store: Store, mailer: Arc<dyn Mailer>) -> Self {
        Self { store, mailer }
    }

    pub async fn register(&self, name: &str, pass: &str, email: Option<&str>) -> Result<(), AuthError> {
        if self.store.user_get(name).await?.is_some() {
            return Err(AuthError::NameTaken);
        }

        let user = UserRecord {
            name: name.to_owned(),
            pass_hash: hash_blocking(pass.to_owned()).await?,
            email: email.map(str::to_owned),
            created_at: Utc::now(),
        };
        self.store.user_create(&user).await.map_err(|error| match error {
            StoreError::Conflict => AuthError::NameTaken,
            other => AuthError::Storage(other),
        })?;

        info!(user = %name, "account registered");
        Ok(())
    }

    /// Check credentials and return the stored account.
    pub async fn authenticate(&self, name: &str, pass: &str) -> Result<UserRecord, AuthError> {
        let user = self.store.user_get(name).await?.ok_or(AuthError::AccountNotFound)?;
        if !verify_blocking(pass.to_owned(), user.pass_hash.clone()).await? {
            return Err(AuthError::IncorrectPass);
        }
        Ok(user)
    }

    pub async fn change_pass(&self, name: &str, pass: &str, new_pass: &str) -> Result<(), AuthError> {
        let user = self.authenticate(name, pass).await?;
        let hash = hash_blocking(new_pass.to_owned()).await?;
        self.store.user_set_pass(&user.name, &hash).await?;
        info!(user = %user.name, "password changed");
        Ok(())
    }

    pub async fn change_email(&self, name: &str, pass: &str, new_email: &str) -> Result<(), AuthError> {
        let user = self.authenticate(name, pass).await?;
        self.store.user_set_email(&user.name, new_email).await?;
        info!(user = %user.name, "email changed");
        Ok(())
    }

    /// Replace the password with a random one and mail it to the account.
    pub async fn reset_pass(&self, name: &str) -> Result<(), AuthError> {
        let user = self.store.user_get(name).await?.ok_or(AuthError::AccountNotFound)?;
        let email = user.email.as_deref().ok_or(AuthError::NoEmail)?;

        let temporary = generate_temporary_password();
        let hash = hash_blocking(temporary.clone()).await?;
        // The stored password only changes once the user can receive the new one.
        self.mailer.send_password_reset(email, &user.name, &temporary)?;
        self.store.user_set_pass(&user.name, &hash).await?;
        Ok(())
    }
}

async fn hash_blocking(pass: String) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || hash_password(&pass))
        .await
        .map_err(|error| AuthError::Hashing(error.to_string()))?
}

async fn verify_blocking(pass: String, hash: String) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || verify_password(&pass, &hash))
        .await
        .map_err(|error| AuthError::Hashing(error.to_string()))?
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Accounts, AuthError, DisabledMailer, RecordingMailer};
    use crate::store::Store;

    fn accounts() -> (Accounts, Arc<RecordingMailer>) {
        let mailer = Arc::new(RecordingMailer::default());
        (Accounts::new(Store::memory(), mailer.clone()), mailer)
    }

    #[tokio::test]
    async fn register_then_authenticate() {
        let (accounts, _) = accounts();
        accounts.register("Alice", "pw", None).await.expect("register");

        let user = accounts.authenticate("alice", "pw").await.expect("login");
        assert_eq!(user.name, "Alice");
        assert!(matches!(accounts.authenticate("alice", "nope").await, Err(AuthError::IncorrectPass)));
        assert!(matches!(accounts.authenticate("bob", "pw").await, Err(AuthError::AccountNotFound)));
        assert!(matches!(accounts.register("ALICE", "x", None).await, Err(AuthError::NameTaken)));
    }

    #[tokio::test]
    async fn change_pass_requires_current_password() {
        let (accounts, _) = accounts();
        accounts.register("alice", "old", None).await.expect("register");

        assert!(matches!(
            accounts.change_pass("alice", "wrong", "new").await,
            Err(AuthError::IncorrectPass)
        ));
        accounts.change_pass("alice", "old", "new").await.expect("change pass");
        accounts.authenticate("alice", "new").await.expect("new password works");
    }

    #[tokio::test]
    async fn reset_pass_mails_a_working_password() {
        let (accounts, mailer) = accounts();
        accounts.register("alice", "pw", None).await.expect("register");
        assert!(matches!(accounts.reset_pass("alice").await, Err(AuthError::NoEmail)));

        accounts.change_email("alice", "pw", "a@example.com").await.expect("set email");
        accounts.reset_pass("alice").await.expect("reset");

        let (email, name, temporary) =
            mailer.sent.lock().expect("lock").last().cloned().expect("one delivery");
        assert_eq!((email.as_str(), name.as_str()), ("a@example.com", "alice"));
        accounts.authenticate("alice", &temporary).await.expect("temporary password works");
        assert!(matches!(accounts.authenticate("alice", "pw").await, Err(AuthError::IncorrectPass)));
    }

    #[tokio::test]
    async fn undelivered_reset_keeps_the_old_password() {
        let accounts = Accounts::new(Store::memory(), Arc::new(DisabledMailer));
        accounts.register("alice", "pw", Some("a@example.com")).await.expect("register");

        assert!(matches!(accounts.reset_pass("alice").await, Err(AuthError::Mail(_))));
        accounts.authenticate("alice", "pw").await.expect("old password still works");
    }
}
