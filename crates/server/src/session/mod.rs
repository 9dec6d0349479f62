// Per-connection state: identity, the role cache and pass-throughs into the
// repository aggregates. The pipeline owns one `Session` per socket.

mod clients;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::access::Role;
use crate::auth::Accounts;
use crate::error::RequestFailure;
use crate::model::{FileSnapshot, LineSnapshot, SplitAt};
use crate::repo::{Actor, RepoRegistry, Repository};
use crate::store::name_key;

pub use clients::{ClientRegistry, Outbox};

pub struct Session {
    conn_id: Uuid,
    peer: String,
    /// Account name once logged in, otherwise the peer address.
    name: String,
    authenticated: bool,
    /// Last resolved role per case-folded repository name.
    roles: HashMap<String, Role>,
    outbox: Outbox,
    accounts: Accounts,
    repos: RepoRegistry,
}

impl Session {
    pub fn new(
        conn_id: Uuid,
        peer: impl Into<String>,
        outbox: Outbox,
        accounts: Accounts,
        repos: RepoRegistry,
    ) -> Self {
        let peer = peer.into();
        Self {
            conn_id,
            name: peer.clone(),
            peer,
            authenticated: false,
            roles: HashMap::new(),
            outbox,
            accounts,
            repos,
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn cached_role(&self, repo: &str) -> Option<Role> {
        self.roles.get(&name_key(repo)).copied()
    }

    fn actor(&self) -> Actor {
        Actor { conn_id: self.conn_id, name: self.name.clone(), outbox: self.outbox.clone() }
    }

    async fn repo(&self, name: &str) -> Result<Arc<Repository>, RequestFailure> {
        Ok(self.repos.get(name).await?)
    }

    pub async fn register(
        &mut self,
        name: &str,
        pass: &str,
        email: Option<&str>,
    ) -> Result<(), RequestFailure> {
        Ok(self.accounts.register(name, pass, email).await?)
    }

    /// Verify credentials and adopt the account's display name.
    pub async fn login(&mut self, name: &str, pass: &str) -> Result<String, RequestFailure> {
        let user = self.accounts.authenticate(name, pass).await?;
        self.authenticated = true;
        self.name = user.name;
        self.repos.clients().register(&self.name, self.conn_id, self.outbox.clone()).await;
        info!(conn_id = %self.conn_id, user = %self.name, "logged in");
        Ok(self.name.clone())
    }

    /// Drop identity, the registry entry and every live listener this
    /// connection holds.
    pub async fn logout(&mut self) {
        if !self.authenticated {
            return;
        }
        self.repos.clients().unregister(&self.name, self.conn_id).await;
        for repo in self.roles.keys() {
            if let Ok(repo) = self.repos.get(repo).await {
                repo.forget_connection(self.conn_id).await;
            }
        }
        self.roles.clear();

        info!(conn_id = %self.conn_id, user = %self.name, "logged out");
        self.authenticated = false;
        self.name = self.peer.clone();
    }

    /// Cleanup after the socket closed.
    pub async fn disconnect(&mut self) {
        self.logout().await;
        debug!(conn_id = %self.conn_id, peer = %self.peer, "session closed");
    }

    pub async fn change_pass(
        &self,
        name: &str,
        pass: &str,
        new_pass: &str,
    ) -> Result<(), RequestFailure> {
        Ok(self.accounts.change_pass(name, pass, new_pass).await?)
    }

    pub async fn change_email(
        &self,
        name: &str,
        pass: &str,
        new_email: &str,
    ) -> Result<(), RequestFailure> {
        Ok(self.accounts.change_email(name, pass, new_email).await?)
    }

    pub async fn reset_pass(&self, name: &str) -> Result<(), RequestFailure> {
        Ok(self.accounts.reset_pass(name).await?)
    }

    pub async fn create_repo(&mut self, repo: &str) -> Result<(), RequestFailure> {
        self.repos.create(repo, &self.actor()).await?;
        self.roles.insert(name_key(repo), Role::Owner);
        Ok(())
    }

    /// The caller's current role on `repo`, refreshing the cache.
    pub async fn resolve_role(&mut self, repo: &str) -> Result<Role, RequestFailure> {
        let role = self.repo(repo).await?.get_role(&self.name).await?;
        self.roles.insert(name_key(repo), role);
        Ok(role)
    }

    pub async fn add_permission(&self, repo: &str, user: &str, role: &str) -> Result<(), RequestFailure> {
        let role = Role::from_str(role)?;
        self.repo(repo).await?.set_role(&self.actor(), user, role).await?;
        Ok(())
    }

    pub async fn remove_permission(&self, repo: &str, user: &str) -> Result<(), RequestFailure> {
        self.repo(repo).await?.set_role(&self.actor(), user, Role::None).await?;
        Ok(())
    }

    pub async fn listen(&self, repo: &str, path: Option<&str>) -> Result<String, RequestFailure> {
        Ok(self.repo(repo).await?.listen(&self.actor(), path).await?)
    }

    pub async fn unlisten(&self, repo: &str) -> Result<(), RequestFailure> {
        Ok(self.repo(repo).await?.unlisten(self.conn_id).await?)
    }

    pub async fn list_files(
        &self,
        repo: &str,
        pattern: Option<&str>,
    ) -> Result<Vec<String>, RequestFailure> {
        Ok(self.repo(repo).await?.list_files(pattern).await?)
    }

    pub async fn get_file(&self, repo: &str, path: &str) -> Result<FileSnapshot, RequestFailure> {
        Ok(self.repo(repo).await?.get_file(path).await?)
    }

    pub async fn get_line(
        &self,
        repo: &str,
        path: &str,
        line_id: &str,
    ) -> Result<LineSnapshot, RequestFailure> {
        Ok(self.repo(repo).await?.get_line(path, line_id).await?)
    }

    pub async fn create_file(
        &self,
        repo: &str,
        path: &str,
        line_id: Option<&str>,
    ) -> Result<(), RequestFailure> {
        Ok(self.repo(repo).await?.create_file(&self.actor(), path, line_id).await?)
    }

    pub async fn move_file(
        &self,
        repo: &str,
        path: &str,
        new_path: &str,
    ) -> Result<(), RequestFailure> {
        Ok(self.repo(repo).await?.move_file(&self.actor(), path, new_path).await?)
    }

    pub async fn delete_file(&self, repo: &str, path: &str) -> Result<(), RequestFailure> {
        Ok(self.repo(repo).await?.delete_file(&self.actor(), path).await?)
    }

    pub async fn insert(
        &self,
        repo: &str,
        path: &str,
        line_id: &str,
        column: usize,
        data: &str,
    ) -> Result<(), RequestFailure> {
        Ok(self.repo(repo).await?.insert(&self.actor(), path, line_id, column, data).await?)
    }

    pub async fn erase(
        &self,
        repo: &str,
        path: &str,
        line_id: &str,
        column: usize,
        count: usize,
    ) -> Result<(), RequestFailure> {
        Ok(self.repo(repo).await?.erase(&self.actor(), path, line_id, column, count).await?)
    }

    pub async fn split(
        &self,
        repo: &str,
        path: &str,
        line_id: &str,
        at: SplitAt,
        new_line_id: &str,
    ) -> Result<(), RequestFailure> {
        Ok(self.repo(repo).await?.split(&self.actor(), path, line_id, at, new_line_id).await?)
    }

    pub async fn merge(&self, repo: &str, path: &str, line_id: &str) -> Result<(), RequestFailure> {
        Ok(self.repo(repo).await?.merge(&self.actor(), path, line_id).await?)
    }
}
