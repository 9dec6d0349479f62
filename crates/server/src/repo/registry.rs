use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use super::{Actor, RepoError, Repository};
use crate::session::ClientRegistry;
use crate::store::{name_key, Store};

/// One [`Repository`] per case-folded name of a repository that exists.
#[derive(Clone)]
pub struct RepoRegistry {
    store: Store,
    clients: ClientRegistry,
    seed_line_id: Arc<str>,
    repos: Arc<RwLock<HashMap<String, Arc<Repository>>>>,
}

impl RepoRegistry {
    pub fn new(store: Store, clients: ClientRegistry, seed_line_id: impl Into<Arc<str>>) -> Self {
        Self { store, clients, seed_line_id: seed_line_id.into(), repos: Arc::default() }
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// The shared aggregate for `name`. Names unknown to storage are not
    /// retained.
    pub async fn get(&self, name: &str) -> Result<Arc<Repository>, RepoError> {
        let key = name_key(name);
        if let Some(repo) = self.repos.read().await.get(&key) {
            return Ok(Arc::clone(repo));
        }

        let candidate = self.build(name);
        if !candidate.exists().await? {
            return Err(RepoError::RepoNotFound);
        }

        let mut repos = self.repos.write().await;
        Ok(Arc::clone(repos.entry(key).or_insert(candidate)))
    }

    /// Create `name` owned by `actor`. The aggregate is registered before the
    /// write so concurrent lookups share it, and dropped again when creation
    /// fails and nothing was stored.
    pub async fn create(&self, name: &str, actor: &Actor) -> Result<(), RepoError> {
        let key = name_key(name);
        let repo = {
            let mut repos = self.repos.write().await;
            Arc::clone(repos.entry(key.clone()).or_insert_with(|| self.build(name)))
        };

        let Err(error) = repo.create(actor).await else {
            return Ok(());
        };
        if !repo.exists().await.unwrap_or(false) {
            let mut repos = self.repos.write().await;
            if repos.get(&key).is_some_and(|current| Arc::ptr_eq(current, &repo)) {
                repos.remove(&key);
                debug!(repo = %name, "dropped aggregate after failed create");
            }
        }
        Err(error)
    }

    pub async fn len(&self) -> usize {
        self.repos.read().await.len()
    }

    fn build(&self, name: &str) -> Arc<Repository> {
        Arc::new(Repository::new(
            name,
            self.store.clone(),
            self.clients.clone(),
            self.seed_line_id.as_ref(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::RepoRegistry;
    use crate::repo::{Actor, RepoError};
    use crate::session::ClientRegistry;
    use crate::store::{ListenerRule, RepoRecord, Store};

    fn registry(store: &Store) -> RepoRegistry {
        RepoRegistry::new(store.clone(), ClientRegistry::default(), "0")
    }

    fn actor(name: &str) -> Actor {
        let (outbox, _inbox) = mpsc::unbounded_channel();
        Actor { conn_id: Uuid::new_v4(), name: name.to_owned(), outbox }
    }

    #[tokio::test]
    async fn names_share_one_aggregate_case_insensitively() {
        let registry = registry(&Store::memory());
        registry.create("Docs", &actor("alice")).await.expect("create repo");
        let first = registry.get("Docs").await.expect("lookup");
        let second = registry.get("docs").await.expect("lookup");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "Docs");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_first_references_agree() {
        let store = Store::memory();
        let record = RepoRecord { name: "shared".to_owned(), owner: "alice".to_owned(), created_at: Utc::now() };
        let rule = ListenerRule { pattern: ".*".to_owned(), mode: "live".to_owned() };
        store.repo_create(&record, &rule).await.expect("store repo");

        let registry = registry(&store);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get("shared").await })
            })
            .collect();

        let mut repos = Vec::new();
        for handle in handles {
            repos.push(handle.await.expect("task joins").expect("repo exists"));
        }
        assert!(repos.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_names_are_not_retained() {
        let registry = registry(&Store::memory());
        for index in 0..1000 {
            let lookup = registry.get(&format!("ghost-{index}")).await;
            assert!(matches!(lookup, Err(RepoError::RepoNotFound)));
        }
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn failed_create_is_not_retained() {
        let store = Store::memory();
        let registry = registry(&store);

        store.fail_writes(true).await;
        assert!(matches!(
            registry.create("r1", &actor("alice")).await,
            Err(RepoError::Storage(_))
        ));
        store.fail_writes(false).await;
        assert_eq!(registry.len().await, 0);

        registry.create("r1", &actor("alice")).await.expect("create repo");
        assert!(matches!(
            registry.create("R1", &actor("bob")).await,
            Err(RepoError::NameTaken)
        ));
        assert_eq!(registry.len().await, 1);
        assert!(registry.get("r1").await.expect("lookup").exists().await.expect("exists"));
    }
}
