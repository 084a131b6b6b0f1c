//! Ledger Store - indexed storage of projects and milestones
//!
//! Pure storage with no business rules: projects are keyed by a
//! monotonically increasing counter and own their milestones outright. The
//! engine obtains an exclusive guard covering its whole
//! check -> mutate -> transfer -> commit/rollback unit of work, so a state
//! check and the mutation it protects are never separated by another
//! writer.

use crate::EscrowResult;
use crate::error::EscrowError;
use crate::models::{Milestone, Project};
use std::collections::HashMap;
use tokio::sync::{RwLock, RwLockWriteGuard};

#[derive(Debug, Default)]
struct StoreInner {
    next_id: u64,
    projects: HashMap<u64, Project>,
}

/// In-memory project ledger
#[derive(Debug)]
pub struct LedgerStore {
    inner: RwLock<StoreInner>,
}

/// Exclusive write access to the ledger for one engine operation
pub struct StoreGuard<'a> {
    inner: RwLockWriteGuard<'a, StoreInner>,
}

impl StoreGuard<'_> {
    /// Read access to a project while holding the guard
    pub fn project(&self, id: u64) -> EscrowResult<&Project> {
        self.inner
            .projects
            .get(&id)
            .ok_or_else(|| EscrowError::not_found(format!("project {id}")))
    }

    /// Mutable access to a project while holding the guard
    pub fn project_mut(&mut self, id: u64) -> EscrowResult<&mut Project> {
        self.inner
            .projects
            .get_mut(&id)
            .ok_or_else(|| EscrowError::not_found(format!("project {id}")))
    }
}

impl LedgerStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                next_id: 1,
                projects: HashMap::new(),
            }),
        }
    }

    /// Store a fully-formed project in one atomic step, allocating the next
    /// sequential id. Invariant validation is the caller's job.
    pub async fn create_project(&self, mut project: Project) -> u64 {
        let mut inner = self.inner.write().await;
        let id = inner.next_id;
        inner.next_id += 1;
        project.id = id;
        inner.projects.insert(id, project);
        id
    }

    /// Read a project by id
    pub async fn get_project(&self, id: u64) -> EscrowResult<Project> {
        self.inner
            .read()
            .await
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| EscrowError::not_found(format!("project {id}")))
    }

    /// Read a single milestone by (project id, index)
    pub async fn get_milestone(&self, id: u64, index: usize) -> EscrowResult<Milestone> {
        let inner = self.inner.read().await;
        let project = inner
            .projects
            .get(&id)
            .ok_or_else(|| EscrowError::not_found(format!("project {id}")))?;
        project.milestone(index).cloned()
    }

    /// Read all milestones of a project
    pub async fn list_milestones(&self, id: u64) -> EscrowResult<Vec<Milestone>> {
        Ok(self.get_project(id).await?.milestones)
    }

    /// Take exclusive write access for one engine operation
    pub async fn lock(&self) -> StoreGuard<'_> {
        StoreGuard {
            inner: self.inner.write().await,
        }
    }
}

impl Default for LedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn project(client: &str) -> Project {
        let now = Utc::now();
        let milestones = vec![
            Milestone::new("first".into(), 10_000, None, now),
            Milestone::new("second".into(), 20_000, None, now),
        ];
        Project::new(client.into(), None, 0, None, milestones, now)
    }

    #[tokio::test]
    async fn ids_are_sequential_from_one() {
        let store = LedgerStore::new();
        assert_eq!(store.create_project(project("a")).await, 1);
        assert_eq!(store.create_project(project("b")).await, 2);
        assert_eq!(store.create_project(project("c")).await, 3);

        assert_eq!(store.get_project(2).await.unwrap().client, "b");
    }

    #[tokio::test]
    async fn missing_project_and_milestone_are_not_found() {
        let store = LedgerStore::new();
        assert!(matches!(
            store.get_project(7).await,
            Err(EscrowError::NotFound(_))
        ));

        let id = store.create_project(project("a")).await;
        assert!(store.get_milestone(id, 1).await.is_ok());
        assert!(matches!(
            store.get_milestone(id, 2).await,
            Err(EscrowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn guard_mutations_are_visible_to_readers() {
        let store = LedgerStore::new();
        let id = store.create_project(project("a")).await;

        {
            let mut guard = store.lock().await;
            guard.project_mut(id).unwrap().total_paid_sats = 10_000;
        }

        assert_eq!(store.get_project(id).await.unwrap().total_paid_sats, 10_000);
    }
}
