//! Primary/backup partition of the tunnels eligible for traffic.
//!
//! Only the failover manager mutates the pool. Readers get snapshots that
//! may be stale by the time they are used.

use serde::Serialize;
use tokio::sync::RwLock;

use tunnelkeeper_core::TunnelRole;

use crate::tunnel::TunnelId;

/// Point-in-time copy of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    /// In registration order; earlier primaries are preferred on ties.
    pub primaries: Vec<TunnelId>,
    pub backups: Vec<TunnelId>,
}

impl PoolSnapshot {
    pub fn role(&self, id: TunnelId) -> Option<TunnelRole> {
        if self.primaries.contains(&id) {
            Some(TunnelRole::Primary)
        } else if self.backups.contains(&id) {
            Some(TunnelRole::Backup)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.primaries.len() + self.backups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primaries.is_empty() && self.backups.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TunnelPool {
    sets: RwLock<PoolSnapshot>,
}

impl TunnelPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        self.sets.read().await.clone()
    }

    pub async fn primaries(&self) -> Vec<TunnelId> {
        self.sets.read().await.primaries.clone()
    }

    pub async fn backups(&self) -> Vec<TunnelId> {
        self.sets.read().await.backups.clone()
    }

    pub async fn role(&self, id: TunnelId) -> Option<TunnelRole> {
        self.sets.read().await.role(id)
    }

    /// Register a tunnel in `role`. A tunnel already in the pool keeps its
    /// current role; returns whether it was added.
    pub(crate) async fn insert(&self, id: TunnelId, role: TunnelRole) -> bool {
        let mut sets = self.sets.write().await;
        if sets.role(id).is_some() {
            return false;
        }
        match role {
            TunnelRole::Primary => sets.primaries.push(id),
            TunnelRole::Backup => sets.backups.push(id),
        }
        true
    }

    /// Move a backup into the primary set.
    pub(crate) async fn promote(&self, id: TunnelId) -> bool {
        let mut sets = self.sets.write().await;
        let Some(pos) = sets.backups.iter().position(|b| *b == id) else {
            return false;
        };
        sets.backups.remove(pos);
        sets.primaries.push(id);
        true
    }

    /// Move a primary into the backup set.
    pub(crate) async fn demote(&self, id: TunnelId) -> bool {
        let mut sets = self.sets.write().await;
        let Some(pos) = sets.primaries.iter().position(|p| *p == id) else {
            return false;
        };
        sets.primaries.remove(pos);
        sets.backups.push(id);
        true
    }

    pub(crate) async fn remove(&self, id: TunnelId) -> Option<TunnelRole> {
        let mut sets = self.sets.write().await;
        let role = sets.role(id)?;
        sets.primaries.retain(|p| *p != id);
        sets.backups.retain(|b| *b != id);
        Some(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roles_are_disjoint() {
        let pool = TunnelPool::new();
        let a = TunnelId::new();
        let b = TunnelId::new();

        assert!(pool.insert(a, TunnelRole::Primary).await);
        assert!(pool.insert(b, TunnelRole::Backup).await);
        assert!(!pool.insert(a, TunnelRole::Backup).await);
        assert_eq!(pool.role(a).await, Some(TunnelRole::Primary));

        assert!(pool.promote(b).await);
        assert!(!pool.promote(b).await);
        assert_eq!(pool.primaries().await, [a, b]);
        assert!(pool.backups().await.is_empty());

        assert!(pool.demote(a).await);
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.primaries, [b]);
        assert_eq!(snapshot.backups, [a]);
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn remove_reports_previous_role() {
        let pool = TunnelPool::new();
        let a = TunnelId::new();
        pool.insert(a, TunnelRole::Backup).await;

        assert_eq!(pool.remove(a).await, Some(TunnelRole::Backup));
        assert_eq!(pool.remove(a).await, None);
        assert!(pool.snapshot().await.is_empty());
    }
}
