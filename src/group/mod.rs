/// Connection groups: named sets of logical connections sharing a topology
///
/// Every member of a group shares one host registry, so registry-level
/// changes (new host, blacklist, promotion) are observed by all members
/// without individual notification. Member-local changes (closing live
/// connections to a removed host) are broadcast over a snapshot of the
/// member map taken under the group lock and delivered with the lock
/// released, so group-level and router-level locking never interleave.
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

use crate::error::{DriverError, DriverResult};
use crate::topology::{HostEntry, HostRegistry, HostRole, HostSpec};

/// Hooks a group member reacts to. The group holds only weak references
/// to members; a member's lifetime is owned by its logical connection.
#[async_trait]
pub trait GroupMember: Send + Sync {
    /// A host joined the group topology
    async fn on_host_added(&self, _host: &HostSpec, _role: HostRole) -> DriverResult<()> {
        Ok(())
    }

    /// A host left the group topology
    async fn on_host_removed(&self, host: &HostSpec, gently: bool) -> DriverResult<()>;

    /// A replica was promoted to primary
    async fn on_host_promoted(&self, _host: &HostSpec) -> DriverResult<()> {
        Ok(())
    }
}

/// Management counters snapshot for monitoring
#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub name: String,
    pub total_logical: u64,
    pub active_logical: u64,
    pub replicas_added: u64,
    pub replicas_removed: u64,
    pub replicas_promoted: u64,
}

/// A named set of logical connections sharing one host registry
pub struct ConnectionGroup {
    name: String,
    registry: Arc<HostRegistry>,
    members: RwLock<HashMap<u64, Weak<dyn GroupMember>>>,
    next_member_id: AtomicU64,
    total_logical: AtomicU64,
    active_logical: AtomicU64,
    replicas_added: AtomicU64,
    replicas_removed: AtomicU64,
    replicas_promoted: AtomicU64,
}

impl ConnectionGroup {
    pub fn new<S: Into<String>>(name: S, registry: Arc<HostRegistry>) -> Self {
        Self {
            name: name.into(),
            registry,
            members: RwLock::new(HashMap::new()),
            next_member_id: AtomicU64::new(1),
            total_logical: AtomicU64::new(0),
            active_logical: AtomicU64::new(0),
            replicas_added: AtomicU64::new(0),
            replicas_removed: AtomicU64::new(0),
            replicas_promoted: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> Arc<HostRegistry> {
        Arc::clone(&self.registry)
    }

    /// Register a logical connection with the group
    pub async fn register(&self, member: Weak<dyn GroupMember>) -> u64 {
        let id = self.next_member_id.fetch_add(1, Ordering::Relaxed);
        self.members.write().await.insert(id, member);
        self.total_logical.fetch_add(1, Ordering::Relaxed);
        self.active_logical.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("group {}: registered member {}", self.name, id);
        id
    }

    /// Remove a member when its logical connection closes
    pub async fn deregister(&self, id: u64) {
        if self.members.write().await.remove(&id).is_some() {
            self.active_logical.fetch_sub(1, Ordering::Relaxed);
            tracing::debug!("group {}: deregistered member {}", self.name, id);
        }
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Add a host to the group topology. With `propagate`, existing
    /// members are also notified individually.
    pub async fn add_host(
        &self,
        spec: HostSpec,
        role: HostRole,
        propagate: bool,
    ) -> DriverResult<()> {
        if !self.registry.add_host(spec.clone(), role).await {
            return Err(DriverError::group(format!(
                "host {} already in group {}",
                spec, self.name
            )));
        }
        if role == HostRole::Replica {
            self.replicas_added.fetch_add(1, Ordering::Relaxed);
        }
        log::info!("group {}: added {} as {}", self.name, spec, role);

        if propagate {
            for (id, member) in self.snapshot_members().await {
                if let Err(e) = member.on_host_added(&spec, role).await {
                    log::warn!(
                        "group {}: member {} failed handling added host {}: {}",
                        self.name,
                        id,
                        spec,
                        e
                    );
                }
            }
        }
        Ok(())
    }

    /// Remove a host from the group topology and tell every member to
    /// drop its connections to it. Per-member failures are logged, never
    /// propagated, so one bad member cannot block the rest.
    pub async fn remove_host(&self, spec: &HostSpec, gently: bool) -> DriverResult<()> {
        let role = self.registry.role_of(spec).await;
        if !self.registry.remove_host(spec).await {
            return Err(DriverError::group(format!(
                "host {} not in group {}",
                spec, self.name
            )));
        }
        if role == Some(HostRole::Replica) {
            self.replicas_removed.fetch_add(1, Ordering::Relaxed);
        }
        log::info!(
            "group {}: removed {} ({})",
            self.name,
            spec,
            if gently { "gently" } else { "forced" }
        );

        for (id, member) in self.snapshot_members().await {
            if let Err(e) = member.on_host_removed(spec, gently).await {
                log::warn!(
                    "group {}: member {} failed handling removed host {}: {}",
                    self.name,
                    id,
                    spec,
                    e
                );
            }
        }
        Ok(())
    }

    /// Promote a replica to primary across the whole group
    pub async fn promote(&self, spec: &HostSpec) -> DriverResult<()> {
        let was_replica = self.registry.role_of(spec).await == Some(HostRole::Replica);
        self.registry.promote(spec, true).await?;
        if was_replica {
            self.replicas_promoted.fetch_add(1, Ordering::Relaxed);
        }
        log::info!("group {}: promoted {} to primary", self.name, spec);

        for (id, member) in self.snapshot_members().await {
            if let Err(e) = member.on_host_promoted(spec).await {
                log::warn!(
                    "group {}: member {} failed handling promotion of {}: {}",
                    self.name,
                    id,
                    spec,
                    e
                );
            }
        }
        Ok(())
    }

    pub fn status(&self) -> GroupStatus {
        GroupStatus {
            name: self.name.clone(),
            total_logical: self.total_logical.load(Ordering::Relaxed),
            active_logical: self.active_logical.load(Ordering::Relaxed),
            replicas_added: self.replicas_added.load(Ordering::Relaxed),
            replicas_removed: self.replicas_removed.load(Ordering::Relaxed),
            replicas_promoted: self.replicas_promoted.load(Ordering::Relaxed),
        }
    }

    /// Copy out the live members, dropping any whose logical connection
    /// is already gone. The copy is what broadcast iterates, never the
    /// member map itself.
    async fn snapshot_members(&self) -> Vec<(u64, Arc<dyn GroupMember>)> {
        self.prune_dead().await;
        let members = self.members.read().await;
        members
            .iter()
            .filter_map(|(id, weak)| weak.upgrade().map(|member| (*id, member)))
            .collect()
    }

    async fn prune_dead(&self) {
        let mut members = self.members.write().await;
        let before = members.len();
        members.retain(|_, weak| weak.strong_count() > 0);
        let removed = (before - members.len()) as u64;
        if removed > 0 {
            self.active_logical.fetch_sub(removed, Ordering::Relaxed);
            tracing::debug!("group {}: pruned {} dead members", self.name, removed);
        }
    }
}

/// Named groups, created lazily on first reference.
///
/// Owned by the driver context rather than living in process-global
/// state, so lifetime and teardown stay explicit.
#[derive(Default)]
pub struct GroupRegistry {
    groups: RwLock<HashMap<String, Arc<ConnectionGroup>>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a group, creating it with the given topology on first use.
    /// Later callers share the original topology regardless of `entries`.
    pub async fn get_or_create(&self, name: &str, entries: Vec<HostEntry>) -> Arc<ConnectionGroup> {
        let mut groups = self.groups.write().await;
        groups
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(ConnectionGroup::new(
                    name,
                    Arc::new(HostRegistry::new(entries)),
                ))
            })
            .clone()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ConnectionGroup>> {
        self.groups.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.groups.read().await.keys().cloned().collect()
    }
}
