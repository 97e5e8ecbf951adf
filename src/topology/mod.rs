/// Host topology: configured host list, roles, and the global blacklist
///
/// The registry is the shared source of truth for every router in a
/// connection group. It keeps the configured host order, the
/// primary/replica role partition, and a TTL blacklist of hosts that
/// recently failed. All mutation goes through its own lock so routers
/// on different tasks can read and write it concurrently.
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::{DriverError, DriverResult};

/// Immutable identity of a backend host, compared by exact "host:port" form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostSpec {
    pub host: String,
    pub port: u16,
}

impl HostSpec {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostSpec {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| DriverError::topology(format!("invalid host spec '{}': must be host:port", s)))?;
        if host.is_empty() {
            return Err(DriverError::topology(format!("invalid host spec '{}': empty host", s)));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| DriverError::topology(format!("invalid host spec '{}': bad port", s)))?;
        Ok(Self::new(host, port))
    }
}

/// Role of a host in a replication topology.
///
/// Each host carries exactly one role, so a host can never be a primary
/// and a replica at the same time; promotion rewrites the role in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRole {
    Primary,
    Replica,
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRole::Primary => write!(f, "primary"),
            HostRole::Replica => write!(f, "replica"),
        }
    }
}

/// One configured host with its role
#[derive(Debug, Clone)]
pub struct HostEntry {
    pub spec: HostSpec,
    pub role: HostRole,
}

struct RegistryState {
    /// Configured topology, in configuration order
    hosts: Vec<HostEntry>,
    /// Temporarily-unusable hosts, mapped to blacklist expiry
    blacklist: HashMap<HostSpec, Instant>,
}

/// Shared host registry for one connection group
pub struct HostRegistry {
    state: RwLock<RegistryState>,
}

impl HostRegistry {
    pub fn new(hosts: Vec<HostEntry>) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                hosts,
                blacklist: HashMap::new(),
            }),
        }
    }

    /// Registry for a load-balanced or failover topology: every host serves writes
    pub fn load_balanced(specs: Vec<HostSpec>) -> Self {
        Self::new(
            specs
                .into_iter()
                .map(|spec| HostEntry {
                    spec,
                    role: HostRole::Primary,
                })
                .collect(),
        )
    }

    /// Registry for a replication topology
    pub fn replication(primaries: Vec<HostSpec>, replicas: Vec<HostSpec>) -> Self {
        let mut hosts: Vec<HostEntry> = primaries
            .into_iter()
            .map(|spec| HostEntry {
                spec,
                role: HostRole::Primary,
            })
            .collect();
        hosts.extend(replicas.into_iter().map(|spec| HostEntry {
            spec,
            role: HostRole::Replica,
        }));
        Self::new(hosts)
    }

    /// All configured hosts, in configuration order
    pub async fn hosts(&self) -> Vec<HostSpec> {
        let state = self.state.read().await;
        state.hosts.iter().map(|entry| entry.spec.clone()).collect()
    }

    /// Configured hosts carrying the given role, in configuration order
    pub async fn hosts_with_role(&self, role: HostRole) -> Vec<HostSpec> {
        let state = self.state.read().await;
        state
            .hosts
            .iter()
            .filter(|entry| entry.role == role)
            .map(|entry| entry.spec.clone())
            .collect()
    }

    pub async fn role_of(&self, host: &HostSpec) -> Option<HostRole> {
        let state = self.state.read().await;
        state
            .hosts
            .iter()
            .find(|entry| &entry.spec == host)
            .map(|entry| entry.role)
    }

    pub async fn contains(&self, host: &HostSpec) -> bool {
        self.role_of(host).await.is_some()
    }

    pub async fn host_count(&self) -> usize {
        self.state.read().await.hosts.len()
    }

    /// Add a host to the topology. Returns false if it was already present.
    pub async fn add_host(&self, spec: HostSpec, role: HostRole) -> bool {
        let mut state = self.state.write().await;
        if state.hosts.iter().any(|entry| entry.spec == spec) {
            return false;
        }
        state.hosts.push(HostEntry { spec, role });
        true
    }

    /// Remove a host from the topology, also dropping its blacklist entry.
    /// Returns false if the host was not configured.
    pub async fn remove_host(&self, host: &HostSpec) -> bool {
        let mut state = self.state.write().await;
        let before = state.hosts.len();
        state.hosts.retain(|entry| &entry.spec != host);
        state.blacklist.remove(host);
        state.hosts.len() != before
    }

    /// Promote a host to primary.
    ///
    /// Promoting a current primary is an idempotent no-op. Promoting a
    /// host the registry has never seen fails unless `add_if_unknown`,
    /// in which case it is added fresh as a primary.
    pub async fn promote(&self, host: &HostSpec, add_if_unknown: bool) -> DriverResult<()> {
        let mut state = self.state.write().await;
        if let Some(entry) = state.hosts.iter_mut().find(|entry| &entry.spec == host) {
            entry.role = HostRole::Primary;
            return Ok(());
        }
        if add_if_unknown {
            state.hosts.push(HostEntry {
                spec: host.clone(),
                role: HostRole::Primary,
            });
            return Ok(());
        }
        Err(DriverError::topology(format!(
            "cannot promote {}: not a known replica",
            host
        )))
    }

    /// Demote a host to replica. Fails if the host is unknown.
    pub async fn demote(&self, host: &HostSpec) -> DriverResult<()> {
        let mut state = self.state.write().await;
        match state.hosts.iter_mut().find(|entry| &entry.spec == host) {
            Some(entry) => {
                entry.role = HostRole::Replica;
                Ok(())
            }
            None => Err(DriverError::topology(format!(
                "cannot demote {}: unknown host",
                host
            ))),
        }
    }

    /// Mark a host unusable until now + ttl.
    ///
    /// Re-blacklisting keeps the later expiry, so repeated failures
    /// extend the exclusion rather than shortening it.
    pub async fn blacklist(&self, host: HostSpec, ttl: Duration) {
        let mut state = self.state.write().await;
        let expiry = Instant::now() + ttl;
        let entry = state.blacklist.entry(host.clone()).or_insert(expiry);
        if *entry < expiry {
            *entry = expiry;
        }
        tracing::debug!("blacklisted {} for {:?}", host, ttl);
    }

    /// Expired entries are treated as absent; nothing is swept eagerly.
    pub async fn is_blacklisted(&self, host: &HostSpec) -> bool {
        let state = self.state.read().await;
        match state.blacklist.get(host) {
            Some(expiry) => *expiry > Instant::now(),
            None => false,
        }
    }

    pub async fn clear_blacklist(&self) {
        let mut state = self.state.write().await;
        state.blacklist.clear();
    }

    /// Snapshot of currently-blacklisted hosts.
    ///
    /// If every configured host is blacklisted the whole blacklist is
    /// cleared instead and an empty snapshot returned, so selection can
    /// never deadlock with nothing to pick from. Callers should pause
    /// briefly (~250ms) before retrying in that case, since a cleared
    /// host may still be unreachable.
    pub async fn blacklist_snapshot(&self) -> HashSet<HostSpec> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        let active: HashSet<HostSpec> = state
            .blacklist
            .iter()
            .filter(|(_, expiry)| **expiry > now)
            .map(|(host, _)| host.clone())
            .collect();

        let all_excluded = !state.hosts.is_empty()
            && state.hosts.iter().all(|entry| active.contains(&entry.spec));
        if all_excluded {
            log::warn!("every configured host is blacklisted, clearing the blacklist");
            state.blacklist.clear();
            return HashSet::new();
        }
        active
    }

    /// Non-blacklisted hosts, optionally filtered by role, in configuration order
    pub async fn available_hosts(&self, role: Option<HostRole>) -> Vec<HostSpec> {
        let excluded = self.blacklist_snapshot().await;
        let state = self.state.read().await;
        state
            .hosts
            .iter()
            .filter(|entry| role.map_or(true, |r| entry.role == r))
            .filter(|entry| !excluded.contains(&entry.spec))
            .map(|entry| entry.spec.clone())
            .collect()
    }
}
