pub mod balance;
pub mod config;
/// Relevo - Multi-host connection routing, load balancing and failover
/// for database client drivers
///
/// Relevo owns the host-selection, failover and replication-routing
/// layer that sits between an application-visible logical connection and
/// the physical wire-protocol connections underneath it:
/// 1. Load-balanced mode: a balance strategy spreads logical connections
///    across a host set, blacklisting failed hosts and retrying
/// 2. Failover mode: a preferred primary with standbys, returning to the
///    primary after a configured time or query count
/// 3. Replication mode: a primary pool and a replica pool, routed by the
///    logical connection's read-only flag
pub mod conn;
pub mod error;
pub mod group;
pub mod router;
pub mod topology;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::balance::{AffinityStrategy, BalanceStrategy, StrategyKind, StrategyRegistry};
use crate::config::{Config, TopologyConfig};
use crate::conn::{
    ConnectProperties, ConnectionFactory, ExecuteOutcome, PhysicalConnection, SessionState,
};
use crate::error::{DriverError, DriverResult, FaultClassifier};
use crate::group::{ConnectionGroup, GroupMember, GroupRegistry, GroupStatus};
use crate::router::failover::PrimaryRetryPolicy;
use crate::router::{
    FailoverRouter, MultiHostRouter, ReplicationRouter, RouterOptions, RouterPhase,
};
use crate::topology::{HostEntry, HostRegistry, HostRole, HostSpec};

use async_trait::async_trait;

/// The closed set of router shapes a logical connection can carry
enum RouterKind {
    LoadBalanced(MultiHostRouter),
    Failover(FailoverRouter),
    Replication(ReplicationRouter),
}

impl RouterKind {
    async fn connect(&self) -> DriverResult<()> {
        match self {
            RouterKind::LoadBalanced(router) => router.connect().await,
            RouterKind::Failover(router) => router.connect().await,
            RouterKind::Replication(router) => router.connect().await,
        }
    }

    async fn execute(&self, statement: &str) -> DriverResult<ExecuteOutcome> {
        match self {
            RouterKind::LoadBalanced(router) => router.execute(statement).await,
            RouterKind::Failover(router) => router.execute(statement).await,
            RouterKind::Replication(router) => router.execute(statement).await,
        }
    }

    async fn ping(&self) -> DriverResult<()> {
        match self {
            RouterKind::LoadBalanced(router) => router.ping().await,
            RouterKind::Failover(router) => router.ping().await,
            RouterKind::Replication(router) => router.ping().await,
        }
    }

    async fn commit(&self) -> DriverResult<()> {
        match self {
            RouterKind::LoadBalanced(router) => router.commit().await,
            RouterKind::Failover(router) => router.commit().await,
            RouterKind::Replication(router) => router.commit().await,
        }
    }

    async fn rollback(&self) -> DriverResult<()> {
        match self {
            RouterKind::LoadBalanced(router) => router.rollback().await,
            RouterKind::Failover(router) => router.rollback().await,
            RouterKind::Replication(router) => router.rollback().await,
        }
    }

    async fn set_autocommit(&self, on: bool) -> DriverResult<()> {
        match self {
            RouterKind::LoadBalanced(router) => router.set_autocommit(on).await,
            RouterKind::Failover(router) => router.set_autocommit(on).await,
            RouterKind::Replication(router) => router.set_autocommit(on).await,
        }
    }

    async fn set_read_only(&self, on: bool) -> DriverResult<()> {
        match self {
            RouterKind::LoadBalanced(router) => router.set_read_only(on).await,
            RouterKind::Failover(router) => router.set_read_only(on).await,
            RouterKind::Replication(router) => router.set_read_only(on).await,
        }
    }

    async fn set_statement_comment(&self, comment: Option<String>) -> DriverResult<()> {
        match self {
            RouterKind::LoadBalanced(router) => router.set_statement_comment(comment).await,
            RouterKind::Failover(router) => router.set_statement_comment(comment).await,
            RouterKind::Replication(router) => router.set_statement_comment(comment).await,
        }
    }

    async fn close(&self) -> DriverResult<()> {
        match self {
            RouterKind::LoadBalanced(router) => router.close().await,
            RouterKind::Failover(router) => router.close().await,
            RouterKind::Replication(router) => router.close().await,
        }
    }

    async fn active_host(&self) -> Option<HostSpec> {
        match self {
            RouterKind::LoadBalanced(router) => router.active_host().await,
            RouterKind::Failover(router) => router.active_host().await,
            RouterKind::Replication(router) => router.active_host().await,
        }
    }

    async fn phase(&self) -> RouterPhase {
        match self {
            RouterKind::LoadBalanced(router) => router.phase().await,
            RouterKind::Failover(router) => router.phase().await,
            RouterKind::Replication(router) => router.phase().await,
        }
    }

    async fn session(&self) -> SessionState {
        match self {
            RouterKind::LoadBalanced(router) => router.session().await,
            RouterKind::Failover(router) => router.session().await,
            RouterKind::Replication(router) => router.session().await,
        }
    }

    async fn drop_host(&self, host: &HostSpec, gently: bool) -> DriverResult<()> {
        match self {
            RouterKind::LoadBalanced(router) => router.drop_host(host, gently).await,
            RouterKind::Failover(router) => router.inner().drop_host(host, gently).await,
            RouterKind::Replication(router) => router.drop_host(host, gently).await,
        }
    }

    fn salvage(&self) -> Vec<Box<dyn PhysicalConnection>> {
        match self {
            RouterKind::LoadBalanced(router) => router.salvage(),
            RouterKind::Failover(router) => router.inner().salvage(),
            RouterKind::Replication(router) => router.salvage(),
        }
    }
}

/// The group-visible half of a logical connection
struct LogicalCore {
    kind: RouterKind,
}

#[async_trait]
impl GroupMember for LogicalCore {
    async fn on_host_removed(&self, host: &HostSpec, gently: bool) -> DriverResult<()> {
        self.kind.drop_host(host, gently).await
    }
}

/// Resources handed to the reaper when a logical connection is dropped
/// without being closed
struct ReaperTask {
    connections: Vec<Box<dyn PhysicalConnection>>,
    group: Option<(Arc<ConnectionGroup>, u64)>,
}

/// The application-visible connection handle.
///
/// A logical connection may outlive and be re-pointed across multiple
/// physical connections; every operation is routed transparently through
/// whichever physical connection is currently active.
pub struct LogicalConnection {
    core: Arc<LogicalCore>,
    group: Option<(Arc<ConnectionGroup>, u64)>,
    reaper: mpsc::UnboundedSender<ReaperTask>,
    closed: bool,
}

impl LogicalConnection {
    pub async fn execute(&self, statement: &str) -> DriverResult<ExecuteOutcome> {
        self.core.kind.execute(statement).await
    }

    pub async fn ping(&self) -> DriverResult<()> {
        self.core.kind.ping().await
    }

    pub async fn commit(&self) -> DriverResult<()> {
        self.core.kind.commit().await
    }

    pub async fn rollback(&self) -> DriverResult<()> {
        self.core.kind.rollback().await
    }

    pub async fn set_autocommit(&self, on: bool) -> DriverResult<()> {
        self.core.kind.set_autocommit(on).await
    }

    pub async fn set_read_only(&self, on: bool) -> DriverResult<()> {
        self.core.kind.set_read_only(on).await
    }

    pub async fn set_statement_comment(&self, comment: Option<String>) -> DriverResult<()> {
        self.core.kind.set_statement_comment(comment).await
    }

    /// Host currently serving this connection's operations
    pub async fn active_host(&self) -> Option<HostSpec> {
        self.core.kind.active_host().await
    }

    pub async fn phase(&self) -> RouterPhase {
        self.core.kind.phase().await
    }

    pub async fn session(&self) -> SessionState {
        self.core.kind.session().await
    }

    /// Close the logical connection, releasing every owned physical
    /// connection and leaving the connection group.
    pub async fn close(&mut self) -> DriverResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.core.kind.close().await;
        if let Some((group, id)) = self.group.take() {
            group.deregister(id).await;
        }
        result
    }
}

impl Drop for LogicalConnection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let connections = self.core.kind.salvage();
        let group = self.group.take();
        if connections.is_empty() && group.is_none() {
            return;
        }
        log::warn!(
            "logical connection dropped without close; handing {} connection(s) to the reaper",
            connections.len()
        );
        let _ = self.reaper.send(ReaperTask { connections, group });
    }
}

/// Driver context owning the process-wide routing state: the group
/// registry, the custom strategy registry, and the leak reaper.
///
/// Must be created inside a tokio runtime (the reaper task is spawned at
/// construction).
pub struct Driver {
    config: Config,
    classifier: FaultClassifier,
    groups: Arc<GroupRegistry>,
    strategies: StrategyRegistry,
    reaper_tx: mpsc::UnboundedSender<ReaperTask>,
    reaper_handle: JoinHandle<()>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver").finish_non_exhaustive()
    }
}

impl Driver {
    pub fn new(config: Config) -> DriverResult<Self> {
        config.validate()?;
        let (reaper_tx, reaper_rx) = mpsc::unbounded_channel();
        let reaper_handle = tokio::spawn(run_reaper(reaper_rx));
        Ok(Self {
            config,
            classifier: FaultClassifier::default(),
            groups: Arc::new(GroupRegistry::new()),
            strategies: StrategyRegistry::new(),
            reaper_tx,
            reaper_handle,
        })
    }

    /// Replace the default fault classifier
    pub fn with_classifier(mut self, classifier: FaultClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registry for explicitly-registered custom balance strategies
    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    /// Open a logical connection routed over the configured topology
    pub async fn connect(
        &self,
        factory: Arc<dyn ConnectionFactory>,
    ) -> DriverResult<LogicalConnection> {
        let entries = self.topology_entries()?;
        let (registry, group) = match &self.config.routing.connection_group {
            Some(name) => {
                let group = self.groups.get_or_create(name, entries).await;
                (group.registry(), Some(group))
            }
            None => (Arc::new(HostRegistry::new(entries)), None),
        };

        let options = self.router_options()?;
        let props = ConnectProperties {
            connect_timeout: Duration::from_millis(self.config.routing.connect_timeout_ms),
            ..Default::default()
        };

        let kind = match &self.config.topology {
            TopologyConfig::LoadBalanced { .. } => RouterKind::LoadBalanced(MultiHostRouter::new(
                registry,
                None,
                self.build_strategy()?,
                factory,
                props,
                self.classifier.clone(),
                options,
            )),
            TopologyConfig::Failover { hosts } => {
                let order = parse_hosts(hosts)?;
                let primary = order[0].clone();
                let inner = MultiHostRouter::new(
                    registry,
                    None,
                    Box::new(AffinityStrategy::new(order)),
                    factory,
                    props,
                    self.classifier.clone(),
                    options,
                );
                let policy = PrimaryRetryPolicy {
                    seconds_before_retry: Duration::from_secs(
                        self.config.failover.seconds_before_retry_primary,
                    ),
                    queries_before_retry: self.config.failover.queries_before_retry_primary,
                };
                RouterKind::Failover(FailoverRouter::new(primary, inner, policy))
            }
            TopologyConfig::Replication {
                allow_primary_down, ..
            } => RouterKind::Replication(
                ReplicationRouter::new(
                    registry,
                    self.build_strategy()?,
                    self.build_strategy()?,
                    factory,
                    props,
                    self.classifier.clone(),
                    options,
                    *allow_primary_down,
                )
                .await?,
            ),
        };

        kind.connect().await?;

        let core = Arc::new(LogicalCore { kind });
        let group = match group {
            Some(group) => {
                let member: Arc<dyn GroupMember> = Arc::clone(&core) as Arc<dyn GroupMember>;
                let id = group.register(Arc::downgrade(&member)).await;
                Some((group, id))
            }
            None => None,
        };

        Ok(LogicalConnection {
            core,
            group,
            reaper: self.reaper_tx.clone(),
            closed: false,
        })
    }

    // Administrative surface, consumed by operational tooling

    /// Add a host to a connection group's topology
    pub async fn add_host(&self, group: &str, host: &str, role: HostRole) -> DriverResult<()> {
        self.lookup_group(group).await?.add_host(host.parse()?, role, true).await
    }

    /// Remove a host from a connection group's topology
    pub async fn remove_host(&self, group: &str, host: &str, gently: bool) -> DriverResult<()> {
        self.lookup_group(group).await?.remove_host(&host.parse()?, gently).await
    }

    /// Promote a replica to primary across a connection group
    pub async fn promote_to_primary(&self, group: &str, host: &str) -> DriverResult<()> {
        self.lookup_group(group).await?.promote(&host.parse()?).await
    }

    /// Monitoring snapshot of a connection group
    pub async fn group_status(&self, group: &str) -> DriverResult<GroupStatus> {
        Ok(self.lookup_group(group).await?.status())
    }

    pub async fn group_names(&self) -> Vec<String> {
        self.groups.names().await
    }

    async fn lookup_group(&self, name: &str) -> DriverResult<Arc<ConnectionGroup>> {
        self.groups
            .get(name)
            .await
            .ok_or_else(|| DriverError::group(format!("unknown connection group '{}'", name)))
    }

    fn topology_entries(&self) -> DriverResult<Vec<HostEntry>> {
        let entries = match &self.config.topology {
            TopologyConfig::LoadBalanced { hosts } | TopologyConfig::Failover { hosts } => {
                parse_hosts(hosts)?
                    .into_iter()
                    .map(|spec| HostEntry {
                        spec,
                        role: HostRole::Primary,
                    })
                    .collect()
            }
            TopologyConfig::Replication {
                primaries,
                replicas,
                ..
            } => {
                let mut entries: Vec<HostEntry> = parse_hosts(primaries)?
                    .into_iter()
                    .map(|spec| HostEntry {
                        spec,
                        role: HostRole::Primary,
                    })
                    .collect();
                entries.extend(parse_hosts(replicas)?.into_iter().map(|spec| HostEntry {
                    spec,
                    role: HostRole::Replica,
                }));
                entries
            }
        };
        Ok(entries)
    }

    fn router_options(&self) -> DriverResult<RouterOptions> {
        let rebalance_regex = match &self.config.rebalance.statement_regex {
            Some(pattern) => Some(regex::Regex::new(pattern).map_err(|e| {
                DriverError::Config(config::ConfigError::ValidationError(format!(
                    "invalid statement_regex: {}",
                    e
                )))
            })?),
            None => None,
        };
        Ok(RouterOptions {
            retry_count: self.config.routing.retry_count,
            blacklist_ttl: Duration::from_millis(self.config.routing.blacklist_ttl_ms),
            failover_in_transaction: self.config.routing.failover_in_transaction,
            rebalance_threshold: self.config.rebalance.statement_threshold,
            rebalance_regex,
        })
    }

    fn build_strategy(&self) -> DriverResult<Box<dyn BalanceStrategy>> {
        let kind = StrategyKind::parse(&self.config.routing.strategy);
        let order = match &self.config.routing.affinity_order {
            Some(order) => parse_hosts(order)?,
            None => Vec::new(),
        };
        self.strategies.build(&kind, &order)
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.reaper_handle.abort();
    }
}

fn parse_hosts(hosts: &[String]) -> DriverResult<Vec<HostSpec>> {
    hosts.iter().map(|host| host.parse()).collect()
}

/// The one autonomous background activity: force-release resources of
/// logical connections that were dropped without close. A safety net,
/// never the normal release path.
async fn run_reaper(mut rx: mpsc::UnboundedReceiver<ReaperTask>) {
    while let Some(task) = rx.recv().await {
        let count = task.connections.len();
        for mut conn in task.connections {
            let _ = conn.close().await;
        }
        if let Some((group, id)) = task.group {
            group.deregister(id).await;
        }
        if count > 0 {
            tracing::debug!("reaper released {} leaked connection(s)", count);
        }
    }
}
