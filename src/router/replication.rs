/// Replication-aware routing
///
/// Keeps two independently-live sub-routers, one over the primary pool
/// and one over the replica pool, and routes every operation by the
/// logical connection's read-only flag. Switching direction never tears
/// down the inactive side's connections, so flipping back is cheap.
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{MultiHostRouter, RouterOptions, RouterPhase};
use crate::balance::BalanceStrategy;
use crate::config::ConfigError;
use crate::conn::{
    ConnectProperties, ConnectionFactory, ExecuteOutcome, PhysicalConnection, SessionState,
};
use crate::error::{DriverError, DriverResult, FaultClassifier};
use crate::topology::{HostRegistry, HostRole, HostSpec};

/// Routes between a primary pool and a replica pool
pub struct ReplicationRouter {
    primary: MultiHostRouter,
    replicas: MultiHostRouter,
    read_only: Mutex<bool>,
    allow_primary_down: bool,
}

impl std::fmt::Debug for ReplicationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationRouter")
            .field("allow_primary_down", &self.allow_primary_down)
            .finish_non_exhaustive()
    }
}

impl ReplicationRouter {
    /// Fails fast on configuration faults: a replication topology without
    /// replicas, or without primaries unless `allow_primary_down`.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        registry: Arc<HostRegistry>,
        primary_strategy: Box<dyn BalanceStrategy>,
        replica_strategy: Box<dyn BalanceStrategy>,
        factory: Arc<dyn ConnectionFactory>,
        props: ConnectProperties,
        classifier: FaultClassifier,
        options: RouterOptions,
        allow_primary_down: bool,
    ) -> DriverResult<Self> {
        if registry.hosts_with_role(HostRole::Replica).await.is_empty() {
            return Err(DriverError::Config(ConfigError::ValidationError(
                "no replica hosts specified for a replication topology".to_string(),
            )));
        }
        if registry.hosts_with_role(HostRole::Primary).await.is_empty() && !allow_primary_down {
            return Err(DriverError::Config(ConfigError::ValidationError(
                "no primary hosts specified and allow_primary_down is off".to_string(),
            )));
        }

        let primary = MultiHostRouter::new(
            Arc::clone(&registry),
            Some(HostRole::Primary),
            primary_strategy,
            Arc::clone(&factory),
            props.clone(),
            classifier.clone(),
            options.clone(),
        );
        let replicas = MultiHostRouter::new(
            registry,
            Some(HostRole::Replica),
            replica_strategy,
            factory,
            props,
            classifier,
            options,
        );

        Ok(Self {
            primary,
            replicas,
            read_only: Mutex::new(false),
            allow_primary_down,
        })
    }

    /// Bring up both sides. An unreachable primary side is tolerated when
    /// `allow_primary_down`; the replica side is mandatory.
    pub async fn connect(&self) -> DriverResult<()> {
        let has_primary = !self
            .primary
            .registry()
            .hosts_with_role(HostRole::Primary)
            .await
            .is_empty();
        if has_primary {
            match self.primary.connect().await {
                Ok(()) => {}
                Err(e) if self.allow_primary_down => {
                    log::warn!("primary side unavailable at open: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        self.replicas.connect().await
    }

    fn side(&self, read_only: bool) -> &MultiHostRouter {
        if read_only {
            &self.replicas
        } else {
            &self.primary
        }
    }

    pub async fn execute(&self, statement: &str) -> DriverResult<ExecuteOutcome> {
        let read_only = *self.read_only.lock().await;
        self.side(read_only).execute(statement).await
    }

    pub async fn ping(&self) -> DriverResult<()> {
        let read_only = *self.read_only.lock().await;
        let inactive = self.side(!read_only);
        // Keep the inactive side warm; its failures are recovered locally
        if inactive.active_host().await.is_some() {
            if let Err(e) = inactive.ping().await {
                log::debug!("inactive side ping failed: {}", e);
            }
        }
        self.side(read_only).ping().await
    }

    pub async fn commit(&self) -> DriverResult<()> {
        let read_only = *self.read_only.lock().await;
        self.side(read_only).commit().await
    }

    pub async fn rollback(&self) -> DriverResult<()> {
        let read_only = *self.read_only.lock().await;
        self.side(read_only).rollback().await
    }

    /// Toggle routing between the primary and replica pools.
    ///
    /// The target side is connected on demand; the side being left stays
    /// connected.
    pub async fn set_read_only(&self, on: bool) -> DriverResult<()> {
        let mut read_only = self.read_only.lock().await;
        if *read_only == on {
            return Ok(());
        }

        let target = self.side(on);
        target.connect().await?;
        target.set_read_only(on).await?;

        *read_only = on;
        log::info!(
            "routing {}",
            if on {
                "read-only traffic to the replica pool"
            } else {
                "writes to the primary pool"
            }
        );
        Ok(())
    }

    pub async fn set_autocommit(&self, on: bool) -> DriverResult<()> {
        self.primary.set_autocommit(on).await?;
        self.replicas.set_autocommit(on).await
    }

    pub async fn set_statement_comment(&self, comment: Option<String>) -> DriverResult<()> {
        self.primary.set_statement_comment(comment.clone()).await?;
        self.replicas.set_statement_comment(comment).await
    }

    pub async fn close(&self) -> DriverResult<()> {
        self.primary.close().await?;
        self.replicas.close().await
    }

    pub async fn read_only(&self) -> bool {
        *self.read_only.lock().await
    }

    pub async fn active_host(&self) -> Option<HostSpec> {
        let read_only = *self.read_only.lock().await;
        self.side(read_only).active_host().await
    }

    pub async fn phase(&self) -> RouterPhase {
        let read_only = *self.read_only.lock().await;
        self.side(read_only).phase().await
    }

    pub async fn session(&self) -> SessionState {
        let read_only = *self.read_only.lock().await;
        self.side(read_only).session().await
    }

    pub(crate) async fn drop_host(&self, host: &HostSpec, gently: bool) -> DriverResult<()> {
        self.primary.drop_host(host, gently).await?;
        self.replicas.drop_host(host, gently).await
    }

    pub(crate) fn salvage(&self) -> Vec<Box<dyn PhysicalConnection>> {
        let mut conns = self.primary.salvage();
        conns.extend(self.replicas.salvage());
        conns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::AffinityStrategy;
    use crate::conn::testing::StubFactory;

    fn spec(name: &str) -> HostSpec {
        HostSpec::new(name, 3306)
    }

    async fn make_replication(
        primaries: Vec<HostSpec>,
        replicas: Vec<HostSpec>,
        factory: &StubFactory,
        allow_primary_down: bool,
    ) -> DriverResult<ReplicationRouter> {
        let registry = Arc::new(HostRegistry::replication(
            primaries.clone(),
            replicas.clone(),
        ));
        ReplicationRouter::new(
            registry,
            Box::new(AffinityStrategy::new(primaries)),
            Box::new(AffinityStrategy::new(replicas)),
            Arc::new(factory.clone()),
            ConnectProperties::default(),
            FaultClassifier::default(),
            RouterOptions::default(),
            allow_primary_down,
        )
        .await
    }

    #[tokio::test]
    async fn test_construction_fails_without_replicas() {
        let factory = StubFactory::new();
        let err = make_replication(vec![spec("m")], vec![], &factory, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
        // Fail-fast: nothing was dialed
        assert!(factory.connect_attempts().is_empty());
    }

    #[tokio::test]
    async fn test_construction_without_primaries_needs_allow_primary_down() {
        let factory = StubFactory::new();
        assert!(make_replication(vec![], vec![spec("r1")], &factory, false)
            .await
            .is_err());
        assert!(make_replication(vec![], vec![spec("r1")], &factory, true)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_routes_by_read_only_flag() {
        let factory = StubFactory::new();
        let router = make_replication(vec![spec("m")], vec![spec("r1")], &factory, false)
            .await
            .unwrap();
        router.connect().await.unwrap();

        // Writes go to the primary pool
        router.execute("INSERT 1").await.unwrap();
        assert_eq!(router.active_host().await, Some(spec("m")));

        // Read-only flips to the replica pool
        router.set_read_only(true).await.unwrap();
        router.execute("SELECT 1").await.unwrap();
        assert_eq!(router.active_host().await, Some(spec("r1")));
    }

    #[tokio::test]
    async fn test_switching_never_tears_down_the_inactive_side() {
        let factory = StubFactory::new();
        let router = make_replication(vec![spec("m")], vec![spec("r1")], &factory, false)
            .await
            .unwrap();
        router.connect().await.unwrap();

        router.set_read_only(true).await.unwrap();
        // The primary side keeps its connection
        assert_eq!(router.primary.active_host().await, Some(spec("m")));
        assert!(factory.closed_hosts().is_empty());

        router.set_read_only(false).await.unwrap();
        // And the replica side keeps its connection too
        assert_eq!(router.replicas.active_host().await, Some(spec("r1")));
        assert!(factory.closed_hosts().is_empty());
    }

    #[tokio::test]
    async fn test_replica_failure_stays_inside_replica_pool() {
        let factory = StubFactory::new();
        let router = make_replication(
            vec![spec("m")],
            vec![spec("r1"), spec("r2")],
            &factory,
            false,
        )
        .await
        .unwrap();
        router.connect().await.unwrap();
        router.set_read_only(true).await.unwrap();

        router.execute("SELECT 1").await.unwrap();
        assert_eq!(router.active_host().await, Some(spec("r1")));

        factory.set_down(&spec("r1"));
        router.execute("SELECT 2").await.unwrap();
        assert_eq!(router.active_host().await, Some(spec("r2")));
        // Primary side untouched
        assert_eq!(router.primary.active_host().await, Some(spec("m")));
    }

    #[tokio::test]
    async fn test_primary_down_tolerated_when_allowed() {
        let factory = StubFactory::new();
        factory.set_down(&spec("m"));

        let router = make_replication(vec![spec("m")], vec![spec("r1")], &factory, true)
            .await
            .unwrap();
        router.connect().await.unwrap();

        router.set_read_only(true).await.unwrap();
        router.execute("SELECT 1").await.unwrap();
        assert_eq!(router.active_host().await, Some(spec("r1")));
    }

    #[tokio::test]
    async fn test_switch_to_writes_without_any_primary_fails() {
        let factory = StubFactory::new();
        let router = make_replication(vec![], vec![spec("r1")], &factory, true)
            .await
            .unwrap();
        router.connect().await.unwrap();
        router.set_read_only(true).await.unwrap();

        let err = router.set_read_only(false).await.unwrap_err();
        assert!(matches!(err, DriverError::Internal { .. }));
        // Still routing reads
        assert!(router.read_only().await);
    }

    #[tokio::test]
    async fn test_session_state_applies_to_both_sides() {
        let factory = StubFactory::new();
        let router = make_replication(vec![spec("m")], vec![spec("r1")], &factory, false)
            .await
            .unwrap();
        router.connect().await.unwrap();

        router.set_autocommit(false).await.unwrap();
        assert!(!router.primary.session().await.autocommit);
        assert!(!router.replicas.session().await.autocommit);
    }
}
