/// Balance strategies: policies deciding which host serves the next connection
///
/// A strategy receives the shared host registry, the router's live
/// connection map and response-time table, and a bounded attempt budget,
/// and returns the host whose open connection should become active. On a
/// connection-class failure the strategy blacklists the host and keeps
/// trying; application faults are returned unchanged without retry.
pub mod affinity;
pub mod best_time;
pub mod random;
pub mod sequential;

use async_trait::async_trait;
use fnv::FnvHashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use crate::conn::{ConnectProperties, ConnectionFactory, PhysicalConnection};
use crate::error::{DriverError, DriverResult, FaultClassifier};
use crate::topology::{HostRegistry, HostRole, HostSpec};

pub use affinity::AffinityStrategy;
pub use best_time::BestResponseTimeStrategy;
pub use random::RandomStrategy;
pub use sequential::SequentialStrategy;

/// Pause before refilling an exhausted candidate pool
pub(crate) const RETRY_PAUSE: Duration = Duration::from_millis(250);

/// Everything a strategy needs for one selection round
pub struct PickContext<'a> {
    pub registry: &'a HostRegistry,
    /// Restrict candidates to one replication role; None considers every host
    pub role: Option<HostRole>,
    pub live: &'a mut FnvHashMap<HostSpec, Box<dyn PhysicalConnection>>,
    pub response_times: &'a FnvHashMap<HostSpec, Duration>,
    pub factory: &'a dyn ConnectionFactory,
    pub props: &'a ConnectProperties,
    pub classifier: &'a FaultClassifier,
    /// Attempt budget for this selection
    pub max_attempts: u32,
    pub blacklist_ttl: Duration,
}

impl PickContext<'_> {
    /// Full configured candidate list, ignoring the blacklist
    pub async fn candidates(&self) -> Vec<HostSpec> {
        match self.role {
            Some(role) => self.registry.hosts_with_role(role).await,
            None => self.registry.hosts().await,
        }
    }

    /// Snapshot of currently-excluded hosts (may clear an all-host blacklist)
    pub async fn excluded(&self) -> HashSet<HostSpec> {
        self.registry.blacklist_snapshot().await
    }

    /// Last measured response time; zero means never measured
    pub fn response_time(&self, host: &HostSpec) -> Duration {
        self.response_times.get(host).copied().unwrap_or(Duration::ZERO)
    }

    /// Make sure the live map holds a usable connection for the host.
    ///
    /// An existing entry is liveness-checked and reused; a stale entry is
    /// closed and replaced by a fresh dial.
    pub async fn acquire(&mut self, host: &HostSpec) -> DriverResult<()> {
        let pooled = match self.live.get_mut(host) {
            Some(conn) => Some(conn.ping().await),
            None => None,
        };
        if let Some(ping) = pooled {
            match ping {
                Ok(()) => return Ok(()),
                Err(e) if self.classifier.is_connection_error(&e) => {
                    // Stale entry: close it and fall through to a fresh dial
                    if let Some(mut dead) = self.live.remove(host) {
                        let _ = dead.close().await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let conn = self.factory.connect(host, self.props).await?;
        self.live.insert(host.clone(), conn);
        Ok(())
    }

    /// Blacklist a failed host and drop any pooled connection to it
    pub async fn exclude(&mut self, host: &HostSpec) {
        self.registry.blacklist(host.clone(), self.blacklist_ttl).await;
        if let Some(mut conn) = self.live.remove(host) {
            let _ = conn.close().await;
        }
    }
}

/// Policy selecting the host for the next connection
#[async_trait]
pub trait BalanceStrategy: Send {
    /// Select a host and ensure the live map holds an open connection to it
    async fn pick(&mut self, ctx: &mut PickContext<'_>) -> DriverResult<HostSpec>;
}

/// The closed set of built-in strategies, plus registered custom ones
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyKind {
    BestResponseTime,
    Random,
    Sequential,
    Affinity,
    Custom(String),
}

impl StrategyKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "best_response_time" => StrategyKind::BestResponseTime,
            "random" => StrategyKind::Random,
            "sequential" => StrategyKind::Sequential,
            "affinity" => StrategyKind::Affinity,
            other => StrategyKind::Custom(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            StrategyKind::BestResponseTime => "best_response_time",
            StrategyKind::Random => "random",
            StrategyKind::Sequential => "sequential",
            StrategyKind::Affinity => "affinity",
            StrategyKind::Custom(name) => name,
        }
    }
}

/// Builder for one registered custom strategy
pub type StrategyBuilder = Arc<dyn Fn() -> Box<dyn BalanceStrategy> + Send + Sync>;

/// Registry of custom strategies.
///
/// Custom strategies are registered explicitly by name; configuration
/// then refers to them by that name. One fresh strategy instance is
/// built per router.
#[derive(Default)]
pub struct StrategyRegistry {
    builders: RwLock<HashMap<String, StrategyBuilder>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S, F>(&self, name: S, builder: F)
    where
        S: Into<String>,
        F: Fn() -> Box<dyn BalanceStrategy> + Send + Sync + 'static,
    {
        let mut builders = self.builders.write().unwrap();
        builders.insert(name.into(), Arc::new(builder));
    }

    /// Build a strategy instance for a router
    pub fn build(
        &self,
        kind: &StrategyKind,
        affinity_order: &[HostSpec],
    ) -> DriverResult<Box<dyn BalanceStrategy>> {
        match kind {
            StrategyKind::BestResponseTime => Ok(Box::new(BestResponseTimeStrategy::new())),
            StrategyKind::Random => Ok(Box::new(RandomStrategy::new())),
            StrategyKind::Sequential => Ok(Box::new(SequentialStrategy::new())),
            StrategyKind::Affinity => Ok(Box::new(AffinityStrategy::new(affinity_order.to_vec()))),
            StrategyKind::Custom(name) => {
                let builders = self.builders.read().unwrap();
                match builders.get(name) {
                    Some(builder) => Ok(builder()),
                    None => Err(DriverError::internal(format!(
                        "unknown balance strategy '{}'",
                        name
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::conn::testing::StubFactory;

    /// Owns everything a PickContext borrows, so tests can build contexts
    /// repeatedly against the same topology state.
    pub struct PickHarness {
        pub registry: HostRegistry,
        pub role: Option<HostRole>,
        pub live: FnvHashMap<HostSpec, Box<dyn PhysicalConnection>>,
        pub response_times: FnvHashMap<HostSpec, Duration>,
        pub factory: StubFactory,
        pub props: ConnectProperties,
        pub classifier: FaultClassifier,
        pub max_attempts: u32,
        pub blacklist_ttl: Duration,
    }

    impl PickHarness {
        pub fn new(hosts: Vec<HostSpec>) -> Self {
            Self {
                registry: HostRegistry::load_balanced(hosts),
                role: None,
                live: FnvHashMap::default(),
                response_times: FnvHashMap::default(),
                factory: StubFactory::new(),
                props: ConnectProperties::default(),
                classifier: FaultClassifier::default(),
                max_attempts: 10,
                blacklist_ttl: Duration::from_secs(60),
            }
        }

        pub fn set_response_time(&mut self, host: HostSpec, millis: u64) {
            self.response_times
                .insert(host, Duration::from_millis(millis));
        }

        pub fn ctx(&mut self) -> PickContext<'_> {
            PickContext {
                registry: &self.registry,
                role: self.role,
                live: &mut self.live,
                response_times: &self.response_times,
                factory: &self.factory,
                props: &self.props,
                classifier: &self.classifier,
                max_attempts: self.max_attempts,
                blacklist_ttl: self.blacklist_ttl,
            }
        }
    }
}
