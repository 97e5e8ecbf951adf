/// Primary/secondary failover routing
///
/// Wraps a multi-host router whose selection order prefers the primary
/// host, and adds return-to-primary policy: once failed over to a
/// secondary, the router tracks elapsed time and query count, and at
/// transaction boundaries tries to swing the active connection back to
/// the primary.
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{MultiHostRouter, RouterPhase};
use crate::conn::{ExecuteOutcome, SessionState};
use crate::error::DriverResult;
use crate::topology::HostSpec;

/// When to retry the primary after failing over to a secondary.
/// A zero value disables that trigger.
#[derive(Debug, Clone)]
pub struct PrimaryRetryPolicy {
    pub seconds_before_retry: Duration,
    pub queries_before_retry: u64,
}

impl Default for PrimaryRetryPolicy {
    fn default() -> Self {
        Self {
            seconds_before_retry: Duration::from_secs(30),
            queries_before_retry: 50,
        }
    }
}

struct FailoverState {
    failed_over: bool,
    failed_at: Option<Instant>,
}

/// Router preferring a designated primary host
pub struct FailoverRouter {
    inner: MultiHostRouter,
    primary: HostSpec,
    policy: PrimaryRetryPolicy,
    state: Mutex<FailoverState>,
}

impl FailoverRouter {
    /// `inner` must select hosts primary-first (affinity order with the
    /// primary leading); `primary` is the preferred host to return to.
    pub fn new(primary: HostSpec, inner: MultiHostRouter, policy: PrimaryRetryPolicy) -> Self {
        Self {
            inner,
            primary,
            policy,
            state: Mutex::new(FailoverState {
                failed_over: false,
                failed_at: None,
            }),
        }
    }

    pub async fn connect(&self) -> DriverResult<()> {
        self.inner.connect().await?;
        self.note_position().await;
        Ok(())
    }

    pub async fn execute(&self, statement: &str) -> DriverResult<ExecuteOutcome> {
        let result = self.inner.execute(statement).await;
        self.note_position().await;
        if result.is_ok() && self.inner.session().await.autocommit {
            self.maybe_revert().await;
        }
        result
    }

    pub async fn ping(&self) -> DriverResult<()> {
        let result = self.inner.ping().await;
        self.note_position().await;
        if result.is_ok() && !self.inner.in_transaction().await {
            self.maybe_revert().await;
        }
        result
    }

    pub async fn commit(&self) -> DriverResult<()> {
        let result = self.inner.commit().await;
        self.note_position().await;
        if result.is_ok() {
            self.maybe_revert().await;
        }
        result
    }

    pub async fn rollback(&self) -> DriverResult<()> {
        let result = self.inner.rollback().await;
        self.note_position().await;
        if result.is_ok() {
            self.maybe_revert().await;
        }
        result
    }

    pub async fn set_autocommit(&self, on: bool) -> DriverResult<()> {
        self.inner.set_autocommit(on).await?;
        if on {
            self.maybe_revert().await;
        }
        Ok(())
    }

    pub async fn set_read_only(&self, on: bool) -> DriverResult<()> {
        self.inner.set_read_only(on).await
    }

    pub async fn set_statement_comment(&self, comment: Option<String>) -> DriverResult<()> {
        self.inner.set_statement_comment(comment).await
    }

    pub async fn close(&self) -> DriverResult<()> {
        self.inner.close().await
    }

    pub async fn phase(&self) -> RouterPhase {
        self.inner.phase().await
    }

    pub async fn active_host(&self) -> Option<HostSpec> {
        self.inner.active_host().await
    }

    pub async fn session(&self) -> SessionState {
        self.inner.session().await
    }

    pub async fn failed_over(&self) -> bool {
        self.state.lock().await.failed_over
    }

    pub async fn queries_since_failover(&self) -> u64 {
        self.inner.queries_since_failover().await
    }

    pub(crate) fn inner(&self) -> &MultiHostRouter {
        &self.inner
    }

    /// Track whether the active connection sits on the primary
    async fn note_position(&self) {
        let active = self.inner.active_host().await;
        let mut state = self.state.lock().await;
        match active {
            Some(host) if host != self.primary => {
                if !state.failed_over {
                    state.failed_over = true;
                    state.failed_at = Some(Instant::now());
                    log::warn!("failed over from primary {} to {}", self.primary, host);
                }
            }
            Some(_) => {
                if state.failed_over {
                    state.failed_over = false;
                    state.failed_at = None;
                }
            }
            None => {}
        }
    }

    /// At a safe point, swing back to the primary once a retry trigger fires
    async fn maybe_revert(&self) {
        let (failed_over, failed_at) = {
            let state = self.state.lock().await;
            (state.failed_over, state.failed_at)
        };
        if !failed_over {
            return;
        }
        if self.inner.in_transaction().await {
            return;
        }

        let due_time = self.policy.seconds_before_retry > Duration::ZERO
            && failed_at
                .map(|at| at.elapsed() >= self.policy.seconds_before_retry)
                .unwrap_or(false);
        let due_queries = self.policy.queries_before_retry > 0
            && self.inner.queries_since_failover().await >= self.policy.queries_before_retry;
        if !(due_time || due_queries) {
            return;
        }

        match self.inner.try_switch_to(&self.primary).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.failed_over = false;
                state.failed_at = None;
                log::info!("reverted to primary {}", self.primary);
            }
            Err(e) => {
                log::debug!("primary {} still unavailable: {}", self.primary, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::AffinityStrategy;
    use crate::conn::testing::StubFactory;
    use crate::conn::ConnectProperties;
    use crate::error::FaultClassifier;
    use crate::router::RouterOptions;
    use crate::topology::HostRegistry;
    use std::sync::Arc;

    fn spec(name: &str) -> HostSpec {
        HostSpec::new(name, 3306)
    }

    fn make_failover(
        hosts: Vec<HostSpec>,
        factory: &StubFactory,
        policy: PrimaryRetryPolicy,
    ) -> FailoverRouter {
        let registry = Arc::new(HostRegistry::load_balanced(hosts.clone()));
        let inner = MultiHostRouter::new(
            registry,
            None,
            Box::new(AffinityStrategy::new(hosts.clone())),
            Arc::new(factory.clone()),
            ConnectProperties::default(),
            FaultClassifier::default(),
            RouterOptions {
                // Short TTL so a recovered primary becomes selectable quickly
                blacklist_ttl: Duration::from_millis(20),
                ..Default::default()
            },
        );
        FailoverRouter::new(hosts[0].clone(), inner, policy)
    }

    #[tokio::test]
    async fn test_connect_prefers_primary() {
        let factory = StubFactory::new();
        let router = make_failover(
            vec![spec("primary"), spec("standby")],
            &factory,
            PrimaryRetryPolicy::default(),
        );

        router.connect().await.unwrap();
        assert_eq!(router.active_host().await, Some(spec("primary")));
        assert!(!router.failed_over().await);
    }

    #[tokio::test]
    async fn test_failover_sets_flag_and_resets_query_counter() {
        let factory = StubFactory::new();
        let router = make_failover(
            vec![spec("primary"), spec("standby")],
            &factory,
            PrimaryRetryPolicy::default(),
        );

        router.connect().await.unwrap();
        router.execute("SELECT 1").await.unwrap();

        factory.set_down(&spec("primary"));
        router.execute("SELECT 2").await.unwrap();

        assert_eq!(router.active_host().await, Some(spec("standby")));
        assert!(router.failed_over().await);
        // Reset on swap, then the retried query counted
        assert_eq!(router.queries_since_failover().await, 1);
    }

    #[tokio::test]
    async fn test_revert_to_primary_after_time_threshold() {
        let factory = StubFactory::new();
        let router = make_failover(
            vec![spec("primary"), spec("standby")],
            &factory,
            PrimaryRetryPolicy {
                seconds_before_retry: Duration::from_millis(10),
                queries_before_retry: 0,
            },
        );

        factory.set_down(&spec("primary"));
        router.connect().await.unwrap();
        assert!(router.failed_over().await);

        factory.set_up(&spec("primary"));
        tokio::time::sleep(Duration::from_millis(30)).await;

        router.execute("SELECT 1").await.unwrap();
        assert_eq!(router.active_host().await, Some(spec("primary")));
        assert!(!router.failed_over().await);
    }

    #[tokio::test]
    async fn test_revert_to_primary_after_query_threshold() {
        let factory = StubFactory::new();
        let router = make_failover(
            vec![spec("primary"), spec("standby")],
            &factory,
            PrimaryRetryPolicy {
                seconds_before_retry: Duration::ZERO,
                queries_before_retry: 2,
            },
        );

        factory.set_down(&spec("primary"));
        router.connect().await.unwrap();
        factory.set_up(&spec("primary"));

        router.execute("SELECT 1").await.unwrap();
        assert_eq!(router.active_host().await, Some(spec("standby")));

        // Second query reaches the threshold: reverted at the boundary
        router.execute("SELECT 2").await.unwrap();
        assert_eq!(router.active_host().await, Some(spec("primary")));
        assert!(!router.failed_over().await);
    }

    #[tokio::test]
    async fn test_no_revert_while_primary_still_down() {
        let factory = StubFactory::new();
        let router = make_failover(
            vec![spec("primary"), spec("standby")],
            &factory,
            PrimaryRetryPolicy {
                seconds_before_retry: Duration::from_millis(1),
                queries_before_retry: 1,
            },
        );

        factory.set_down(&spec("primary"));
        router.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        router.execute("SELECT 1").await.unwrap();
        assert_eq!(router.active_host().await, Some(spec("standby")));
        assert!(router.failed_over().await);
    }

    #[tokio::test]
    async fn test_revert_waits_for_transaction_boundary() {
        let factory = StubFactory::new();
        let router = make_failover(
            vec![spec("primary"), spec("standby")],
            &factory,
            PrimaryRetryPolicy {
                seconds_before_retry: Duration::from_millis(1),
                queries_before_retry: 0,
            },
        );

        factory.set_down(&spec("primary"));
        router.connect().await.unwrap();
        factory.set_up(&spec("primary"));
        tokio::time::sleep(Duration::from_millis(5)).await;

        router.set_autocommit(false).await.unwrap();
        router.execute("INSERT 1").await.unwrap();
        // Mid-transaction: still pinned to the standby
        assert_eq!(router.active_host().await, Some(spec("standby")));

        router.commit().await.unwrap();
        assert_eq!(router.active_host().await, Some(spec("primary")));
    }
}
