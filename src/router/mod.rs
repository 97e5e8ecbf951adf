/// Multi-host routing: the machinery underneath one logical connection
///
/// A router owns the currently-active physical connection plus a pool of
/// live connections to other hosts, intercepts every logical operation,
/// and on a connection-class fault invalidates the active link, asks the
/// balance strategy for a replacement, re-applies carried session state,
/// and retries or surfaces the fault. All router state is serialized
/// behind one mutex; internal helpers borrow the locked state instead of
/// re-locking, so nested steps never deadlock.
pub mod failover;
pub mod replication;

use fnv::FnvHashMap;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::balance::{BalanceStrategy, PickContext};
use crate::conn::{
    ConnectProperties, ConnectionFactory, ExecuteOutcome, PhysicalConnection, SessionState,
};
use crate::error::{DriverError, DriverResult, FaultClassifier};
use crate::topology::{HostRegistry, HostRole, HostSpec};

pub use failover::FailoverRouter;
pub use replication::ReplicationRouter;

/// Lifecycle of the routed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterPhase {
    /// No active physical connection yet
    Disconnected,
    /// An active physical connection is serving operations
    Connected,
    /// The active connection was invalidated; a replacement is pending
    Failing,
    /// The logical connection was closed
    Closed,
}

/// Tunables for one router
#[derive(Clone)]
pub struct RouterOptions {
    /// Attempt budget for operation retry and host selection
    pub retry_count: u32,
    /// How long a failed host stays excluded from selection
    pub blacklist_ttl: Duration,
    /// Allow swapping the active connection while a transaction is open
    pub failover_in_transaction: bool,
    /// Matching auto-commit statements before a proactive re-pick; 0 = off
    pub rebalance_threshold: u64,
    /// Only statements matching this pattern count toward the threshold
    pub rebalance_regex: Option<Regex>,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            retry_count: 5,
            blacklist_ttl: Duration::from_secs(5),
            failover_in_transaction: false,
            rebalance_threshold: 0,
            rebalance_regex: None,
        }
    }
}

/// The one logical operation entry point routed through the active connection
enum Op<'a> {
    Execute(&'a str),
    Ping,
    Commit,
    Rollback,
    /// Push the router's desired session state onto the active connection
    ApplySession,
}

struct RouterState {
    phase: RouterPhase,
    active: Option<HostSpec>,
    live: FnvHashMap<HostSpec, Box<dyn PhysicalConnection>>,
    /// Desired session state, re-applied across swaps
    session: SessionState,
    in_transaction: bool,
    response_times: FnvHashMap<HostSpec, Duration>,
    strategy: Box<dyn BalanceStrategy>,
    queries_since_failover: u64,
    rebalance_statements: u64,
}

pub(crate) struct RouterShared {
    registry: Arc<HostRegistry>,
    role: Option<HostRole>,
    factory: Arc<dyn ConnectionFactory>,
    props: ConnectProperties,
    classifier: FaultClassifier,
    options: RouterOptions,
    state: Mutex<RouterState>,
}

/// Routes the operations of one logical connection across a host set
#[derive(Clone)]
pub struct MultiHostRouter {
    shared: Arc<RouterShared>,
}

impl MultiHostRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<HostRegistry>,
        role: Option<HostRole>,
        strategy: Box<dyn BalanceStrategy>,
        factory: Arc<dyn ConnectionFactory>,
        props: ConnectProperties,
        classifier: FaultClassifier,
        options: RouterOptions,
    ) -> Self {
        Self {
            shared: Arc::new(RouterShared {
                registry,
                role,
                factory,
                props,
                classifier,
                options,
                state: Mutex::new(RouterState {
                    phase: RouterPhase::Disconnected,
                    active: None,
                    live: FnvHashMap::default(),
                    session: SessionState::default(),
                    in_transaction: false,
                    response_times: FnvHashMap::default(),
                    strategy,
                    queries_since_failover: 0,
                    rebalance_statements: 0,
                }),
            }),
        }
    }

    /// Establish the initial active connection
    pub async fn connect(&self) -> DriverResult<()> {
        let mut state = self.shared.state.lock().await;
        if state.phase == RouterPhase::Closed {
            return Err(DriverError::Closed);
        }
        if state.active.is_some() {
            return Ok(());
        }
        Self::pick_active(&self.shared, &mut state).await
    }

    pub async fn execute(&self, statement: &str) -> DriverResult<ExecuteOutcome> {
        let mut state = self.shared.state.lock().await;
        Self::dispatch(&self.shared, &mut state, Op::Execute(statement)).await
    }

    pub async fn ping(&self) -> DriverResult<()> {
        let mut state = self.shared.state.lock().await;
        Self::dispatch(&self.shared, &mut state, Op::Ping)
            .await
            .map(|_| ())
    }

    pub async fn commit(&self) -> DriverResult<()> {
        let mut state = self.shared.state.lock().await;
        Self::dispatch(&self.shared, &mut state, Op::Commit)
            .await
            .map(|_| ())
    }

    pub async fn rollback(&self) -> DriverResult<()> {
        let mut state = self.shared.state.lock().await;
        Self::dispatch(&self.shared, &mut state, Op::Rollback)
            .await
            .map(|_| ())
    }

    pub async fn set_autocommit(&self, on: bool) -> DriverResult<()> {
        let mut state = self.shared.state.lock().await;
        if state.phase == RouterPhase::Closed {
            return Err(DriverError::Closed);
        }
        state.session.autocommit = on;
        if on {
            state.in_transaction = false;
        }
        if state.active.is_some() {
            Self::dispatch(&self.shared, &mut state, Op::ApplySession).await?;
        }
        Ok(())
    }

    pub async fn set_read_only(&self, on: bool) -> DriverResult<()> {
        let mut state = self.shared.state.lock().await;
        if state.phase == RouterPhase::Closed {
            return Err(DriverError::Closed);
        }
        state.session.read_only = on;
        if state.active.is_some() {
            Self::dispatch(&self.shared, &mut state, Op::ApplySession).await?;
        }
        Ok(())
    }

    pub async fn set_statement_comment(&self, comment: Option<String>) -> DriverResult<()> {
        let mut state = self.shared.state.lock().await;
        if state.phase == RouterPhase::Closed {
            return Err(DriverError::Closed);
        }
        state.session.statement_comment = comment;
        if state.active.is_some() {
            Self::dispatch(&self.shared, &mut state, Op::ApplySession).await?;
        }
        Ok(())
    }

    /// Close the logical connection and every owned physical connection
    pub async fn close(&self) -> DriverResult<()> {
        let mut state = self.shared.state.lock().await;
        if state.phase == RouterPhase::Closed {
            return Ok(());
        }
        state.phase = RouterPhase::Closed;
        state.active = None;
        for (_, mut conn) in state.live.drain() {
            let _ = conn.close().await;
        }
        Ok(())
    }

    pub async fn phase(&self) -> RouterPhase {
        self.shared.state.lock().await.phase
    }

    pub async fn active_host(&self) -> Option<HostSpec> {
        self.shared.state.lock().await.active.clone()
    }

    pub async fn in_transaction(&self) -> bool {
        self.shared.state.lock().await.in_transaction
    }

    pub async fn session(&self) -> SessionState {
        self.shared.state.lock().await.session.clone()
    }

    /// Queries executed since the active connection was last swapped
    pub async fn queries_since_failover(&self) -> u64 {
        self.shared.state.lock().await.queries_since_failover
    }

    /// Last measured response time for a host, if any
    pub async fn response_time_of(&self, host: &HostSpec) -> Option<Duration> {
        self.shared.state.lock().await.response_times.get(host).copied()
    }

    pub fn registry(&self) -> Arc<HostRegistry> {
        Arc::clone(&self.shared.registry)
    }

    /// Switch the active connection to a specific host at a safe point.
    ///
    /// Used by the failover specialization to return to the primary. Fails
    /// without side effects when the host is unreachable or a transaction
    /// is open.
    pub(crate) async fn try_switch_to(&self, target: &HostSpec) -> DriverResult<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        if state.phase == RouterPhase::Closed {
            return Err(DriverError::Closed);
        }
        if state.in_transaction {
            return Err(DriverError::internal("cannot switch hosts mid-transaction"));
        }
        if state.active.as_ref() == Some(target) {
            return Ok(());
        }

        {
            let RouterState {
                live,
                response_times,
                ..
            } = &mut *state;
            let mut ctx = PickContext {
                registry: shared.registry.as_ref(),
                role: shared.role,
                live,
                response_times: &*response_times,
                factory: shared.factory.as_ref(),
                props: &shared.props,
                classifier: &shared.classifier,
                max_attempts: 1,
                blacklist_ttl: shared.options.blacklist_ttl,
            };
            ctx.acquire(target).await?;
        }

        Self::apply_session_to(shared, &mut state, target).await?;

        let old = state.active.replace(target.clone());
        state.phase = RouterPhase::Connected;
        state.queries_since_failover = 0;
        log::info!(
            "active connection switched{} to {}",
            old.map(|h| format!(" from {}", h)).unwrap_or_default(),
            target
        );
        Ok(())
    }

    /// React to a host being removed from the group topology.
    ///
    /// A gentle removal only drops the idle pooled connection; a forced
    /// one also invalidates an active connection to that host, so the
    /// next operation fails over.
    pub(crate) async fn drop_host(&self, host: &HostSpec, gently: bool) -> DriverResult<()> {
        let mut state = self.shared.state.lock().await;
        if state.phase == RouterPhase::Closed {
            return Ok(());
        }
        if state.active.as_ref() == Some(host) {
            if gently {
                tracing::debug!("leaving active connection to removed host {} in place", host);
                return Ok(());
            }
            Self::invalidate_active(&mut state).await;
        } else if let Some(mut conn) = state.live.remove(host) {
            let _ = conn.close().await;
        }
        Ok(())
    }

    /// Pull out any still-open connections without awaiting the router
    /// mutex; used by the leak reaper when a logical connection is
    /// dropped without close.
    pub(crate) fn salvage(&self) -> Vec<Box<dyn PhysicalConnection>> {
        match self.shared.state.try_lock() {
            Ok(mut state) => {
                state.phase = RouterPhase::Closed;
                state.active = None;
                state.live.drain().map(|(_, conn)| conn).collect()
            }
            Err(_) => Vec::new(),
        }
    }

    async fn dispatch(
        shared: &RouterShared,
        state: &mut RouterState,
        op: Op<'_>,
    ) -> DriverResult<ExecuteOutcome> {
        if state.phase == RouterPhase::Closed {
            return Err(DriverError::Closed);
        }

        let attempts = shared.options.retry_count;
        let mut last_err: Option<DriverError> = None;

        for _attempt in 0..attempts {
            if state.active.is_none() {
                match Self::pick_active(shared, state).await {
                    Ok(()) => {}
                    Err(e @ DriverError::Exhausted { .. }) => return Err(e),
                    Err(e) if shared.classifier.is_connection_error(&e) => {
                        last_err = Some(e);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let host = match state.active.clone() {
                Some(host) => host,
                None => continue,
            };

            let started = Instant::now();
            let result = {
                let RouterState { live, session, .. } = &mut *state;
                match live.get_mut(&host) {
                    Some(conn) => Self::run_op(conn, &op, session).await,
                    None => Err(DriverError::internal(
                        "active connection missing from live map",
                    )),
                }
            };
            let elapsed = started.elapsed().max(Duration::from_nanos(1));
            state.response_times.insert(host.clone(), elapsed);

            match result {
                Ok(outcome) => {
                    Self::after_success(shared, state, &op).await;
                    return Ok(outcome);
                }
                Err(e) if shared.classifier.is_connection_error(&e) => {
                    log::warn!("connection to {} failed during operation: {}", host, e);
                    Self::invalidate_active(state).await;
                    if state.in_transaction && !shared.options.failover_in_transaction {
                        // The transaction is lost with the link; surface the
                        // fault so the caller can decide, and let the next
                        // operation pick a replacement.
                        state.in_transaction = false;
                        return Err(e);
                    }
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(DriverError::exhausted(
            attempts,
            last_err.unwrap_or_else(|| DriverError::internal("retry budget spent")),
        ))
    }

    async fn run_op(
        conn: &mut Box<dyn PhysicalConnection>,
        op: &Op<'_>,
        session: &SessionState,
    ) -> DriverResult<ExecuteOutcome> {
        match op {
            Op::Execute(statement) => conn.execute(statement).await,
            Op::Ping => conn.ping().await.map(|_| ExecuteOutcome::default()),
            Op::Commit => conn.commit().await.map(|_| ExecuteOutcome::default()),
            Op::Rollback => conn.rollback().await.map(|_| ExecuteOutcome::default()),
            Op::ApplySession => conn
                .apply_session(session)
                .await
                .map(|_| ExecuteOutcome::default()),
        }
    }

    async fn after_success(shared: &RouterShared, state: &mut RouterState, op: &Op<'_>) {
        match op {
            Op::Execute(statement) => {
                state.queries_since_failover += 1;
                if !state.session.autocommit {
                    state.in_transaction = true;
                } else {
                    Self::maybe_rebalance(shared, state, statement).await;
                }
            }
            Op::Commit | Op::Rollback => {
                state.in_transaction = false;
            }
            Op::Ping | Op::ApplySession => {}
        }
    }

    /// Auto-commit triggered rebalancing: after the configured number of
    /// matching statements, proactively re-pick even without a failure.
    /// The old connection stays pooled in the live map.
    async fn maybe_rebalance(shared: &RouterShared, state: &mut RouterState, statement: &str) {
        let threshold = shared.options.rebalance_threshold;
        if threshold == 0 {
            return;
        }
        let counts = shared
            .options
            .rebalance_regex
            .as_ref()
            .map_or(true, |re| re.is_match(statement));
        if !counts {
            return;
        }

        state.rebalance_statements += 1;
        if state.rebalance_statements < threshold {
            return;
        }
        state.rebalance_statements = 0;

        tracing::debug!(
            "rebalancing after {} auto-commit statements on {}",
            threshold,
            state
                .active
                .as_ref()
                .map(|h| h.to_string())
                .unwrap_or_default()
        );
        state.active = None;
        state.phase = RouterPhase::Disconnected;
        if let Err(e) = Self::pick_active(shared, state).await {
            log::debug!("rebalance selection failed, deferring to next operation: {}", e);
        }
    }

    async fn invalidate_active(state: &mut RouterState) {
        if let Some(host) = state.active.take() {
            if let Some(mut conn) = state.live.remove(&host) {
                let _ = conn.close().await;
            }
            state.phase = RouterPhase::Failing;
        }
    }

    async fn pick_active(shared: &RouterShared, state: &mut RouterState) -> DriverResult<()> {
        let old = state.active.take();

        let host = {
            let RouterState {
                strategy,
                live,
                response_times,
                ..
            } = &mut *state;
            let mut ctx = PickContext {
                registry: shared.registry.as_ref(),
                role: shared.role,
                live,
                response_times: &*response_times,
                factory: shared.factory.as_ref(),
                props: &shared.props,
                classifier: &shared.classifier,
                max_attempts: shared.options.retry_count,
                blacklist_ttl: shared.options.blacklist_ttl,
            };
            strategy.pick(&mut ctx).await?
        };

        Self::apply_session_to(shared, &mut *state, &host).await?;

        state.queries_since_failover = 0;
        state.phase = RouterPhase::Connected;
        if old.as_ref() != Some(&host) {
            log::info!(
                "active connection switched{} to {}",
                old.map(|h| format!(" from {}", h)).unwrap_or_default(),
                host
            );
        }
        state.active = Some(host);
        Ok(())
    }

    /// Re-apply the carried session state onto the connection for `host`
    async fn apply_session_to(
        shared: &RouterShared,
        state: &mut RouterState,
        host: &HostSpec,
    ) -> DriverResult<()> {
        let RouterState { live, session, .. } = state;
        let Some(conn) = live.get_mut(host) else {
            return Err(DriverError::internal(
                "selected connection missing from live map",
            ));
        };
        if let Err(e) = conn.apply_session(session).await {
            if shared.classifier.is_connection_error(&e) {
                if let Some(mut dead) = live.remove(host) {
                    let _ = dead.close().await;
                }
                shared
                    .registry
                    .blacklist(host.clone(), shared.options.blacklist_ttl)
                    .await;
            }
            return Err(e);
        }
        Ok(())
    }
}
