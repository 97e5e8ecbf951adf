/// Physical connection boundary
///
/// The wire protocol, authentication, and the full data-access surface
/// live outside this crate. Routing only needs a way to create a
/// physical connection for a host, drive a handful of operations over
/// it, and carry session state across a failover swap — these traits
/// are that boundary.
pub mod tcp;

#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::DriverResult;
use crate::topology::HostSpec;

/// Session state that must survive a connection swap.
///
/// When the router replaces the active physical connection it re-applies
/// this state onto the replacement before resuming the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub autocommit: bool,
    pub read_only: bool,
    pub statement_comment: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            autocommit: true,
            read_only: false,
            statement_comment: None,
        }
    }
}

/// Options applied when materializing a new physical connection
#[derive(Debug, Clone)]
pub struct ConnectProperties {
    /// Bound on each individual connection-creation attempt
    pub connect_timeout: Duration,
    /// Opaque driver properties passed through to the protocol layer
    pub params: HashMap<String, String>,
}

impl Default for ConnectProperties {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            params: HashMap::new(),
        }
    }
}

/// Result of one executed statement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOutcome {
    pub rows_affected: u64,
}

/// One actual backend network session to a specific host
#[async_trait]
pub trait PhysicalConnection: Send + Sync {
    /// Host this connection is bound to
    fn host(&self) -> &HostSpec;

    async fn execute(&mut self, statement: &str) -> DriverResult<ExecuteOutcome>;

    async fn ping(&mut self) -> DriverResult<()>;

    async fn commit(&mut self) -> DriverResult<()>;

    async fn rollback(&mut self) -> DriverResult<()>;

    async fn close(&mut self) -> DriverResult<()>;

    /// Session state last applied to this connection
    fn session(&self) -> &SessionState;

    /// Re-apply carried session state (after a failover swap)
    async fn apply_session(&mut self, session: &SessionState) -> DriverResult<()>;
}

/// Factory materializing physical connections for host specs
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(
        &self,
        host: &HostSpec,
        props: &ConnectProperties,
    ) -> DriverResult<Box<dyn PhysicalConnection>>;
}
