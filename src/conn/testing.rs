/// Scripted connection stubs shared by the routing tests
///
/// The factory keeps a set of "down" hosts: connecting to a down host
/// fails, and already-open connections to a host that is taken down
/// start failing with a link error, which is how tests kill the active
/// connection underneath a router. Statements containing `boom-link`
/// or `boom-app` fail with a link fault or an application fault.
use async_trait::async_trait;
use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex};

use super::{
    ConnectProperties, ConnectionFactory, ExecuteOutcome, PhysicalConnection, SessionState,
};
use crate::error::{DriverError, DriverResult};
use crate::topology::HostSpec;

#[derive(Default)]
struct StubState {
    down: HashSet<HostSpec>,
    connects: Vec<HostSpec>,
    closes: Vec<HostSpec>,
}

#[derive(Clone, Default)]
pub struct StubFactory {
    state: Arc<Mutex<StubState>>,
}

impl StubFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_down<I: IntoIterator<Item = HostSpec>>(hosts: I) -> Self {
        let factory = Self::new();
        {
            let mut state = factory.state.lock().unwrap();
            state.down.extend(hosts);
        }
        factory
    }

    pub fn set_down(&self, host: &HostSpec) {
        self.state.lock().unwrap().down.insert(host.clone());
    }

    pub fn set_up(&self, host: &HostSpec) {
        self.state.lock().unwrap().down.remove(host);
    }

    /// Every connect attempt, in order, including failed ones
    pub fn connect_attempts(&self) -> Vec<HostSpec> {
        self.state.lock().unwrap().connects.clone()
    }

    /// Hosts whose connections were explicitly closed, in order
    pub fn closed_hosts(&self) -> Vec<HostSpec> {
        self.state.lock().unwrap().closes.clone()
    }
}

fn refused() -> DriverError {
    DriverError::Network(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "connection refused",
    ))
}

fn reset() -> DriverError {
    DriverError::Network(io::Error::new(
        io::ErrorKind::ConnectionReset,
        "connection reset",
    ))
}

#[async_trait]
impl ConnectionFactory for StubFactory {
    async fn connect(
        &self,
        host: &HostSpec,
        _props: &ConnectProperties,
    ) -> DriverResult<Box<dyn PhysicalConnection>> {
        let mut state = self.state.lock().unwrap();
        state.connects.push(host.clone());
        if state.down.contains(host) {
            return Err(refused());
        }
        Ok(Box::new(StubConnection {
            host: host.clone(),
            session: SessionState::default(),
            shared: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

pub struct StubConnection {
    host: HostSpec,
    session: SessionState,
    shared: Arc<Mutex<StubState>>,
    closed: bool,
}

impl StubConnection {
    fn check_link(&self) -> DriverResult<()> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        if self.shared.lock().unwrap().down.contains(&self.host) {
            return Err(reset());
        }
        Ok(())
    }
}

#[async_trait]
impl PhysicalConnection for StubConnection {
    fn host(&self) -> &HostSpec {
        &self.host
    }

    async fn execute(&mut self, statement: &str) -> DriverResult<ExecuteOutcome> {
        self.check_link()?;
        if statement.contains("boom-link") {
            return Err(DriverError::Network(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "broken pipe",
            )));
        }
        if statement.contains("boom-app") {
            return Err(DriverError::sql("duplicate key", Some("23000")));
        }
        Ok(ExecuteOutcome { rows_affected: 1 })
    }

    async fn ping(&mut self) -> DriverResult<()> {
        self.check_link()
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.check_link()
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.check_link()
    }

    async fn close(&mut self) -> DriverResult<()> {
        if !self.closed {
            self.closed = true;
            self.shared.lock().unwrap().closes.push(self.host.clone());
        }
        Ok(())
    }

    fn session(&self) -> &SessionState {
        &self.session
    }

    async fn apply_session(&mut self, session: &SessionState) -> DriverResult<()> {
        self.check_link()?;
        self.session = session.clone();
        Ok(())
    }
}
