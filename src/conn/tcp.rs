/// TCP reachability probing for configured hosts
///
/// Used by the `relevo check` CLI command to report which configured
/// hosts currently accept connections. The probe opens and immediately
/// drops a raw TCP link; no protocol handshake is attempted.
use std::io;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::topology::HostSpec;

/// Result of a probe attempt
#[derive(Debug)]
pub enum ProbeResult {
    Reachable { rtt: Duration },
    Timeout,
    ConnectionRefused,
    NetworkError(io::Error),
}

impl ProbeResult {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeResult::Reachable { .. })
    }
}

/// Probes hosts with a bounded connect timeout
#[derive(Debug, Clone)]
pub struct HostProber {
    connect_timeout: Duration,
}

impl HostProber {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Attempt a TCP connection to the host
    pub async fn probe(&self, host: &HostSpec) -> ProbeResult {
        debug!("probing {}", host);
        let started = Instant::now();

        match timeout(
            self.connect_timeout,
            TcpStream::connect((host.host.as_str(), host.port)),
        )
        .await
        {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("failed to set nodelay on probe to {}: {}", host, e);
                }
                ProbeResult::Reachable {
                    rtt: started.elapsed(),
                }
            }
            Ok(Err(e)) => match e.kind() {
                io::ErrorKind::ConnectionRefused => {
                    debug!("connection refused by {}", host);
                    ProbeResult::ConnectionRefused
                }
                _ => {
                    debug!("network error probing {}: {}", host, e);
                    ProbeResult::NetworkError(e)
                }
            },
            Err(_) => {
                debug!("timeout probing {}", host);
                ProbeResult::Timeout
            }
        }
    }
}

impl Default for HostProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
