/// Best-response-time strategy
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;

use super::{BalanceStrategy, PickContext, RETRY_PAUSE};
use crate::error::{DriverError, DriverResult};
use crate::topology::HostSpec;

/// Picks the host with the lowest last-measured response time.
///
/// Hosts are scanned in registry order. A host that has never been
/// measured (response time of exactly zero) short-circuits the scan and
/// wins outright over any measured host — a cold host always beats a
/// warm one. Kept for compatibility with the classic driver behavior.
#[derive(Debug, Default)]
pub struct BestResponseTimeStrategy;

impl BestResponseTimeStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BalanceStrategy for BestResponseTimeStrategy {
    async fn pick(&mut self, ctx: &mut PickContext<'_>) -> DriverResult<HostSpec> {
        let mut last_err: Option<DriverError> = None;

        if ctx.candidates().await.is_empty() {
            return Err(DriverError::internal("no hosts configured"));
        }

        for _attempt in 0..ctx.max_attempts {
            let excluded = ctx.excluded().await;
            let hosts = ctx.candidates().await;

            let mut best: Option<(HostSpec, Duration)> = None;
            for host in &hosts {
                if excluded.contains(host) {
                    continue;
                }
                let response_time = ctx.response_time(host);
                if response_time == Duration::ZERO {
                    // Unmeasured host wins immediately
                    best = Some((host.clone(), response_time));
                    break;
                }
                match &best {
                    Some((_, best_time)) if response_time >= *best_time => {}
                    _ => best = Some((host.clone(), response_time)),
                }
            }

            let Some((host, _)) = best else {
                sleep(RETRY_PAUSE).await;
                continue;
            };

            match ctx.acquire(&host).await {
                Ok(()) => return Ok(host),
                Err(e) if ctx.classifier.is_connection_error(&e) => {
                    tracing::debug!("host {} failed, excluding: {}", host, e);
                    ctx.exclude(&host).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(DriverError::exhausted(
            ctx.max_attempts,
            last_err.unwrap_or_else(|| DriverError::internal("no candidate hosts available")),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::PickHarness;
    use super::*;

    fn spec(name: &str) -> HostSpec {
        HostSpec::new(name, 3306)
    }

    #[tokio::test]
    async fn test_unmeasured_host_beats_any_measured() {
        let hosts = vec![spec("a"), spec("b"), spec("c")];
        let mut harness = PickHarness::new(hosts);
        harness.set_response_time(spec("a"), 50);
        // b never measured
        harness.set_response_time(spec("c"), 30);

        let mut strategy = BestResponseTimeStrategy::new();
        let picked = strategy.pick(&mut harness.ctx()).await.unwrap();
        assert_eq!(picked, spec("b"));
    }

    #[tokio::test]
    async fn test_minimum_measured_wins_when_all_measured() {
        let hosts = vec![spec("a"), spec("b"), spec("c")];
        let mut harness = PickHarness::new(hosts);
        harness.set_response_time(spec("a"), 50);
        harness.set_response_time(spec("b"), 80);
        harness.set_response_time(spec("c"), 30);

        let mut strategy = BestResponseTimeStrategy::new();
        let picked = strategy.pick(&mut harness.ctx()).await.unwrap();
        assert_eq!(picked, spec("c"));
    }

    #[tokio::test]
    async fn test_blacklisted_host_is_skipped() {
        let hosts = vec![spec("a"), spec("b")];
        let mut harness = PickHarness::new(hosts);
        harness.set_response_time(spec("a"), 10);
        harness.set_response_time(spec("b"), 99);
        harness
            .registry
            .blacklist(spec("a"), Duration::from_secs(60))
            .await;

        let mut strategy = BestResponseTimeStrategy::new();
        let picked = strategy.pick(&mut harness.ctx()).await.unwrap();
        assert_eq!(picked, spec("b"));
    }

    #[tokio::test]
    async fn test_failed_best_host_is_excluded_and_next_best_tried() {
        let hosts = vec![spec("a"), spec("b")];
        let mut harness = PickHarness::new(hosts);
        harness.set_response_time(spec("a"), 10);
        harness.set_response_time(spec("b"), 99);
        harness.factory.set_down(&spec("a"));

        let mut strategy = BestResponseTimeStrategy::new();
        let picked = strategy.pick(&mut harness.ctx()).await.unwrap();
        assert_eq!(picked, spec("b"));
        assert!(harness.registry.is_blacklisted(&spec("a")).await);
    }
}
