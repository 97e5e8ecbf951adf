/// Uniform random strategy
use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;

use super::{BalanceStrategy, PickContext, RETRY_PAUSE};
use crate::error::{DriverError, DriverResult};
use crate::topology::HostSpec;

/// Uniform pick among non-blacklisted hosts.
///
/// A host that fails to connect is dropped from this selection's
/// candidate pool. When the pool runs dry the strategy pauses briefly
/// and refills from the full configured list.
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl RandomStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BalanceStrategy for RandomStrategy {
    async fn pick(&mut self, ctx: &mut PickContext<'_>) -> DriverResult<HostSpec> {
        let mut last_err: Option<DriverError> = None;

        let all = ctx.candidates().await;
        if all.is_empty() {
            return Err(DriverError::internal("no hosts configured"));
        }
        let excluded = ctx.excluded().await;
        let mut pool: Vec<HostSpec> = all
            .into_iter()
            .filter(|host| !excluded.contains(host))
            .collect();

        for _attempt in 0..ctx.max_attempts {
            if pool.is_empty() {
                sleep(RETRY_PAUSE).await;
                pool = ctx.candidates().await;
                if pool.is_empty() {
                    continue;
                }
            }

            let index = rand::thread_rng().gen_range(0..pool.len());
            let host = pool.swap_remove(index);

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
    use std::time::Duration;

    fn spec(name: &str) -> HostSpec {
        HostSpec::new(name, 3306)
    }

    #[tokio::test]
    async fn test_picks_among_configured_hosts() {
        let hosts = vec![spec("a"), spec("b"), spec("c")];
        let mut harness = PickHarness::new(hosts.clone());

        let mut strategy = RandomStrategy::new();
        let picked = strategy.pick(&mut harness.ctx()).await.unwrap();
        assert!(hosts.contains(&picked));
        assert!(harness.live.contains_key(&picked));
    }

    #[tokio::test]
    async fn test_blacklisted_hosts_not_in_pool() {
        let hosts = vec![spec("a"), spec("b")];
        let mut harness = PickHarness::new(hosts);
        harness
            .registry
            .blacklist(spec("a"), Duration::from_secs(60))
            .await;

        let mut strategy = RandomStrategy::new();
        for _ in 0..5 {
            let picked = strategy.pick(&mut harness.ctx()).await.unwrap();
            assert_eq!(picked, spec("b"));
        }
    }

    #[tokio::test]
    async fn test_empty_pool_refills_after_pause() {
        let hosts = vec![spec("a")];
        let mut harness = PickHarness::new(hosts);
        // Everything blacklisted: the snapshot clears the blacklist, but a
        // down host immediately re-empties the pool, forcing a refill.
        harness.factory.set_down(&spec("a"));
        harness.max_attempts = 3;

        let mut strategy = RandomStrategy::new();
        let started = std::time::Instant::now();
        let err = strategy.pick(&mut harness.ctx()).await.unwrap_err();
        assert!(matches!(err, DriverError::Exhausted { .. }));
        // At least one refill pause happened
        assert!(started.elapsed() >= RETRY_PAUSE);
    }

    #[tokio::test]
    async fn test_failed_host_removed_from_this_selection() {
        let hosts = vec![spec("a"), spec("b")];
        let mut harness = PickHarness::new(hosts);
        harness.factory.set_down(&spec("a"));

        let mut strategy = RandomStrategy::new();
        let picked = strategy.pick(&mut harness.ctx()).await.unwrap();
        assert_eq!(picked, spec("b"));

        // The down host was tried at most once before being dropped
        let attempts_on_a = harness
            .factory
            .connect_attempts()
            .iter()
            .filter(|h| **h == spec("a"))
            .count();
        assert!(attempts_on_a <= 1);
    }
}
